use thiserror::Error;

use crate::retry::{RetryError, Transient};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("readings queue is full")]
    Full,
    #[error("readings queue is empty")]
    Empty,
    #[error("readings queue is closed")]
    Closed,
}

impl Transient for ChannelError {
    fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Full)
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),
    #[error("broker connection is closed")]
    ConnectionClosed,
    #[error("broker connection in wrong state: {0}")]
    WrongState(String),
    #[error("failed to decode broker response: {0}")]
    Decode(String),
    #[error("gave up on {operation} after {attempts} attempts")]
    RetryExhausted {
        operation: &'static str,
        attempts: u32,
    },
    #[error("broker error: {0}")]
    Other(String),
}

impl Transient for BrokerError {
    fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::ConnectionClosed)
    }
}

impl BrokerError {
    pub fn from_retry(operation: &'static str, err: RetryError<BrokerError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, .. } => BrokerError::RetryExhausted {
                operation,
                attempts,
            },
            RetryError::Permanent(err) => err,
        }
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, BrokerError::RetryExhausted { .. })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown broker type: {0}, expected one of {1}")]
    UnknownBrokerType(String, String),
    #[error("invalid broker uri: {0}")]
    InvalidBrokerUri(String),
}
