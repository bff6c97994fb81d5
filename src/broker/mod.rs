//! Message broker access.
//!
//! [`BrokerClient`] is the capability both services share: publish on the meter side, consume
//! and ack on the PV side, close on both. Implementations are picked by name through
//! [`build_broker`], an unknown name is a [`ConfigError`] before anything gets constructed.
//!
//! Connections are created lazily on first use. When an operation fails with a transient error,
//! [`with_reconnect`] reconnects and retries it under the client's [`RetryPolicy`] until it
//! succeeds or the client's [`StopCondition`] is met.
//!
//! Delivery is at least once. A message that is consumed but not acknowledged within
//! [`MAX_MESSAGE_ACK_DURATION`] is handed out again, to whichever consumer asks next.
mod decoding;
pub mod memory;
pub mod redis;

use std::{
    fmt::{self, Display, Formatter},
    future::Future,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    error::{BrokerError, ConfigError},
    retry::{RetryPolicy, Transient},
    shutdown::StopCondition,
};

pub use memory::MemoryBroker;
pub use redis::RedisBroker;

// Consumers claim messages which others have failed to acknowledge for longer than this limit.
pub const MAX_MESSAGE_ACK_DURATION: Duration = Duration::from_secs(60);

/// Broker-assigned handle of a received, not yet acknowledged message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub String);

impl Display for DeliveryTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A meter reading on the wire: `{ "meter_power": <number>, "id": "<uuid>" }`.
///
/// The delivery tag only exists locally on the receiving side and is never serialized.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Envelope {
    pub meter_power: f64,
    pub id: Uuid,
    #[serde(skip)]
    pub delivery_tag: Option<DeliveryTag>,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("expected a v4 uuid id, got version {0}")]
    UnexpectedIdVersion(usize),
}

impl Envelope {
    /// An envelope that has not been tagged with an id yet.
    pub fn new(meter_power: f64) -> Self {
        Self {
            meter_power,
            id: Uuid::nil(),
            delivery_tag: None,
        }
    }

    /// Tags the envelope with a fresh id, for tracing, not for deduplication.
    pub fn tagged(mut self) -> Self {
        self.id = Uuid::new_v4();
        self
    }

    pub fn to_wire(&self) -> Result<String, BrokerError> {
        serde_json::to_string(self).map_err(|e| BrokerError::Other(e.to_string()))
    }

    /// Validates a received payload and attaches its delivery tag.
    pub fn from_delivery(delivery: &Delivery) -> Result<Self, PayloadError> {
        let mut envelope: Envelope = serde_json::from_str(&delivery.body)?;
        let version = envelope.id.get_version_num();
        if version != 4 {
            return Err(PayloadError::UnexpectedIdVersion(version));
        }
        envelope.delivery_tag = delivery.delivery_tag.clone();
        Ok(envelope)
    }
}

/// A raw message as fetched from the broker, not validated yet.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub body: String,
    pub delivery_tag: Option<DeliveryTag>,
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Tags `envelope` with a fresh id and sends it. Returns the id.
    async fn publish(&self, envelope: Envelope) -> Result<Uuid, BrokerError> {
        let envelope = envelope.tagged();
        self.send(&envelope).await?;
        info!(id = %envelope.id, "message was successfully sent");
        Ok(envelope.id)
    }

    /// Writes an already tagged envelope to the queue.
    async fn send(&self, envelope: &Envelope) -> Result<(), BrokerError>;

    /// Fetches at most one pending message, never blocking when there is none.
    ///
    /// With `ack_on_receive` the message is acknowledged before it is returned, otherwise the
    /// delivery tag is attached so the caller can [`BrokerClient::ack`] later.
    async fn consume(&self, ack_on_receive: bool) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery_tag: &DeliveryTag) -> Result<(), BrokerError>;

    /// Establishes a connection if there is none or the cached one is closed.
    async fn reconnect(&self) -> Result<(), BrokerError>;

    /// Idempotent.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Runs `op`, and on a transient failure keeps reconnecting and re-running it under `retry`.
pub(crate) async fn with_reconnect<C, T, F, Fut>(
    client: &C,
    retry: &RetryPolicy,
    stop: &StopCondition,
    operation: &'static str,
    op: F,
) -> Result<T, BrokerError>
where
    C: BrokerClient + ?Sized,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(err) if err.is_transient() => {
            error!(operation, error = %err, "broker operation failed, reconnecting");
            let op = &op;
            retry
                .execute(
                    move || async move {
                        client.reconnect().await?;
                        op().await
                    },
                    stop,
                )
                .await
                .map_err(|err| BrokerError::from_retry(operation, err))
        }
        Err(err) => Err(err),
    }
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub uri: String,
    pub queue_name: String,
}

impl BrokerConfig {
    pub fn new(uri: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            queue_name: queue_name.into(),
        }
    }
}

pub type BrokerFactory =
    fn(&BrokerConfig, StopCondition) -> Result<Arc<dyn BrokerClient>, ConfigError>;

pub const REDIS_BROKER: &str = "redis";
pub const MEMORY_BROKER: &str = "memory";

const BROKER_REGISTRY: [(&str, BrokerFactory); 2] = [
    (REDIS_BROKER, RedisBroker::from_config),
    (MEMORY_BROKER, MemoryBroker::from_config),
];

pub fn broker_names() -> Vec<&'static str> {
    BROKER_REGISTRY.iter().map(|(name, _)| *name).collect()
}

fn find_factory(kind: &str) -> Result<BrokerFactory, ConfigError> {
    BROKER_REGISTRY
        .iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, factory)| *factory)
        .ok_or_else(|| ConfigError::UnknownBrokerType(kind.to_string(), broker_names().join(", ")))
}

/// Builds the broker client registered under `kind`.
pub fn build_broker(
    kind: &str,
    config: &BrokerConfig,
    stop: StopCondition,
) -> Result<Arc<dyn BrokerClient>, ConfigError> {
    let factory = find_factory(kind)?;
    info!(kind, queue = config.queue_name, "building broker client");
    factory(config, stop)
}

/// Builds a broker client once the caller knows what should stop its retries.
pub type BrokerConnector =
    Box<dyn FnOnce(StopCondition) -> Result<Arc<dyn BrokerClient>, ConfigError> + Send>;

/// Looks up `kind` now, builds the client later.
pub fn connector(kind: &str, config: BrokerConfig) -> Result<BrokerConnector, ConfigError> {
    let factory = find_factory(kind)?;
    let kind = kind.to_string();
    Ok(Box::new(move |stop| {
        info!(kind, queue = config.queue_name, "building broker client");
        factory(&config, stop)
    }))
}

/// Closes `broker`, logging instead of returning any error.
pub async fn close_quietly(broker: &dyn BrokerClient) {
    match broker.close().await {
        Ok(()) => debug!("broker connection closed"),
        Err(err) => error!(%err, "failed to close broker connection"),
    }
}
