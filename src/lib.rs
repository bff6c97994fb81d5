//! # Powerflow
//! Simulates a household energy pipeline. A meter publishes random power readings over a message
//! queue, a PV simulator consumes them, adds the simulated output of a solar installation for the
//! current time of day, and appends the combined values to a results file.
//!
//! ## Architecture
//! The meter side runs two tasks:
//! - A producer loop which generates a reading every tick and pushes it into a bounded channel.
//! - A publisher worker which drains the channel and publishes each reading to the broker.
//!
//! The PV side runs a single consumer loop which polls the broker, interpolates PV power from a
//! breakpoint table, writes a result record, and acknowledges the message.
//!
//! Both sides shut down cooperatively. Connection setup and teardown are shielded from interrupts,
//! these are replayed as soon as the critical section ends.
pub mod broker;
pub mod channel;
pub mod cli;
pub mod env;
pub mod error;
pub mod interpolation;
pub mod log;
pub mod meter;
pub mod publisher;
pub mod pv;
pub mod results;
pub mod retry;
pub mod shutdown;

use anyhow::Result;

use broker::{BrokerConfig, BrokerConnector};
use env::ENV_CONFIG;

/// A connector for the broker configured in the environment.
pub fn env_broker_connector() -> Result<BrokerConnector> {
    let config = BrokerConfig::new(&ENV_CONFIG.broker_uri, &ENV_CONFIG.queue_name);
    Ok(broker::connector(&ENV_CONFIG.broker_type, config)?)
}
