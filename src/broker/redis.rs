//! Redis streams as the message queue.
//!
//! The queue is a stream key. Publishing is `XADD`. Consuming reads through a single consumer
//! group with `XREADGROUP ... COUNT 1` and no `BLOCK`, so an empty queue returns straight away;
//! the stream entry id doubles as the delivery tag, and `XACK` removes the entry from the group's
//! pending list.
//!
//! When a consumer crashes or leaves a message unacknowledged, the entry sits in the group's
//! pending list. Before reading new entries, every consume first tries `XAUTOCLAIM` on entries
//! idle for longer than [`MAX_MESSAGE_ACK_DURATION`], so any consumer in the group picks up what
//! another one dropped. A message getting processed twice is fine.
use std::sync::Arc;

use async_trait::async_trait;
use fred::{
    prelude::{ClientLike, RedisClient, RedisError, RedisErrorKind, RedisResult, StreamsInterface},
    types::{ClientState, MultipleOrderedPairs, RedisConfig},
};
use lazy_static::lazy_static;
use nanoid::nanoid;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    error::{BrokerError, ConfigError},
    retry::RetryPolicy,
    shutdown::StopCondition,
};

use super::{
    decoding::{ConsumerInfo, StreamEntry, XAutoClaimResponse, XReadGroupResponse, PAYLOAD_FIELD},
    with_reconnect, BrokerClient, BrokerConfig, Delivery, DeliveryTag, Envelope,
    MAX_MESSAGE_ACK_DURATION,
};

// A consumer group ensures each message is only delivered to one consumer. We use a single
// consumer group for all PV simulators.
const GROUP_NAME: &str = "pv-simulator";
// After a consumer has been idle for 8 minutes, we consider it crashed and remove it.
const MAX_CONSUMER_IDLE_MS: u64 = 8 * 60 * 1000;

lazy_static! {
    static ref CONSUMER_ID: String = nanoid!(4);
}

impl From<RedisError> for BrokerError {
    fn from(err: RedisError) -> Self {
        match err.kind() {
            RedisErrorKind::IO | RedisErrorKind::Timeout | RedisErrorKind::Canceled => {
                BrokerError::Connection(err.to_string())
            }
            RedisErrorKind::Parse => BrokerError::Decode(err.to_string()),
            _ => BrokerError::Other(err.to_string()),
        }
    }
}

pub struct RedisBroker {
    // Redis scans a finite number of pending entries per XAUTOCLAIM and hands back the id to
    // continue from. It wraps around to 0-0 once every pending entry was scanned.
    autoclaim_id: Mutex<String>,
    client: Mutex<Option<RedisClient>>,
    config: RedisConfig,
    queue_name: String,
    retry: RetryPolicy,
    stop: StopCondition,
}

impl RedisBroker {
    pub fn new(config: &BrokerConfig, stop: StopCondition) -> Result<Self, ConfigError> {
        let redis_config = RedisConfig::from_url(&config.uri)
            .map_err(|err| ConfigError::InvalidBrokerUri(err.to_string()))?;
        let host_hint = config
            .uri
            .rsplit_once('@')
            .map_or(config.uri.as_str(), |(_, host)| host);

        Ok(Self {
            autoclaim_id: Mutex::new("0-0".to_string()),
            client: Mutex::new(None),
            config: redis_config,
            queue_name: config.queue_name.clone(),
            retry: RetryPolicy::broker(host_hint),
            stop,
        })
    }

    pub fn from_config(
        config: &BrokerConfig,
        stop: StopCondition,
    ) -> Result<Arc<dyn BrokerClient>, ConfigError> {
        Ok(Arc::new(Self::new(config, stop)?))
    }

    async fn connect_new(&self) -> Result<RedisClient, BrokerError> {
        debug!(queue = self.queue_name, "connecting to redis");
        let client = RedisClient::new(self.config.clone(), None, None);
        client.connect();
        client.wait_for_connect().await?;
        self.ensure_consumer_group_exists(&client).await?;
        self.delete_dead_consumers(&client).await?;
        info!(queue = self.queue_name, "connected to redis");
        Ok(client)
    }

    // If no consumer group exists, create one, if it already exists, we'll get an error we can
    // ignore. MKSTREAM creates the stream too when nothing was published yet.
    #[instrument(skip_all)]
    async fn ensure_consumer_group_exists(&self, client: &RedisClient) -> Result<(), BrokerError> {
        let result: RedisResult<()> = client
            .xgroup_create(self.queue_name.as_str(), GROUP_NAME, "0", true)
            .await;

        if let Err(e) = result {
            if e.to_string().contains("BUSYGROUP") {
                // The group already exists. This is fine.
                debug!("consumer group already exists");
            } else {
                return Err(e.into());
            }
        }
        Ok(())
    }

    // A terminated consumer leaves its entry in the consumer group behind. Consumers which still
    // hold pending messages are kept until those are claimed by someone else.
    #[instrument(skip_all)]
    async fn delete_dead_consumers(&self, client: &RedisClient) -> Result<(), BrokerError> {
        let consumers: Vec<ConsumerInfo> = client
            .xinfo_consumers(self.queue_name.as_str(), GROUP_NAME)
            .await?;

        for consumer in consumers {
            if consumer.pending == 0 && consumer.idle > MAX_CONSUMER_IDLE_MS {
                info!(
                    name = consumer.name,
                    idle_seconds = consumer.idle / 1000,
                    "removing long-idle, likely dead consumer"
                );
                let _: u64 = client
                    .xgroup_delconsumer(
                        self.queue_name.as_str(),
                        GROUP_NAME,
                        consumer.name.as_str(),
                    )
                    .await?;
            } else {
                trace!(
                    name = consumer.name,
                    pending = consumer.pending,
                    idle = consumer.idle,
                    "consumer looks alive, leaving it"
                );
            }
        }

        Ok(())
    }

    /// The cached client, connecting first if there is none.
    async fn connection(&self) -> Result<RedisClient, BrokerError> {
        let mut cached = self.client.lock().await;
        match &*cached {
            Some(client) => {
                if client.is_connected() {
                    Ok(client.clone())
                } else {
                    Err(BrokerError::ConnectionClosed)
                }
            }
            None => {
                let client = self.connect_new().await?;
                *cached = Some(client.clone());
                Ok(client)
            }
        }
    }

    async fn send_once(&self, body: &str) -> Result<(), BrokerError> {
        let client = self.connection().await?;
        let pairs: Vec<(String, String)> = vec![(PAYLOAD_FIELD.into(), body.into())];
        let fields: MultipleOrderedPairs = pairs.try_into()?;
        let id: String = client
            .xadd(self.queue_name.as_str(), false, None, "*", fields)
            .await?;
        debug!(stream_id = id, "added message to stream");
        Ok(())
    }

    async fn ack_once(&self, delivery_tag: &DeliveryTag) -> Result<(), BrokerError> {
        let client = self.connection().await?;
        let acked: u64 = client
            .xack(self.queue_name.as_str(), GROUP_NAME, delivery_tag.0.as_str())
            .await?;
        if acked == 0 {
            warn!(%delivery_tag, "ack matched no pending message");
        }
        Ok(())
    }

    /// Claims one entry another consumer (or this one) left unacked past the deadline.
    async fn claim_idle(&self, client: &RedisClient) -> Result<Option<StreamEntry>, BrokerError> {
        let mut autoclaim_id = self.autoclaim_id.lock().await;
        let XAutoClaimResponse(next_autoclaim_id, entries) = client
            .xautoclaim(
                self.queue_name.as_str(),
                GROUP_NAME,
                &*CONSUMER_ID,
                MAX_MESSAGE_ACK_DURATION.as_millis() as u64,
                autoclaim_id.as_str(),
                Some(1),
                false,
            )
            .await?;
        *autoclaim_id = next_autoclaim_id;

        let claimed = entries.into_iter().next();
        if let Some(entry) = &claimed {
            info!(
                stream_id = entry.id,
                next_autoclaim_id = autoclaim_id.as_str(),
                "claimed message idle past its ack deadline"
            );
        }
        Ok(claimed)
    }

    async fn read_new(&self, client: &RedisClient) -> Result<Option<StreamEntry>, BrokerError> {
        let XReadGroupResponse(entries) = client
            .xreadgroup(
                GROUP_NAME,
                &*CONSUMER_ID,
                Some(1),
                None,
                false,
                self.queue_name.as_str(),
                // The > operator means we only get messages never delivered to this group.
                ">",
            )
            .await?;
        Ok(entries.into_iter().next())
    }

    async fn consume_once(&self, ack_on_receive: bool) -> Result<Option<Delivery>, BrokerError> {
        let client = self.connection().await?;
        let entry = match self.claim_idle(&client).await? {
            Some(entry) => Some(entry),
            None => self.read_new(&client).await?,
        };

        let Some(StreamEntry { id, payload }) = entry else {
            debug!("queue empty");
            return Ok(None);
        };

        let delivery_tag = DeliveryTag(id);
        let body = payload.unwrap_or_default();

        if ack_on_receive {
            self.ack_once(&delivery_tag).await?;
            Ok(Some(Delivery {
                body,
                delivery_tag: None,
            }))
        } else {
            Ok(Some(Delivery {
                body,
                delivery_tag: Some(delivery_tag),
            }))
        }
    }
}

#[async_trait]
impl BrokerClient for RedisBroker {
    #[instrument(skip_all, fields(id = %envelope.id))]
    async fn send(&self, envelope: &Envelope) -> Result<(), BrokerError> {
        let body = envelope.to_wire()?;
        with_reconnect(self, &self.retry, &self.stop, "publish", || {
            self.send_once(&body)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn consume(&self, ack_on_receive: bool) -> Result<Option<Delivery>, BrokerError> {
        with_reconnect(self, &self.retry, &self.stop, "consume", || {
            self.consume_once(ack_on_receive)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn ack(&self, delivery_tag: &DeliveryTag) -> Result<(), BrokerError> {
        with_reconnect(self, &self.retry, &self.stop, "ack", || {
            self.ack_once(delivery_tag)
        })
        .await
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        let mut cached = self.client.lock().await;
        let usable = cached.as_ref().map_or(false, ClientLike::is_connected);
        if !usable {
            if let Some(stale) = cached.take() {
                debug!("dropping closed redis client");
                // Stop the stale client's connection task from lingering.
                let _ = stale.quit().await;
            }
            *cached = Some(self.connect_new().await?);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut cached = self.client.lock().await;
        let Some(client) = cached.take() else {
            debug!("no redis connection to close");
            return Ok(());
        };

        match client.state() {
            ClientState::Disconnecting => {
                let err = BrokerError::WrongState("connection is already closing".into());
                error!(%err, "error trying to close connection to redis");
                Ok(())
            }
            ClientState::Disconnected => {
                debug!("redis connection already closed");
                Ok(())
            }
            _ => {
                client.quit().await?;
                info!("closed redis connection");
                Ok(())
            }
        }
    }
}
