//! In-process broker.
//!
//! Queues live in memory and are shared by name, so a meter and a PV simulator running in the
//! same process can talk through `BROKER_TYPE=memory`. Each [`MemoryBroker`] is its own client
//! with its own connection state, which tests use to inject connection failures.
//!
//! Unacknowledged messages behave like a consumer group's pending entries: once idle for
//! [`MAX_MESSAGE_ACK_DURATION`] any client may claim them, and closing a client puts the
//! messages it still holds back at the front of the queue.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use lazy_static::lazy_static;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    error::{BrokerError, ConfigError},
    retry::RetryPolicy,
    shutdown::StopCondition,
};

use super::{
    with_reconnect, BrokerClient, BrokerConfig, Delivery, DeliveryTag, Envelope,
    MAX_MESSAGE_ACK_DURATION,
};

lazy_static! {
    static ref NAMED_QUEUES: Mutex<HashMap<String, Arc<Mutex<QueueState>>>> =
        Mutex::new(HashMap::new());
}

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
struct Unacked {
    body: String,
    delivered_at: Instant,
    owner: u64,
    sequence: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<String>,
    unacked: HashMap<DeliveryTag, Unacked>,
    next_tag: u64,
}

impl QueueState {
    /// Hands the oldest message left unacked past the deadline over to `owner`.
    fn claim_idle(&mut self, owner: u64) -> Option<(DeliveryTag, String)> {
        let now = Instant::now();
        let (delivery_tag, entry) = self
            .unacked
            .iter_mut()
            .filter(|(_, entry)| now.duration_since(entry.delivered_at) >= MAX_MESSAGE_ACK_DURATION)
            .min_by_key(|(_, entry)| entry.sequence)?;

        debug!(
            %delivery_tag,
            previous_owner = entry.owner,
            "claimed message idle past its ack deadline"
        );
        entry.owner = owner;
        entry.delivered_at = now;
        Some((delivery_tag.clone(), entry.body.clone()))
    }

    fn deliver_next(&mut self, owner: u64) -> Option<(DeliveryTag, String)> {
        let body = self.ready.pop_front()?;
        self.next_tag += 1;
        let delivery_tag = DeliveryTag(self.next_tag.to_string());
        self.unacked.insert(
            delivery_tag.clone(),
            Unacked {
                body: body.clone(),
                delivered_at: Instant::now(),
                owner,
                sequence: self.next_tag,
            },
        );
        Some((delivery_tag, body))
    }

    /// Puts every message `owner` still holds back at the front, in delivery order.
    fn release(&mut self, owner: u64) -> usize {
        let mut held: Vec<(u64, DeliveryTag)> = self
            .unacked
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(delivery_tag, entry)| (entry.sequence, delivery_tag.clone()))
            .collect();
        held.sort_unstable_by_key(|(sequence, _)| *sequence);

        let count = held.len();
        for (_, delivery_tag) in held.into_iter().rev() {
            if let Some(entry) = self.unacked.remove(&delivery_tag) {
                self.ready.push_front(entry.body);
            }
        }
        count
    }
}

#[derive(Debug, Default)]
struct ConnectionState {
    connected: bool,
    failures_to_inject: u32,
}

pub struct MemoryBroker {
    id: u64,
    queue: Arc<Mutex<QueueState>>,
    connection: Mutex<ConnectionState>,
    observer: Option<mpsc::UnboundedSender<Envelope>>,
    retry: RetryPolicy,
    stop: StopCondition,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A client on a fresh, unnamed queue.
    pub fn new() -> Self {
        Self::with_queue(Arc::new(Mutex::new(QueueState::default())))
    }

    /// A client on the process-wide queue called `name`.
    pub fn on_queue(name: &str) -> Self {
        let queue = NAMED_QUEUES
            .lock()
            .expect("unable to lock named queues")
            .entry(name.to_string())
            .or_default()
            .clone();
        Self::with_queue(queue)
    }

    fn with_queue(queue: Arc<Mutex<QueueState>>) -> Self {
        Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            queue,
            connection: Mutex::new(ConnectionState::default()),
            observer: None,
            retry: RetryPolicy::broker("memory"),
            stop: StopCondition::never(),
        }
    }

    pub fn from_config(
        config: &BrokerConfig,
        stop: StopCondition,
    ) -> Result<Arc<dyn BrokerClient>, ConfigError> {
        Ok(Arc::new(Self::on_queue(&config.queue_name).with_stop(stop)))
    }

    /// Another client on the same queue.
    pub fn client(&self) -> Self {
        Self::with_queue(self.queue.clone())
    }

    /// Forwards every sent envelope to `observer`.
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<Envelope>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_stop(mut self, stop: StopCondition) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Makes the next `count` connection attempts fail with a connection error.
    pub fn inject_failures(&self, count: u32) {
        self.connection
            .lock()
            .expect("unable to lock connection state")
            .failures_to_inject = count;
    }

    /// Enqueues a body as is, skipping envelope serialization.
    pub fn push_raw(&self, body: impl Into<String>) {
        self.lock_queue().ready.push_back(body.into());
    }

    /// Messages waiting to be consumed.
    pub fn pending(&self) -> usize {
        self.lock_queue().ready.len()
    }

    /// Messages consumed but not acknowledged yet.
    pub fn unacked(&self) -> usize {
        self.lock_queue().unacked.len()
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .expect("unable to lock connection state")
            .connected
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.queue.lock().expect("unable to lock memory queue")
    }

    fn connect(&self) -> Result<(), BrokerError> {
        let mut connection = self
            .connection
            .lock()
            .expect("unable to lock connection state");
        if connection.failures_to_inject > 0 {
            connection.failures_to_inject -= 1;
            connection.connected = false;
            return Err(BrokerError::Connection("injected connection failure".into()));
        }
        if !connection.connected {
            debug!("connected to memory broker");
            connection.connected = true;
        }
        Ok(())
    }

    async fn send_once(&self, envelope: &Envelope) -> Result<(), BrokerError> {
        self.connect()?;
        let body = envelope.to_wire()?;
        self.lock_queue().ready.push_back(body);
        if let Some(observer) = &self.observer {
            // The observer going away only means nobody is watching anymore.
            let _ = observer.send(envelope.clone());
        }
        Ok(())
    }

    async fn consume_once(&self, ack_on_receive: bool) -> Result<Option<Delivery>, BrokerError> {
        self.connect()?;
        let mut queue = self.lock_queue();
        let claimed = queue
            .claim_idle(self.id)
            .or_else(|| queue.deliver_next(self.id));
        let Some((delivery_tag, body)) = claimed else {
            return Ok(None);
        };

        if ack_on_receive {
            queue.unacked.remove(&delivery_tag);
            return Ok(Some(Delivery {
                body,
                delivery_tag: None,
            }));
        }

        Ok(Some(Delivery {
            body,
            delivery_tag: Some(delivery_tag),
        }))
    }

    async fn ack_once(&self, delivery_tag: &DeliveryTag) -> Result<(), BrokerError> {
        self.connect()?;
        if self.lock_queue().unacked.remove(delivery_tag).is_none() {
            warn!(%delivery_tag, "ack matched no pending message");
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn send(&self, envelope: &Envelope) -> Result<(), BrokerError> {
        with_reconnect(self, &self.retry, &self.stop, "publish", || {
            self.send_once(envelope)
        })
        .await
    }

    async fn consume(&self, ack_on_receive: bool) -> Result<Option<Delivery>, BrokerError> {
        with_reconnect(self, &self.retry, &self.stop, "consume", || {
            self.consume_once(ack_on_receive)
        })
        .await
    }

    async fn ack(&self, delivery_tag: &DeliveryTag) -> Result<(), BrokerError> {
        with_reconnect(self, &self.retry, &self.stop, "ack", || {
            self.ack_once(delivery_tag)
        })
        .await
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        self.connect()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let released = self.lock_queue().release(self.id);
        if released > 0 {
            info!(count = released, "returned unacknowledged messages to the queue");
        }

        let mut connection = self
            .connection
            .lock()
            .expect("unable to lock connection state");
        if connection.connected {
            connection.connected = false;
            info!("closed memory broker connection");
        } else {
            debug!("memory broker connection already closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn publish_consume_ack() {
        let producer = MemoryBroker::new();
        let consumer = producer.client();

        let id = producer.publish(Envelope::new(1500.0)).await.unwrap();
        assert_eq!(consumer.pending(), 1);

        let delivery = consumer.consume(false).await.unwrap().unwrap();
        let envelope = Envelope::from_delivery(&delivery).unwrap();
        assert_eq!(envelope.id, id);
        assert_eq!(envelope.meter_power, 1500.0);
        assert_eq!(consumer.unacked(), 1);

        consumer
            .ack(envelope.delivery_tag.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(consumer.unacked(), 0);
        assert_eq!(consumer.consume(false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn ack_on_receive_leaves_nothing_unacked() {
        let broker = MemoryBroker::new();
        broker.publish(Envelope::new(1.0)).await.unwrap();

        let delivery = broker.consume(true).await.unwrap().unwrap();
        assert_eq!(delivery.delivery_tag, None);
        assert_eq!(broker.unacked(), 0);
    }

    #[tokio::test]
    async fn named_queues_are_shared() {
        let config = BrokerConfig::new("memory://", "memory-named-queue-test");
        let producer = MemoryBroker::from_config(&config, StopCondition::never()).unwrap();
        let consumer = MemoryBroker::on_queue("memory-named-queue-test");

        producer.publish(Envelope::new(42.0)).await.unwrap();
        assert_eq!(consumer.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_injected_failures() {
        let broker = MemoryBroker::new().with_retry(RetryPolicy::fixed(
            Duration::from_millis(10),
            "memory broker unavailable",
        ));
        broker.inject_failures(3);

        let started = tokio::time::Instant::now();
        broker.publish(Envelope::new(7.0)).await.unwrap();
        assert_eq!(broker.pending(), 1);
        assert!(broker.is_connected());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_message_is_redelivered_after_ack_deadline() {
        let producer = MemoryBroker::new();
        let crashed = producer.client();
        let survivor = producer.client();
        producer.publish(Envelope::new(250.0)).await.unwrap();

        let first = crashed.consume(false).await.unwrap().unwrap();
        assert_eq!(survivor.consume(false).await.unwrap(), None);

        tokio::time::advance(MAX_MESSAGE_ACK_DURATION).await;

        let second = survivor.consume(false).await.unwrap().unwrap();
        assert_eq!(second, first);
        assert_eq!(survivor.unacked(), 1);

        survivor
            .ack(second.delivery_tag.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(survivor.unacked(), 0);

        tokio::time::advance(MAX_MESSAGE_ACK_DURATION).await;
        assert_eq!(crashed.consume(false).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn acked_message_is_not_redelivered() {
        let broker = MemoryBroker::new();
        broker.publish(Envelope::new(3.0)).await.unwrap();
        let delivery = broker.consume(false).await.unwrap().unwrap();
        broker.ack(delivery.delivery_tag.as_ref().unwrap()).await.unwrap();

        tokio::time::advance(MAX_MESSAGE_ACK_DURATION * 2).await;
        assert_eq!(broker.client().consume(false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn closing_returns_held_messages_in_order() {
        let producer = MemoryBroker::new();
        for watts in [1.0, 2.0, 3.0] {
            producer.publish(Envelope::new(watts)).await.unwrap();
        }

        let consumer = producer.client();
        let first = consumer.consume(false).await.unwrap().unwrap();
        let second = consumer.consume(false).await.unwrap().unwrap();
        consumer.close().await.unwrap();
        assert_eq!(producer.unacked(), 0);
        assert_eq!(producer.pending(), 3);

        let next = producer.client();
        let bodies: Vec<String> = [
            next.consume(true).await.unwrap().unwrap(),
            next.consume(true).await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|delivery| delivery.body)
        .collect();
        assert_eq!(bodies, vec![first.body, second.body]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_reconnecting_once_stopped() {
        let token = CancellationToken::new();
        let broker = MemoryBroker::new().with_stop(StopCondition::on_cancel(token.clone()));
        broker.inject_failures(u32::MAX);
        token.cancel();

        let err = broker.publish(Envelope::new(7.0)).await.unwrap_err();
        assert!(err.is_retry_exhausted());
        assert_eq!(broker.pending(), 0);
    }

    #[tokio::test]
    async fn observer_sees_sent_envelopes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let broker = MemoryBroker::new().with_observer(tx);
        let id = broker.publish(Envelope::new(100.0)).await.unwrap();

        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.id, id);
        assert_eq!(seen.meter_power, 100.0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let broker = MemoryBroker::new();
        broker.publish(Envelope::new(1.0)).await.unwrap();
        broker.close().await.unwrap();
        broker.close().await.unwrap();
        assert!(!broker.is_connected());
    }
}
