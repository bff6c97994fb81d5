use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{
        mpsc::{self, error::SendTimeoutError},
        Mutex,
    },
    time::timeout,
};

use crate::error::ChannelError;

/// Capacity of the readings queue between the producer loop and the publisher worker.
pub const READINGS_QUEUE_CAPACITY: usize = 50;

/// Fixed-capacity FIFO hand-off. Clones share the same queue, so any number of tasks may push
/// and pop concurrently.
#[derive(Debug)]
pub struct BoundedChannel<T> {
    capacity: usize,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
    tx: mpsc::Sender<T>,
}

impl<T> Clone for BoundedChannel<T> {
    fn clone(&self) -> Self {
        Self {
            capacity: self.capacity,
            rx: self.rx.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<T> BoundedChannel<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            capacity,
            rx: Arc::new(Mutex::new(rx)),
            tx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits at most `wait` for a free slot.
    pub async fn push(&self, item: T, wait: Duration) -> Result<(), ChannelError> {
        self.tx.send_timeout(item, wait).await.map_err(|err| match err {
            SendTimeoutError::Timeout(_) => ChannelError::Full,
            SendTimeoutError::Closed(_) => ChannelError::Closed,
        })
    }

    /// Waits at most `wait` for an item. Time spent waiting for another popper counts too.
    pub async fn pop(&self, wait: Duration) -> Result<T, ChannelError> {
        let received = timeout(wait, async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        })
        .await;

        match received {
            Err(_elapsed) => Err(ChannelError::Empty),
            Ok(None) => Err(ChannelError::Closed),
            Ok(Some(item)) => Ok(item),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn full_after_capacity_pushes_until_a_pop() {
        let channel = BoundedChannel::new(3);
        assert_eq!(channel.capacity(), 3);
        for value in 0..3 {
            channel.push(value, SHORT).await.unwrap();
        }
        assert_eq!(channel.len(), 3);

        assert_eq!(channel.push(3, SHORT).await, Err(ChannelError::Full));

        assert_eq!(channel.pop(SHORT).await, Ok(0));
        channel.push(3, SHORT).await.unwrap();
        assert_eq!(channel.len(), 3);
    }

    #[tokio::test]
    async fn pop_on_empty_times_out() {
        let channel: BoundedChannel<u32> = BoundedChannel::new(READINGS_QUEUE_CAPACITY);
        assert!(channel.is_empty());
        assert_eq!(channel.pop(SHORT).await, Err(ChannelError::Empty));
    }

    #[tokio::test]
    async fn preserves_fifo_order_across_clones() {
        let producer = BoundedChannel::new(READINGS_QUEUE_CAPACITY);
        let consumer = producer.clone();
        for value in [5, 1, 4, 2] {
            producer.push(value, SHORT).await.unwrap();
        }

        let mut popped = Vec::new();
        while let Ok(value) = consumer.pop(SHORT).await {
            popped.push(value);
        }
        assert_eq!(popped, vec![5, 1, 4, 2]);
    }

    #[tokio::test]
    async fn blocked_push_completes_when_slot_frees() {
        let channel = BoundedChannel::new(1);
        channel.push(1, SHORT).await.unwrap();

        let popper = channel.clone();
        let pop = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            popper.pop(SHORT).await
        });

        channel.push(2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(pop.await.unwrap(), Ok(1));
        assert_eq!(channel.pop(SHORT).await, Ok(2));
    }
}
