//! Drains the readings queue into the broker.
//!
//! The worker runs as its own task and owns the three things it needs: the channel handle, its
//! cancellation token, and the broker client. A failure to publish a single reading is logged and
//! the worker moves on, it never takes the task down.
use std::{sync::Arc, time::Duration};

use futures::{select, FutureExt};
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    broker::{BrokerClient, Envelope},
    channel::BoundedChannel,
    error::ChannelError,
    meter::Reading,
};

/// How long a single pop waits for a reading.
pub const POP_TIMEOUT: Duration = Duration::from_secs(1);
/// How long the worker waits on its stop signal between iterations.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    WaitingForItem,
    Publishing,
    Stopped,
}

pub struct PublisherWorker {
    broker: Arc<dyn BrokerClient>,
    channel: BoundedChannel<Reading>,
    token: CancellationToken,
}

impl PublisherWorker {
    pub fn new(
        channel: BoundedChannel<Reading>,
        token: CancellationToken,
        broker: Arc<dyn BrokerClient>,
    ) -> Self {
        Self {
            broker,
            channel,
            token,
        }
    }

    pub fn spawn(self) -> WorkerHandle {
        let (state_tx, state_rx) = watch::channel(WorkerState::Idle);
        let token = self.token.clone();
        let broker = self.broker.clone();
        let join = tokio::spawn(self.run(state_tx));

        WorkerHandle {
            broker,
            join,
            state: state_rx,
            token,
        }
    }

    async fn run(self, state: watch::Sender<WorkerState>) {
        info!("publisher worker started");

        while !self.token.is_cancelled() {
            state.send_replace(WorkerState::WaitingForItem);
            match self.channel.pop(POP_TIMEOUT).await {
                Ok(reading) => {
                    state.send_replace(WorkerState::Publishing);
                    self.publish(reading).await;
                }
                Err(ChannelError::Closed) => {
                    warn!("readings queue closed, stopping publisher worker");
                    break;
                }
                Err(err) => trace!(%err, "no reading to publish"),
            }
            state.send_replace(WorkerState::Idle);

            let stopped = select! {
                _ = self.token.cancelled().fuse() => true,
                _ = sleep(STOP_POLL_INTERVAL).fuse() => false,
            };
            if stopped {
                break;
            }
        }

        state.send_replace(WorkerState::Stopped);
        info!("publisher worker stopped");
    }

    async fn publish(&self, reading: Reading) {
        match self.broker.publish(Envelope::new(reading.into())).await {
            Ok(id) => debug!(%id, %reading, "published reading"),
            Err(err) if err.is_retry_exhausted() => {
                // Only happens once a stop was requested.
                warn!(%err, %reading, "gave up publishing reading");
            }
            Err(err) => error!(%err, %reading, "failed to publish reading"),
        }
    }
}

pub struct WorkerHandle {
    broker: Arc<dyn BrokerClient>,
    join: JoinHandle<()>,
    state: watch::Receiver<WorkerState>,
    token: CancellationToken,
}

impl WorkerHandle {
    pub fn stop(&self) {
        debug!("requesting publisher worker stop");
        self.token.cancel();
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// The broker client the worker publishes through.
    pub fn broker(&self) -> Arc<dyn BrokerClient> {
        self.broker.clone()
    }

    /// Waits for the task to end and returns the state it ended in.
    pub async fn join(self) -> Result<WorkerState, JoinError> {
        let Self { join, state, .. } = self;
        join.await?;
        let state = *state.borrow();
        Ok(state)
    }
}
