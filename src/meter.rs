//! The meter side: generates random power readings and feeds them to the publisher worker.
use std::{
    fmt::{self, Display, Formatter},
    time::Duration,
};

use anyhow::{Context, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, error, info};

use crate::{
    broker::{self, BrokerConnector},
    channel::{BoundedChannel, READINGS_QUEUE_CAPACITY},
    publisher::{PublisherWorker, WorkerHandle},
    retry::{RetryError, RetryPolicy},
    shutdown::{ShutdownCoordinator, StopCondition},
};

pub const MIN_METER_VALUE: u32 = 0;
pub const MAX_METER_VALUE: u32 = 9000;

pub const TICK: Duration = Duration::from_secs(2);
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Instantaneous consumption in watts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reading(u32);

impl Reading {
    pub fn new(watts: u32) -> Option<Self> {
        (MIN_METER_VALUE..=MAX_METER_VALUE)
            .contains(&watts)
            .then_some(Self(watts))
    }

    pub fn watts(&self) -> u32 {
        self.0
    }
}

impl Display for Reading {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}W", self.0)
    }
}

impl From<Reading> for f64 {
    fn from(reading: Reading) -> Self {
        reading.0 as f64
    }
}

/// Uniformly distributed readings, independent across ticks.
pub struct RandomReadings {
    rng: StdRng,
}

impl RandomReadings {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomReadings {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for RandomReadings {
    type Item = Reading;

    fn next(&mut self) -> Option<Reading> {
        Some(Reading(
            self.rng.gen_range(MIN_METER_VALUE..=MAX_METER_VALUE),
        ))
    }
}

pub struct ProducerLoop<I> {
    capacity: usize,
    connect: BrokerConnector,
    coordinator: ShutdownCoordinator,
    push_retry: RetryPolicy,
    readings: I,
    tick: Duration,
}

impl<I> ProducerLoop<I>
where
    I: Iterator<Item = Reading>,
{
    pub fn new(coordinator: ShutdownCoordinator, connect: BrokerConnector, readings: I) -> Self {
        Self {
            capacity: READINGS_QUEUE_CAPACITY,
            connect,
            coordinator,
            push_retry: RetryPolicy::queue_full(),
            readings,
            tick: TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Runs until cancelled, until the readings run out, or until the queue stays full past the
    /// stop condition. The worker is always stopped and the broker closed before returning.
    pub async fn run(self) -> Result<()> {
        let Self {
            capacity,
            connect,
            coordinator,
            push_retry,
            mut readings,
            tick,
        } = self;

        let channel = BoundedChannel::new(capacity);

        let worker = coordinator
            .shielded(async {
                let token = coordinator.token().child_token();
                let broker = connect(StopCondition::on_cancel(token.clone()))?;
                anyhow::Ok(PublisherWorker::new(channel.clone(), token, broker).spawn())
            })
            .await
            .context("failed to start publisher worker")?;

        info!(capacity = channel.capacity(), tick_ms = tick.as_millis() as u64, "meter started");

        let stop = coordinator.stop_condition();
        loop {
            if coordinator.is_cancelled() {
                info!("meter cancelled");
                break;
            }

            let Some(reading) = readings.next() else {
                info!("no more readings to send");
                break;
            };

            let pushed = push_retry
                .execute(|| channel.push(reading, PUSH_TIMEOUT), &stop)
                .await;
            match pushed {
                Ok(()) => debug!(%reading, queued = channel.len(), "queued reading"),
                Err(RetryError::Exhausted { attempts, .. }) => {
                    info!(attempts, "readings queue stayed full until stop, ending meter");
                    break;
                }
                Err(RetryError::Permanent(err)) => {
                    error!(%err, "unable to queue reading, ending meter");
                    break;
                }
            }

            stop.sleep(tick).await;

            if coordinator.must_exit() {
                break;
            }
        }

        coordinator.shielded(shut_down(worker)).await;
        info!("meter stopped");
        Ok(())
    }
}

/// Stops the worker, waits for it, then closes the broker it was publishing through.
async fn shut_down(worker: WorkerHandle) {
    let broker = worker.broker();
    worker.stop();
    match worker.join().await {
        Ok(state) => debug!(?state, "publisher worker joined"),
        Err(err) => error!(%err, "publisher worker did not shut down cleanly"),
    }
    broker::close_quietly(&*broker).await;
}
