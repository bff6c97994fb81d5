//! The PV side: turns meter readings into combined meter + PV records.
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Timelike};
use tracing::{debug, error, info, warn};

use crate::{
    broker::{self, BrokerClient, BrokerConnector, Delivery, Envelope, MAX_MESSAGE_ACK_DURATION},
    env::InvalidMessagePolicy,
    interpolation::PowerCurve,
    results::{ResultRecord, ResultSink},
    shutdown::ShutdownCoordinator,
};

pub const TICK: Duration = Duration::from_secs(2);

pub fn minute_of_day(now: &DateTime<Local>) -> i64 {
    (now.hour() * 60 + now.minute()) as i64
}

/// Validates a single delivery and writes its record. Broker-agnostic, the loop feeds it.
pub struct MessageProcessor<S> {
    curve: PowerCurve,
    policy: InvalidMessagePolicy,
    sink: S,
}

impl<S: ResultSink> MessageProcessor<S> {
    pub fn new(curve: PowerCurve, sink: S, policy: InvalidMessagePolicy) -> Self {
        Self {
            curve,
            policy,
            sink,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Returns the written record, or `None` when the payload was invalid.
    pub async fn process(
        &mut self,
        broker: &dyn BrokerClient,
        delivery: Delivery,
        now: DateTime<Local>,
    ) -> Result<Option<ResultRecord>> {
        let envelope = match Envelope::from_delivery(&delivery) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%err, body = delivery.body, "received invalid message");
                discard(self.policy, broker, &delivery).await?;
                return Ok(None);
            }
        };

        let minute = minute_of_day(&now);
        let pv_power = self.curve.value(minute);
        let record = ResultRecord::from_watts(now, envelope.meter_power, pv_power);
        self.sink.write(&record).context("failed to write result record")?;

        debug!(
            id = %envelope.id,
            minute,
            meter_kw = record.meter_kw,
            pv_kw = record.pv_kw,
            "processed meter reading"
        );

        if let Some(delivery_tag) = &envelope.delivery_tag {
            broker.ack(delivery_tag).await?;
        }

        Ok(Some(record))
    }
}

async fn discard(
    policy: InvalidMessagePolicy,
    broker: &dyn BrokerClient,
    delivery: &Delivery,
) -> Result<()> {
    let Some(delivery_tag) = &delivery.delivery_tag else {
        return Ok(());
    };

    match policy {
        InvalidMessagePolicy::AckAndDrop => {
            broker.ack(delivery_tag).await?;
            info!(%delivery_tag, "acknowledged invalid message, dropping it");
        }
        InvalidMessagePolicy::Requeue => {
            info!(
                %delivery_tag,
                redeliver_after_s = MAX_MESSAGE_ACK_DURATION.as_secs(),
                "leaving invalid message unacknowledged"
            );
        }
    }
    Ok(())
}

pub struct ConsumerLoop<S> {
    connect: BrokerConnector,
    coordinator: ShutdownCoordinator,
    processor: MessageProcessor<S>,
    tick: Duration,
}

impl<S: ResultSink> ConsumerLoop<S> {
    pub fn new(
        coordinator: ShutdownCoordinator,
        connect: BrokerConnector,
        processor: MessageProcessor<S>,
    ) -> Self {
        Self {
            connect,
            coordinator,
            processor,
            tick: TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Polls until cancelled or out of execution budget, then closes the broker. Returns the
    /// processor so callers can inspect what was written.
    pub async fn run(self) -> Result<MessageProcessor<S>> {
        let Self {
            connect,
            coordinator,
            mut processor,
            tick,
        } = self;

        let stop = coordinator.stop_condition();
        let broker = coordinator
            .shielded(async { connect(stop.clone()) })
            .await
            .context("failed to build broker client")?;

        info!(tick_ms = tick.as_millis() as u64, "pv simulator started");

        loop {
            if coordinator.is_cancelled() {
                info!("pv simulator cancelled");
                break;
            }

            match broker.consume(false).await {
                Ok(Some(delivery)) => {
                    if let Err(err) = processor.process(&*broker, delivery, Local::now()).await {
                        error!(err = format!("{err:#}"), "failed to process message");
                    }
                }
                Ok(None) => debug!("no message waiting"),
                Err(err) if err.is_retry_exhausted() => {
                    info!(%err, "stopped waiting for the broker");
                    break;
                }
                Err(err) => error!(%err, "failed to consume message"),
            }

            if coordinator.must_exit() {
                break;
            }

            stop.sleep(tick).await;
        }

        coordinator.shielded(broker::close_quietly(&*broker)).await;
        info!("pv simulator stopped");
        Ok(processor)
    }
}
