//! Cooperative shutdown.
//!
//! Every loop in the pipeline holds a [`CancellationToken`] and checks it at the top of each
//! iteration and after each blocking call. External interrupts (SIGINT, SIGTERM, SIGQUIT) do not
//! cancel the token directly, they go through [`ShutdownCoordinator::interrupt`]. While a shielded
//! section is running, the interrupt is held back and replayed once the last [`ShieldGuard`] is
//! dropped, so broker connections are never left half-open or half-closed.
//!
//! The coordinator also tracks the optional execution budget (24 hours of running). The budget is
//! advisory: loops check it once per tick, nothing is preempted.

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Local};
use tokio::{select, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::results::TIMESTAMP_FORMAT;

pub const EXECUTION_BUDGET_HOURS: i64 = 24;

/// Wall-clock execution budget.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    started_at: DateTime<Local>,
    stop_at: DateTime<Local>,
}

impl Deadline {
    pub fn after(budget: chrono::Duration) -> Self {
        let started_at = Local::now();
        Self {
            started_at,
            stop_at: started_at + budget,
        }
    }

    pub fn execution_budget() -> Self {
        Self::after(chrono::Duration::hours(EXECUTION_BUDGET_HOURS))
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn is_exceeded(&self) -> bool {
        Local::now() > self.stop_at
    }
}

/// Answers "should we stop retrying / looping" for a single operation.
///
/// Met once the token is cancelled, or once the deadline has passed.
#[derive(Clone, Debug, Default)]
pub struct StopCondition {
    cancel: Option<CancellationToken>,
    deadline: Option<Deadline>,
}

impl StopCondition {
    pub fn never() -> Self {
        Self::default()
    }

    pub fn on_cancel(token: CancellationToken) -> Self {
        Self {
            cancel: Some(token),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Deadline>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, CancellationToken::is_cancelled)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.deadline.as_ref().map_or(false, Deadline::is_exceeded)
    }

    pub fn is_met(&self) -> bool {
        self.is_cancelled() || self.is_deadline_exceeded()
    }

    /// Sleeps for `duration`, waking early if the token gets cancelled. Returns whether the
    /// condition is met after waking.
    pub async fn sleep(&self, duration: Duration) -> bool {
        match &self.cancel {
            Some(token) => {
                select! {
                    _ = token.cancelled() => {}
                    _ = sleep(duration) => {}
                }
            }
            None => sleep(duration).await,
        }
        self.is_met()
    }
}

#[derive(Debug, Default)]
struct ShieldState {
    depth: usize,
    pending_interrupt: bool,
}

/// Owns the process-wide cancellation token, the shield state, and the execution budget.
#[derive(Clone, Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    shield: Arc<Mutex<ShieldState>>,
    deadline: Option<Deadline>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ShutdownCoordinator {
    pub fn new(deadline: Option<Deadline>) -> Self {
        Self {
            token: CancellationToken::new(),
            shield: Arc::new(Mutex::new(ShieldState::default())),
            deadline,
        }
    }

    /// A coordinator with the 24h budget when `must_exit_after_24h` is set.
    pub fn with_execution_budget(must_exit_after_24h: bool) -> Self {
        Self::new(must_exit_after_24h.then(Deadline::execution_budget))
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn stop_condition(&self) -> StopCondition {
        StopCondition::on_cancel(self.token()).with_deadline(self.deadline)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Checks the execution budget, logging when it has run out.
    pub fn must_exit(&self) -> bool {
        match &self.deadline {
            Some(deadline) if deadline.is_exceeded() => {
                info!(
                    started_at = %deadline.started_at().format(TIMESTAMP_FORMAT),
                    now = %Local::now().format(TIMESTAMP_FORMAT),
                    "aborting execution after {EXECUTION_BUDGET_HOURS}h running"
                );
                true
            }
            _ => false,
        }
    }

    /// Requests cancellation. Deferred while any shield is held.
    pub fn interrupt(&self) {
        let mut shield = self.shield.lock().expect("unable to lock shield state");
        if shield.depth > 0 {
            warn!("interrupt received during a critical section, deferring it");
            shield.pending_interrupt = true;
        } else {
            info!("interrupt received, shutting down");
            self.token.cancel();
        }
    }

    pub fn shield(&self) -> ShieldGuard {
        let mut shield = self.shield.lock().expect("unable to lock shield state");
        shield.depth += 1;
        debug!(depth = shield.depth, "entering critical section");
        ShieldGuard {
            token: self.token.clone(),
            shield: self.shield.clone(),
        }
    }

    /// Runs `future` to completion with interrupts deferred, whatever way it exits.
    pub async fn shielded<F: Future>(&self, future: F) -> F::Output {
        let _guard = self.shield();
        future.await
    }

    /// Forwards OS termination signals to [`ShutdownCoordinator::interrupt`].
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(err) = wait_for_shutdown_signal().await {
                    warn!(%err, "unable to listen for shutdown signals");
                    return;
                }
                coordinator.interrupt();
            }
        })
    }
}

/// Leaves the critical section on drop and replays a deferred interrupt.
#[must_use = "the critical section ends as soon as the guard is dropped"]
pub struct ShieldGuard {
    token: CancellationToken,
    shield: Arc<Mutex<ShieldState>>,
}

impl Drop for ShieldGuard {
    fn drop(&mut self) {
        // Drop can run during a panic unwind, avoid a double panic on a poisoned lock.
        let mut shield = match self.shield.lock() {
            Ok(shield) => shield,
            Err(poisoned) => poisoned.into_inner(),
        };
        shield.depth = shield.depth.saturating_sub(1);
        debug!(depth = shield.depth, "leaving critical section");
        if shield.depth == 0 && shield.pending_interrupt {
            shield.pending_interrupt = false;
            warn!("replaying interrupt deferred during critical section");
            self.token.cancel();
        }
    }
}

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    select! {
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_outside_shield_cancels_immediately() {
        let coordinator = ShutdownCoordinator::default();
        coordinator.interrupt();
        assert!(coordinator.is_cancelled());
    }

    #[test]
    fn interrupt_inside_shield_is_deferred_until_guard_drops() {
        let coordinator = ShutdownCoordinator::default();
        let guard = coordinator.shield();
        coordinator.interrupt();
        assert!(!coordinator.is_cancelled());
        drop(guard);
        assert!(coordinator.is_cancelled());
    }

    #[test]
    fn nested_shields_replay_after_outermost() {
        let coordinator = ShutdownCoordinator::default();
        let outer = coordinator.shield();
        let inner = coordinator.shield();
        coordinator.interrupt();
        coordinator.interrupt();
        drop(inner);
        assert!(!coordinator.is_cancelled());
        drop(outer);
        assert!(coordinator.is_cancelled());
    }

    #[test]
    fn shield_without_interrupt_does_not_cancel() {
        let coordinator = ShutdownCoordinator::default();
        drop(coordinator.shield());
        assert!(!coordinator.is_cancelled());
    }

    #[tokio::test]
    async fn shielded_replays_on_error_exit() {
        let coordinator = ShutdownCoordinator::default();
        let result: Result<(), &str> = coordinator
            .shielded(async {
                coordinator.interrupt();
                assert!(!coordinator.is_cancelled());
                Err("setup failed")
            })
            .await;
        assert!(result.is_err());
        assert!(coordinator.is_cancelled());
    }

    #[test]
    fn deadline_in_the_past_is_exceeded() {
        let deadline = Deadline::after(chrono::Duration::seconds(-1));
        assert!(deadline.is_exceeded());
        let coordinator = ShutdownCoordinator::new(Some(deadline));
        assert!(coordinator.must_exit());
        assert!(coordinator.stop_condition().is_met());
    }

    #[test]
    fn no_budget_never_exits() {
        let coordinator = ShutdownCoordinator::with_execution_budget(false);
        assert!(!coordinator.must_exit());
        assert!(!coordinator.stop_condition().is_met());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_condition_sleep_wakes_on_cancel() {
        let token = CancellationToken::new();
        let stop = StopCondition::on_cancel(token.clone());
        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let started = tokio::time::Instant::now();
        assert!(stop.sleep(Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
        canceller.await.unwrap();
    }
}
