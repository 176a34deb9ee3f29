//! Cancellable periodic task.
//!
//! Both timer-driven loops (recorder flush, replication pull) run on a
//! [`PeriodicTask`]. Ticks come from `tokio::time`, so tests drive them with a
//! paused clock and `tokio::time::advance`.
//!
//! Stopping is cooperative: [`PeriodicTask::stop`] never interrupts a pass that is
//! already running. It waits for it, runs one final pass, then returns.

use std::{future::Future, ops::ControlFlow, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Shortest period a task runs at; shorter requests are raised to it.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawns `pass` every `period` (at least [`MIN_PERIOD`]), first tick immediately.
    ///
    /// The loop ends on its own when a pass returns [`ControlFlow::Break`]; in that
    /// case there is no final pass.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut pass: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(period.max(MIN_PERIOD));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        tracing::debug!(task = name, "final pass");
                        let _ = pass().await;
                        break;
                    }
                    _ = ticker.tick() => {
                        if pass().await.is_break() {
                            tracing::debug!(task = name, "task finished");
                            break;
                        }
                    }
                }
            }
        });
        Self {
            name,
            cancel,
            handle,
        }
    }

    /// True once the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Requests a final pass and waits for the loop to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(task = self.name, error = %e, "periodic task panicked");
        }
    }

    /// Waits for the loop to end by itself.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::error!(task = self.name, error = %e, "periodic task panicked");
        }
    }
}
