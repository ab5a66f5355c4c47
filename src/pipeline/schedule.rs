use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;

use crate::cancel::CancelToken;
use crate::error::Error;
use crate::pipeline::Coordinator;

/// Counts of what happened while a [`Scheduler`] was running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleStats {
    pub ticks: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Ticks skipped because another run held the lock.
    pub skipped_busy: u64,
}

/// Fixed-interval trigger for [`Coordinator::run`].
///
/// The first run starts immediately. Failures are logged and the next tick
/// proceeds as usual; there is no retry beyond the regular schedule.
pub struct Scheduler {
    coordinator: Arc<Coordinator>,
    interval: Duration,
    days_back: u32,
}

impl Scheduler {
    pub fn new(coordinator: Arc<Coordinator>, interval: Duration, days_back: u32) -> Self {
        Self {
            coordinator,
            interval,
            days_back,
        }
    }

    /// Run until `shutdown` fires. A run in flight at shutdown is cancelled
    /// and allowed to roll back before this returns.
    pub async fn run_until(&self, shutdown: &CancelToken) -> ScheduleStats {
        let mut stats = ScheduleStats::default();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        log::info!(
            "Scheduler started: every {}s, days_back={}",
            self.interval.as_secs(),
            self.days_back
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            stats.ticks += 1;

            let run_token = CancelToken::new();
            let run = self
                .coordinator
                .run_with_cancel(self.days_back, run_token.clone());
            tokio::pin!(run);

            let result = tokio::select! {
                res = &mut run => res,
                _ = shutdown.cancelled() => {
                    run_token.cancel();
                    run.await
                }
            };

            match result {
                Ok(summary) => {
                    stats.succeeded += 1;
                    log::info!(
                        "Scheduled run {} wrote {} of {} records",
                        summary.run_id,
                        summary.records_written,
                        summary.records_fetched
                    );
                }
                Err(Error::RunAlreadyInProgress) => {
                    stats.skipped_busy += 1;
                    log::warn!("Scheduled run skipped: another run is in progress");
                }
                Err(e) => {
                    stats.failed += 1;
                    log::error!("Scheduled run failed [{}]: {e}", e.kind());
                }
            }
        }

        log::info!(
            "Scheduler stopped after {} ticks ({} ok, {} failed, {} skipped)",
            stats.ticks,
            stats.succeeded,
            stats.failed,
            stats.skipped_busy
        );
        stats
    }
}
