use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};

use crate::cancel::CancelToken;
use crate::date_util::today;
use crate::error::{Error, Result};
use crate::fetch::MetricsFetcher;
use crate::metrics::MetricRecord;
use crate::pipeline::{RunState, RunSummary};
use crate::storage::repository::UpsertReport;
use crate::storage::store::RunOutcome;
use crate::storage::MetricStore;
use crate::window::DateWindow;

/// Runs fetch-then-persist for a trailing window, one run at a time.
///
/// Every trigger (on-demand or scheduled) goes through [`Coordinator::run`].
/// A run requested while another is active fails immediately with
/// [`Error::RunAlreadyInProgress`]; runs are never queued.
pub struct Coordinator {
    fetcher: Arc<dyn MetricsFetcher>,
    store: MetricStore,
    fetch_timeout: Duration,
    run_lock: Arc<Semaphore>,
    state: watch::Sender<RunState>,
    active: Mutex<Option<CancelToken>>,
}

impl Coordinator {
    pub fn new(fetcher: Arc<dyn MetricsFetcher>, store: MetricStore, fetch_timeout: Duration) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            fetcher,
            store,
            fetch_timeout,
            run_lock: Arc::new(Semaphore::new(1)),
            state,
            active: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &MetricStore {
        &self.store
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Cancel the active run, if any. Returns whether a run was active.
    pub fn cancel(&self) -> bool {
        match self.active.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn run(&self, days_back: u32) -> Result<RunSummary> {
        self.run_with_cancel(days_back, CancelToken::new()).await
    }

    /// Fetch `[today - days_back, today]` and persist it in one transaction.
    ///
    /// Errors from the fetcher and the store are returned unchanged after the
    /// run is recorded as failed. Nothing is retried here.
    pub async fn run_with_cancel(&self, days_back: u32, cancel: CancelToken) -> Result<RunSummary> {
        let window = DateWindow::trailing(days_back, today())?;

        let _permit = Arc::clone(&self.run_lock)
            .try_acquire_owned()
            .map_err(|_| Error::RunAlreadyInProgress)?;
        let _active = ActiveRun::register(&self.active, cancel.clone());

        let started = Instant::now();
        self.transition(RunState::Fetching);
        log::info!("Starting run for {window} (days_back={days_back})");

        let run_id = match self.store.begin_run(days_back, window).await {
            Ok(id) => id,
            Err(e) => {
                self.transition(RunState::Failed);
                log::error!("Run failed before fetching [{}]: {e}", e.kind());
                return Err(e);
            }
        };

        let mut records_fetched = 0;
        let result = self.execute(&window, &cancel, &mut records_fetched).await;
        let duration = started.elapsed();

        match result {
            Ok(report) => {
                self.record(
                    run_id,
                    RunOutcome::Completed {
                        records_fetched,
                        report,
                    },
                    duration,
                )
                .await;
                self.transition(RunState::Done);
                log::info!(
                    "Run {run_id} done in {}ms: fetched {records_fetched}, inserted {}, updated {}, skipped {}",
                    duration.as_millis(),
                    report.inserted,
                    report.updated,
                    report.skipped_duplicate
                );
                Ok(RunSummary {
                    run_id,
                    window,
                    records_fetched,
                    records_written: report.written(),
                    records_inserted: report.inserted,
                    records_updated: report.updated,
                    skipped_duplicate: report.skipped_duplicate,
                    duration,
                })
            }
            Err(e) => {
                self.transition(RunState::Failed);
                log::error!("Run {run_id} failed [{}]: {e}", e.kind());
                self.record(
                    run_id,
                    RunOutcome::Failed {
                        records_fetched,
                        kind: e.kind(),
                        message: e.to_string(),
                    },
                    duration,
                )
                .await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        window: &DateWindow,
        cancel: &CancelToken,
        records_fetched: &mut u64,
    ) -> Result<UpsertReport> {
        let records = tokio::select! {
            res = tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(window)) => match res {
                Ok(records) => records?,
                Err(_) => return Err(Error::UpstreamTimeout(self.fetch_timeout)),
            },
            _ = cancel.cancelled() => return Err(Error::RunCancelled),
        };
        *records_fetched = records.len() as u64;
        log::info!("Fetched {} records for {window}", records.len());

        if cancel.is_cancelled() {
            return Err(Error::RunCancelled);
        }
        self.transition(RunState::Persisting);
        self.store.upsert_with_cancel(records, cancel).await
    }

    /// Fetch `window` without persisting it, bounded by the fetch timeout.
    /// Takes no run lock and leaves the run state untouched.
    pub async fn check_upstream(&self, window: &DateWindow) -> Result<Vec<MetricRecord>> {
        match tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(window)).await {
            Ok(records) => records,
            Err(_) => Err(Error::UpstreamTimeout(self.fetch_timeout)),
        }
    }

    /// Run history is best effort once the outcome is known; a failure to
    /// record it must not mask the run's own result.
    async fn record(&self, run_id: i64, outcome: RunOutcome, duration: Duration) {
        if let Err(e) = self.store.finish_run(run_id, outcome, duration).await {
            log::warn!("Failed to record outcome of run {run_id}: {e}");
        }
    }

    fn transition(&self, next: RunState) {
        let prev = self.state.send_replace(next);
        log::debug!("Run state {prev} -> {next}");
    }
}

/// Publishes the active run's cancel token for [`Coordinator::cancel`] and
/// clears it when the run ends.
struct ActiveRun<'a> {
    slot: &'a Mutex<Option<CancelToken>>,
}

impl<'a> ActiveRun<'a> {
    fn register(slot: &'a Mutex<Option<CancelToken>>, token: CancelToken) -> Self {
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
        Self { slot }
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
