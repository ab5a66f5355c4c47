use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use crate::cancel::CancelToken;
use crate::error::{Error, ErrorKind, Result};
use crate::metrics::{IdentityKey, MetricRecord};
use crate::storage::repository::{
    self, CommitGate, DataSummary, DeleteReport, RunRecord, StoredMetric, UpsertReport,
};
use crate::storage::Database;
use crate::window::{DateFilter, DateWindow};

/// How a run ended, as recorded in run history.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed {
        records_fetched: u64,
        report: UpsertReport,
    },
    Failed {
        records_fetched: u64,
        kind: ErrorKind,
        message: String,
    },
}

/// Async repository over the warehouse. Every call is bounded by `timeout`.
///
/// Writes go through the writer connection in a single transaction guarded by
/// a [`CommitGate`]: if the caller times out or is cancelled before the
/// transaction starts committing, the transaction rolls back on the
/// connection thread and none of the batch becomes visible.
#[derive(Clone)]
pub struct MetricStore {
    db: Database,
    timeout: Duration,
}

impl MetricStore {
    pub fn new(db: Database, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Persist a batch, overwriting existing identity keys (last write wins).
    pub async fn upsert(&self, records: Vec<MetricRecord>) -> Result<UpsertReport> {
        self.upsert_with_cancel(records, &CancelToken::new()).await
    }

    pub async fn upsert_with_cancel(
        &self,
        records: Vec<MetricRecord>,
        cancel: &CancelToken,
    ) -> Result<UpsertReport> {
        let count = records.len();
        let report = self
            .guarded_write(cancel, move |conn, gate| {
                repository::upsert_metrics(conn, &records, gate)
            })
            .await?;
        log::debug!(
            "Upserted {count} records: {} inserted, {} updated, {} duplicate",
            report.inserted,
            report.updated,
            report.skipped_duplicate
        );
        Ok(report)
    }

    /// Permanently delete every record dated strictly before `cutoff`.
    /// There is no undo.
    pub async fn delete_older_than(&self, cutoff: NaiveDate) -> Result<DeleteReport> {
        let report = self
            .guarded_write(&CancelToken::new(), move |conn, gate| {
                repository::delete_older_than(conn, cutoff, gate)
            })
            .await?;
        log::info!("Deleted {} records dated before {cutoff}", report.deleted);
        Ok(report)
    }

    pub async fn summary(&self, filter: Option<DateFilter>) -> Result<DataSummary> {
        let filter = filter.unwrap_or_default();
        self.bounded(
            self.db
                .reader()
                .call(move |conn| repository::summarize(conn, &filter)),
        )
        .await
    }

    pub async fn covered_dates(&self, window: DateWindow) -> Result<Vec<NaiveDate>> {
        self.bounded(
            self.db
                .reader()
                .call(move |conn| repository::covered_dates(conn, &window)),
        )
        .await
    }

    pub async fn find(&self, key: IdentityKey) -> Result<Option<StoredMetric>> {
        self.bounded(
            self.db
                .reader()
                .call(move |conn| repository::find_metric(conn, &key)),
        )
        .await
    }

    // ── Run history ────────────────────────────────────────────────

    /// Record a new run. Runs still marked running from an earlier process or
    /// a dropped run future are closed as cancelled first.
    pub async fn begin_run(&self, days_back: u32, window: DateWindow) -> Result<i64> {
        let (abandoned, run_id) = self
            .bounded(self.db.writer().call(move |conn| {
                let abandoned = repository::close_abandoned_runs(conn)?;
                let run_id = repository::insert_run(conn, days_back, &window)?;
                Ok::<_, rusqlite::Error>((abandoned, run_id))
            }))
            .await?;
        if abandoned > 0 {
            log::warn!("Marked {abandoned} unfinished run(s) as cancelled");
        }
        Ok(run_id)
    }

    pub async fn finish_run(
        &self,
        run_id: i64,
        outcome: RunOutcome,
        duration: Duration,
    ) -> Result<()> {
        let duration_ms = duration.as_millis() as u64;
        self.bounded(self.db.writer().call(move |conn| match outcome {
            RunOutcome::Completed {
                records_fetched,
                report,
            } => repository::complete_run(conn, run_id, records_fetched, &report, duration_ms),
            RunOutcome::Failed {
                records_fetched,
                kind,
                message,
            } => {
                let status = if kind == ErrorKind::RunCancelled {
                    repository::RUN_CANCELLED
                } else {
                    repository::RUN_FAILED
                };
                repository::fail_run(
                    conn,
                    run_id,
                    status,
                    records_fetched,
                    kind.as_str(),
                    &message,
                    duration_ms,
                )
            }
        }))
        .await
    }

    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        self.bounded(
            self.db
                .reader()
                .call(move |conn| repository::list_runs(conn, limit)),
        )
        .await
    }

    // ── Config ─────────────────────────────────────────────────────

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.bounded(
            self.db
                .reader()
                .call(move |conn| repository::get_config(conn, &key)),
        )
        .await
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.bounded(
            self.db
                .writer()
                .call(move |conn| repository::set_config(conn, &key, &value)),
        )
        .await
    }

    pub async fn list_config(&self) -> Result<Vec<(String, String)>> {
        self.bounded(self.db.reader().call(|conn| repository::list_config(conn)))
            .await
    }

    // ── Helpers ────────────────────────────────────────────────────

    async fn bounded<T, E>(
        &self,
        fut: impl Future<Output = std::result::Result<T, E>>,
    ) -> Result<T>
    where
        Error: From<E>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res.map_err(Error::from),
            Err(_) => Err(Error::StorageTimeout(self.timeout)),
        }
    }

    /// Run a write transaction that can be abandoned by timeout or `cancel`
    /// without ever committing partially.
    async fn guarded_write<R, F>(&self, cancel: &CancelToken, op: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection, &CommitGate) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let gate = Arc::new(CommitGate::new());
        let mut guard = AbortOnDrop {
            gate: Arc::clone(&gate),
            armed: true,
        };
        let call = self.db.writer().call({
            let gate = Arc::clone(&gate);
            move |conn| op(conn, &gate)
        });
        tokio::pin!(call);

        let abandoned = tokio::select! {
            res = &mut call => {
                guard.armed = false;
                return res.map_err(Error::from);
            }
            _ = tokio::time::sleep(self.timeout) => Error::StorageTimeout(self.timeout),
            _ = cancel.cancelled() => Error::RunCancelled,
        };

        guard.armed = false;
        if gate.abort() {
            log::warn!("Abandoning storage write: {abandoned}");
            return Err(abandoned);
        }

        // The transaction was already committing; its result is final.
        log::debug!("Storage write finished committing after {abandoned}");
        call.await.map_err(Error::from)
    }
}

/// Rolls a queued write back if its caller stops waiting for it, e.g. when
/// the future is dropped by an outer timeout.
struct AbortOnDrop {
    gate: Arc<CommitGate>,
    armed: bool,
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if self.armed && self.gate.abort() {
            log::warn!("Storage write dropped before completion; it will roll back");
        }
    }
}
