pub mod cancel;
pub mod config;
pub mod date_util;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod pipeline;
pub mod storage;
pub mod window;

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;

pub use cancel::CancelToken;
pub use config::PipelineConfig;
pub use error::{Error, ErrorKind, Result};
pub use fetch::{AnalyticsClient, GaFetcher, MetricsFetcher, ReportGroup, RetryPolicy};
pub use metrics::{Dimensions, MetricName, MetricRecord, MetricValue, Source};
pub use pipeline::{Coordinator, RunState, RunSummary, Scheduler};
pub use storage::repository::{DataSummary, DeleteReport, RunRecord, UpsertReport};
pub use storage::{Database, MetricStore};
pub use window::{DateFilter, DateWindow};

use date_util::{days_before, today};

/// Outcome of a retention cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub days_to_keep: u32,
    /// Records dated before this day were deleted.
    pub cutoff: NaiveDate,
    pub deleted: u64,
}

/// Snapshot for the `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct WarehouseStatus {
    pub summary: DataSummary,
    pub last_run: Option<RunRecord>,
    /// Days in the default trailing window with no stored data.
    pub gaps: Vec<DateWindow>,
    pub state: RunState,
}

/// Outcome of an upstream connectivity check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub property_id: Option<String>,
    pub connected: bool,
    /// Window fetched for the check.
    pub window: DateWindow,
    pub records_available: u64,
    pub last_data_date: Option<NaiveDate>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub database: DataSummary,
}

/// Main entry point for the analytics data warehouse.
pub struct AnalyticsDW {
    store: MetricStore,
    config: PipelineConfig,
    coordinator: Option<Arc<Coordinator>>,
}

impl AnalyticsDW {
    /// Open over `db`, reading settings from its `app_config` table.
    pub async fn open(db: Database) -> Result<Self> {
        let bootstrap = MetricStore::new(db.clone(), PipelineConfig::default().storage_timeout);
        let pairs = bootstrap.list_config().await?;
        let config = PipelineConfig::from_pairs(&pairs)?;
        Ok(Self::new(db, config))
    }

    pub fn new(db: Database, config: PipelineConfig) -> Self {
        Self {
            store: MetricStore::new(db, config.storage_timeout),
            config,
            coordinator: None,
        }
    }

    /// Attach the fetcher used by [`AnalyticsDW::fetch_data`] and the scheduler.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn MetricsFetcher>) -> Self {
        self.coordinator = Some(Arc::new(Coordinator::new(
            fetcher,
            self.store.clone(),
            self.config.fetch_timeout,
        )));
        self
    }

    /// Attach a Google Analytics fetcher authenticated with `access_token`.
    pub fn with_google_analytics(self, access_token: &str) -> Result<Self> {
        let client = AnalyticsClient::new(
            &self.config.api_base_url,
            self.config.require_property_id()?,
            access_token,
            self.config.request_timeout,
        )?;
        let fetcher = GaFetcher::new(client, self.config.retry.clone());
        Ok(self.with_fetcher(Arc::new(fetcher)))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &MetricStore {
        &self.store
    }

    pub fn coordinator(&self) -> Result<&Arc<Coordinator>> {
        self.coordinator.as_ref().ok_or_else(|| {
            Error::Config("no analytics fetcher configured (is GA_ACCESS_TOKEN set?)".into())
        })
    }

    // ── Pipeline ───────────────────────────────────────────────────

    /// Fetch the trailing window and persist it. `None` uses
    /// `default_days_back`.
    pub async fn fetch_data(&self, days_back: Option<u32>) -> Result<RunSummary> {
        self.fetch_data_with_cancel(days_back, CancelToken::new())
            .await
    }

    pub async fn fetch_data_with_cancel(
        &self,
        days_back: Option<u32>,
        cancel: CancelToken,
    ) -> Result<RunSummary> {
        let days_back = days_back.unwrap_or(self.config.default_days_back);
        self.coordinator()?.run_with_cancel(days_back, cancel).await
    }

    pub fn scheduler(&self, interval: Option<Duration>, days_back: Option<u32>) -> Result<Scheduler> {
        Ok(Scheduler::new(
            Arc::clone(self.coordinator()?),
            interval.unwrap_or(self.config.schedule_interval),
            days_back.unwrap_or(self.config.default_days_back),
        ))
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub async fn data_summary(&self, filter: Option<DateFilter>) -> Result<DataSummary> {
        self.store.summary(filter).await
    }

    pub async fn runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        self.store.recent_runs(limit).await
    }

    pub async fn status(&self) -> Result<WarehouseStatus> {
        let summary = self.store.summary(None).await?;
        let last_run = self.store.recent_runs(1).await?.into_iter().next();
        let window = DateWindow::trailing(self.config.default_days_back, today())?;
        let covered = self.store.covered_dates(window).await?;
        let state = self
            .coordinator
            .as_ref()
            .map_or(RunState::Idle, |c| c.state());
        Ok(WarehouseStatus {
            summary,
            last_run,
            gaps: window.gaps(&covered),
            state,
        })
    }

    /// Fetch the last day from upstream without storing it, to check that
    /// the configured property is reachable. Upstream failures are reported
    /// in the result; only a missing fetcher or a storage error is an `Err`.
    pub async fn health(&self) -> Result<HealthReport> {
        let coordinator = self.coordinator()?;
        let window = DateWindow::trailing(1, today())?;
        let database = self.store.summary(None).await?;

        let mut report = HealthReport {
            property_id: self.config.property_id.clone(),
            connected: false,
            window,
            records_available: 0,
            last_data_date: None,
            error_kind: None,
            error: None,
            database,
        };
        match coordinator.check_upstream(&window).await {
            Ok(records) => {
                report.connected = true;
                report.records_available = records.len() as u64;
                report.last_data_date = records.iter().map(|r| r.date).max();
            }
            Err(e) => {
                log::warn!("Upstream check failed [{}]: {e}", e.kind());
                report.error_kind = Some(e.kind());
                report.error = Some(e.to_string());
            }
        }
        Ok(report)
    }

    // ── Retention ──────────────────────────────────────────────────

    /// Permanently delete records older than `days_to_keep` days. `None`
    /// uses the configured retention. Deleted rows cannot be recovered.
    pub async fn cleanup_data(&self, days_to_keep: Option<u32>) -> Result<CleanupReport> {
        let days_to_keep = days_to_keep.unwrap_or(self.config.days_to_keep);
        config::validate_days_to_keep(days_to_keep)?;
        let cutoff = days_before(today(), days_to_keep);
        log::warn!("Deleting all records dated before {cutoff} (keeping {days_to_keep} days)");
        let report = self.store.delete_older_than(cutoff).await?;
        Ok(CleanupReport {
            days_to_keep,
            cutoff,
            deleted: report.deleted,
        })
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        self.store.get_config(key).await
    }

    /// Validate and store one setting. Takes effect on the next open.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let mut candidate = self.config.clone();
        candidate.apply(key, value)?;
        candidate.validate()?;
        self.store.set_config(key, value.trim()).await
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        self.store.list_config().await
    }
}
