pub mod client;
pub mod ga;
pub mod rate_limit;
pub mod report;

#[cfg(test)]
pub(crate) mod stub_server;

use async_trait::async_trait;

use crate::error::Result;
use crate::metrics::MetricRecord;
use crate::window::DateWindow;

pub use client::AnalyticsClient;
pub use ga::GaFetcher;
pub use rate_limit::RetryPolicy;
pub use report::ReportGroup;

/// Source of metric records for a date window.
///
/// Implementations only read from upstream. An empty result is valid and
/// means the upstream had no data for the window.
#[async_trait]
pub trait MetricsFetcher: Send + Sync {
    async fn fetch(&self, window: &DateWindow) -> Result<Vec<MetricRecord>>;
}
