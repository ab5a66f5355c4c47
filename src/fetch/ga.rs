use async_trait::async_trait;
use chrono::Utc;
use futures::future::try_join_all;

use crate::error::Result;
use crate::fetch::client::AnalyticsClient;
use crate::fetch::rate_limit::{with_retry, RetryPolicy};
use crate::fetch::report::{normalize, ReportGroup};
use crate::fetch::MetricsFetcher;
use crate::metrics::{MetricRecord, Source};
use crate::window::DateWindow;

/// Fetches every report group for a window from Google Analytics.
#[derive(Debug, Clone)]
pub struct GaFetcher {
    client: AnalyticsClient,
    retry: RetryPolicy,
}

impl GaFetcher {
    pub fn new(client: AnalyticsClient, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// All rows of one report group for one sub-window, following pagination.
    async fn fetch_report(
        &self,
        group: ReportGroup,
        window: DateWindow,
    ) -> Result<Vec<MetricRecord>> {
        let fetched_at = Utc::now();
        let mut records = Vec::new();
        let mut offset: u64 = 0;

        loop {
            let request = group.request(&window, offset);
            let page = with_retry(&self.retry, || self.client.run_report(&request)).await?;
            let rows = page.rows.len() as u64;
            records.extend(normalize(
                &page,
                self.client.property_id(),
                Source::GoogleAnalytics,
                fetched_at,
            )?);

            offset += rows;
            if rows == 0 || offset >= page.total_rows() {
                break;
            }
        }

        log::debug!(
            "Fetched {} {group} records for {window} ({offset} rows)",
            records.len()
        );
        Ok(records)
    }
}

/// Every (report group, month) pair, in request order.
pub fn plan_requests(groups: &[ReportGroup], window: &DateWindow) -> Vec<(ReportGroup, DateWindow)> {
    let chunks = window.split_into_months();
    groups
        .iter()
        .flat_map(|group| chunks.iter().map(move |chunk| (*group, *chunk)))
        .collect()
}

#[async_trait]
impl MetricsFetcher for GaFetcher {
    async fn fetch(&self, window: &DateWindow) -> Result<Vec<MetricRecord>> {
        let plan = plan_requests(&ReportGroup::ALL, window);
        log::info!(
            "Fetching property {} for {window} ({} requests)",
            self.client.property_id(),
            plan.len()
        );

        let pages = try_join_all(
            plan.into_iter()
                .map(|(group, chunk)| self.fetch_report(group, chunk)),
        )
        .await?;

        Ok(pages.into_iter().flatten().collect())
    }
}
