use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::date_util::{date_key, parse_report_date};
use crate::error::{Error, Result};
use crate::metrics::{
    Dimensions, MetricName, MetricRecord, MetricValue, Source, PROPERTY_DIMENSION,
};
use crate::window::DateWindow;

/// The `date` dimension every report is keyed by.
pub const DATE_DIMENSION: &str = "date";

/// Rows requested per page. The Data API caps a single response at 250k.
pub const PAGE_SIZE: u64 = 100_000;

/// A set of metrics requested together in one `runReport` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportGroup {
    /// Daily site-wide totals.
    Core,
    /// Daily engagement counters.
    Engagement,
    /// Daily sessions broken down by default channel grouping.
    TrafficSources,
}

impl ReportGroup {
    pub const ALL: [ReportGroup; 3] = [
        ReportGroup::Core,
        ReportGroup::Engagement,
        ReportGroup::TrafficSources,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReportGroup::Core => "core",
            ReportGroup::Engagement => "engagement",
            ReportGroup::TrafficSources => "traffic_sources",
        }
    }

    /// Upstream dimension names, `date` first.
    pub fn dimensions(self) -> &'static [&'static str] {
        match self {
            ReportGroup::Core | ReportGroup::Engagement => &[DATE_DIMENSION],
            ReportGroup::TrafficSources => &[DATE_DIMENSION, "sessionDefaultChannelGrouping"],
        }
    }

    pub fn metrics(self) -> &'static [MetricName] {
        match self {
            ReportGroup::Core => &[
                MetricName::Sessions,
                MetricName::TotalUsers,
                MetricName::NewUsers,
                MetricName::PageViews,
                MetricName::AverageSessionDuration,
                MetricName::BounceRate,
                MetricName::PagesPerSession,
                MetricName::Conversions,
            ],
            ReportGroup::Engagement => &[MetricName::EngagedSessions, MetricName::EngagementRate],
            ReportGroup::TrafficSources => &[MetricName::Sessions],
        }
    }

    pub fn request(self, window: &DateWindow, offset: u64) -> RunReportRequest {
        RunReportRequest {
            date_ranges: vec![DateRange {
                start_date: date_key(window.start),
                end_date: date_key(window.end),
            }],
            dimensions: self
                .dimensions()
                .iter()
                .map(|name| NamedField { name: name.to_string() })
                .collect(),
            metrics: self
                .metrics()
                .iter()
                .map(|m| NamedField { name: m.api_name().to_string() })
                .collect(),
            limit: PAGE_SIZE,
            offset,
        }
    }
}

impl fmt::Display for ReportGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local name stored for an upstream dimension.
pub fn dimension_alias(api_name: &str) -> &str {
    match api_name {
        "sessionDefaultChannelGrouping" => "channel",
        other => other,
    }
}

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReportRequest {
    pub date_ranges: Vec<DateRange>,
    pub dimensions: Vec<NamedField>,
    pub metrics: Vec<NamedField>,
    pub limit: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedField {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReportResponse {
    #[serde(default)]
    pub dimension_headers: Vec<NamedField>,
    #[serde(default)]
    pub metric_headers: Vec<NamedField>,
    /// Absent when the window has no data.
    #[serde(default)]
    pub rows: Vec<ReportRow>,
    #[serde(default)]
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    #[serde(default)]
    pub dimension_values: Vec<CellValue>,
    #[serde(default)]
    pub metric_values: Vec<CellValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CellValue {
    #[serde(default)]
    pub value: Option<String>,
}

impl RunReportResponse {
    /// Total rows available upstream, falling back to what this page holds.
    pub fn total_rows(&self) -> u64 {
        self.row_count.unwrap_or(self.rows.len() as u64)
    }
}

// ── Normalisation ──────────────────────────────────────────────────

/// Turn one report page into records: one per (row, metric). Every record
/// carries `property_id` as its `property` dimension.
pub fn normalize(
    response: &RunReportResponse,
    property_id: &str,
    source: Source,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<MetricRecord>> {
    if response.rows.is_empty() {
        return Ok(Vec::new());
    }

    let date_idx = response
        .dimension_headers
        .iter()
        .position(|h| h.name == DATE_DIMENSION)
        .ok_or_else(|| malformed("response has no date dimension"))?;

    let metrics = response
        .metric_headers
        .iter()
        .map(|h| {
            MetricName::from_api_name(&h.name)
                .ok_or_else(|| malformed(format!("unknown metric header {}", h.name)))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut records = Vec::with_capacity(response.rows.len() * metrics.len());
    for (row_no, row) in response.rows.iter().enumerate() {
        if row.dimension_values.len() != response.dimension_headers.len()
            || row.metric_values.len() != metrics.len()
        {
            return Err(malformed(format!(
                "row {row_no} has {} dimensions and {} metrics, expected {} and {}",
                row.dimension_values.len(),
                row.metric_values.len(),
                response.dimension_headers.len(),
                metrics.len()
            )));
        }

        let raw_date = cell(&row.dimension_values[date_idx]);
        let date = parse_report_date(raw_date)
            .ok_or_else(|| malformed(format!("row {row_no} has invalid date {raw_date:?}")))?;

        let mut dimensions: Dimensions = response
            .dimension_headers
            .iter()
            .zip(&row.dimension_values)
            .enumerate()
            .filter(|(i, _)| *i != date_idx)
            .map(|(_, (header, value))| (dimension_alias(&header.name).to_string(), cell(value).to_string()))
            .collect();
        dimensions.insert(PROPERTY_DIMENSION, property_id);

        for (metric, raw) in metrics.iter().zip(&row.metric_values) {
            let raw = cell(raw);
            let value = MetricValue::parse(metric.kind(), raw)
                .filter(MetricValue::is_finite)
                .ok_or_else(|| {
                    malformed(format!("row {row_no} has invalid {metric} value {raw:?}"))
                })?;
            records.push(MetricRecord {
                date,
                dimensions: dimensions.clone(),
                metric_name: *metric,
                metric_value: value,
                source,
                fetched_at,
            });
        }
    }

    Ok(records)
}

fn cell(value: &CellValue) -> &str {
    value.value.as_deref().unwrap_or("")
}

fn malformed(msg: impl Into<String>) -> Error {
    Error::UpstreamMalformedResponse(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn parse(json: &str) -> RunReportResponse {
        serde_json::from_str(json).unwrap()
    }

    const CORE_FIXTURE: &str = r#"{
        "dimensionHeaders": [{"name": "date"}],
        "metricHeaders": [
            {"name": "sessions", "type": "TYPE_INTEGER"},
            {"name": "bounceRate", "type": "TYPE_FLOAT"}
        ],
        "rows": [
            {"dimensionValues": [{"value": "20250102"}],
             "metricValues": [{"value": "120"}, {"value": "0.4125"}]},
            {"dimensionValues": [{"value": "20250101"}],
             "metricValues": [{"value": ""}, {"value": "0.5"}]}
        ],
        "rowCount": 2,
        "metadata": {"currencyCode": "USD", "timeZone": "Europe/London"},
        "kind": "analyticsData#runReport"
    }"#;

    const TRAFFIC_FIXTURE: &str = r#"{
        "dimensionHeaders": [{"name": "date"}, {"name": "sessionDefaultChannelGrouping"}],
        "metricHeaders": [{"name": "sessions", "type": "TYPE_INTEGER"}],
        "rows": [
            {"dimensionValues": [{"value": "20250101"}, {"value": "Organic Search"}],
             "metricValues": [{"value": "40"}]},
            {"dimensionValues": [{"value": "20250101"}, {"value": "Direct"}],
             "metricValues": [{"value": "12"}]}
        ],
        "rowCount": 2
    }"#;

    #[test]
    fn test_normalize_core_report() {
        let records = normalize(&parse(CORE_FIXTURE), "123456", Source::GoogleAnalytics, Utc::now()).unwrap();
        assert_eq!(records.len(), 4);

        assert_eq!(records[0].date, d(2025, 1, 2));
        assert_eq!(records[0].metric_name, MetricName::Sessions);
        assert_eq!(records[0].metric_value, MetricValue::Integer(120));
        assert_eq!(records[0].dimensions.len(), 1);
        assert_eq!(records[0].dimensions.get(PROPERTY_DIMENSION), Some("123456"));
        assert_eq!(records[1].metric_name, MetricName::BounceRate);
        assert_eq!(records[1].metric_value, MetricValue::Float(0.4125));

        // Empty values count as zero.
        assert_eq!(records[2].date, d(2025, 1, 1));
        assert_eq!(records[2].metric_value, MetricValue::Integer(0));
    }

    #[test]
    fn test_normalize_renames_channel_dimension() {
        let records =
            normalize(&parse(TRAFFIC_FIXTURE), "123456", Source::GoogleAnalytics, Utc::now()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].dimensions.get("channel"), Some("Organic Search"));
        assert_eq!(records[1].dimensions.get("channel"), Some("Direct"));
        assert_ne!(records[0].identity_key(), records[1].identity_key());
        assert_eq!(records[1].dimensions.get(PROPERTY_DIMENSION), Some("123456"));
    }

    #[test]
    fn test_normalize_keys_records_by_property() {
        let response = parse(CORE_FIXTURE);
        let first = normalize(&response, "111", Source::GoogleAnalytics, Utc::now()).unwrap();
        let second = normalize(&response, "222", Source::GoogleAnalytics, Utc::now()).unwrap();
        assert_eq!(first[0].date, second[0].date);
        assert_eq!(first[0].metric_name, second[0].metric_name);
        assert_ne!(first[0].identity_key(), second[0].identity_key());
    }

    #[test]
    fn test_normalize_empty_report() {
        let empty = parse(r#"{"dimensionHeaders": [{"name": "date"}], "metricHeaders": [{"name": "sessions"}], "rowCount": 0}"#);
        assert!(normalize(&empty, "1", Source::GoogleAnalytics, Utc::now()).unwrap().is_empty());
        assert!(normalize(&parse("{}"), "1", Source::GoogleAnalytics, Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn test_normalize_rejects_bad_rows() {
        let bad_date = CORE_FIXTURE.replace("20250102", "2025-01-02");
        let bad_number = CORE_FIXTURE.replace("\"120\"", "\"lots\"");
        let short_row = CORE_FIXTURE.replace(r#"{"value": "120"}, "#, "");
        let unknown_metric = CORE_FIXTURE.replace("bounceRate", "purchaseRevenue");
        let nan = CORE_FIXTURE.replace("0.4125", "NaN");

        for json in [bad_date, bad_number, short_row, unknown_metric, nan] {
            let err = normalize(&parse(&json), "1", Source::GoogleAnalytics, Utc::now()).unwrap_err();
            assert!(matches!(err, Error::UpstreamMalformedResponse(_)), "{json}: {err}");
        }
    }

    #[test]
    fn test_request_shape() {
        let window = DateWindow::new(d(2025, 1, 1), d(2025, 1, 31)).unwrap();
        let req = ReportGroup::TrafficSources.request(&window, 0);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["dateRanges"][0]["startDate"], "2025-01-01");
        assert_eq!(json["dateRanges"][0]["endDate"], "2025-01-31");
        assert_eq!(json["dimensions"][1]["name"], "sessionDefaultChannelGrouping");
        assert_eq!(json["metrics"][0]["name"], "sessions");
        assert_eq!(json["limit"], PAGE_SIZE);

        let core = ReportGroup::Core.request(&window, 10);
        assert_eq!(core.metrics.len(), 8);
        assert_eq!(core.metrics[3].name, "screenPageViews");
        assert_eq!(core.offset, 10);
    }
}
