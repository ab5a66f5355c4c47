use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Whether a metric is a count or a ratio/duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Integer,
    Float,
}

/// Metrics the warehouse knows how to ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    Sessions,
    TotalUsers,
    NewUsers,
    PageViews,
    AverageSessionDuration,
    BounceRate,
    PagesPerSession,
    Conversions,
    EngagedSessions,
    EngagementRate,
}

impl MetricName {
    pub const ALL: [MetricName; 10] = [
        MetricName::Sessions,
        MetricName::TotalUsers,
        MetricName::NewUsers,
        MetricName::PageViews,
        MetricName::AverageSessionDuration,
        MetricName::BounceRate,
        MetricName::PagesPerSession,
        MetricName::Conversions,
        MetricName::EngagedSessions,
        MetricName::EngagementRate,
    ];

    /// Name stored in the warehouse.
    pub fn as_str(self) -> &'static str {
        match self {
            MetricName::Sessions => "sessions",
            MetricName::TotalUsers => "total_users",
            MetricName::NewUsers => "new_users",
            MetricName::PageViews => "page_views",
            MetricName::AverageSessionDuration => "average_session_duration",
            MetricName::BounceRate => "bounce_rate",
            MetricName::PagesPerSession => "pages_per_session",
            MetricName::Conversions => "conversions",
            MetricName::EngagedSessions => "engaged_sessions",
            MetricName::EngagementRate => "engagement_rate",
        }
    }

    /// Name used by the Google Analytics Data API.
    pub fn api_name(self) -> &'static str {
        match self {
            MetricName::Sessions => "sessions",
            MetricName::TotalUsers => "totalUsers",
            MetricName::NewUsers => "newUsers",
            MetricName::PageViews => "screenPageViews",
            MetricName::AverageSessionDuration => "averageSessionDuration",
            MetricName::BounceRate => "bounceRate",
            MetricName::PagesPerSession => "screenPageViewsPerSession",
            MetricName::Conversions => "conversions",
            MetricName::EngagedSessions => "engagedSessions",
            MetricName::EngagementRate => "engagementRate",
        }
    }

    pub fn from_api_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.api_name() == name)
    }

    pub fn kind(self) -> MetricKind {
        match self {
            MetricName::Sessions
            | MetricName::TotalUsers
            | MetricName::NewUsers
            | MetricName::PageViews
            | MetricName::Conversions
            | MetricName::EngagedSessions => MetricKind::Integer,
            MetricName::AverageSessionDuration
            | MetricName::BounceRate
            | MetricName::PagesPerSession
            | MetricName::EngagementRate => MetricKind::Float,
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown metric name: {s}")))
    }
}

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    GoogleAnalytics,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::GoogleAnalytics => "google_analytics",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google_analytics" => Ok(Source::GoogleAnalytics),
            other => Err(Error::InvalidArgument(format!("unknown source: {other}"))),
        }
    }
}

/// A metric observation. Stored with SQLite's native storage class so
/// integer counts stay exact.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Integer(i64),
    Float(f64),
}

impl MetricValue {
    pub fn zero(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Integer => MetricValue::Integer(0),
            MetricKind::Float => MetricValue::Float(0.0),
        }
    }

    /// Parse a raw API value for a metric of the given kind. Empty strings
    /// count as zero. Integer metrics that arrive with a fractional part are
    /// kept as floats rather than truncated.
    pub fn parse(kind: MetricKind, raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Some(Self::zero(kind));
        }
        match kind {
            MetricKind::Integer => match raw.parse::<i64>() {
                Ok(v) => Some(MetricValue::Integer(v)),
                Err(_) => {
                    let f = raw.parse::<f64>().ok()?;
                    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                        Some(MetricValue::Integer(f as i64))
                    } else {
                        Some(MetricValue::Float(f))
                    }
                }
            },
            MetricKind::Float => raw.parse::<f64>().ok().map(MetricValue::Float),
        }
    }

    pub fn is_finite(&self) -> bool {
        match self {
            MetricValue::Integer(_) => true,
            MetricValue::Float(f) => f.is_finite(),
        }
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Integer(v)
    }
}

impl From<i32> for MetricValue {
    fn from(v: i32) -> Self {
        MetricValue::Integer(v as i64)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Integer(i) => write!(f, "{i}"),
            MetricValue::Float(v) => write!(f, "{v}"),
        }
    }
}

impl ToSql for MetricValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            MetricValue::Integer(i) => ToSqlOutput::from(*i),
            MetricValue::Float(f) => ToSqlOutput::from(*f),
        })
    }
}

impl FromSql for MetricValue {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Integer(i) => Ok(MetricValue::Integer(i)),
            ValueRef::Real(f) => Ok(MetricValue::Float(f)),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// Dimension name → value pairs describing what a metric was broken down by
/// (e.g. `channel = "Organic Search"`). Keys are kept sorted so the canonical
/// form is stable regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dimensions(BTreeMap<String, String>);

impl Dimensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Compact JSON object with sorted keys; `{}` when empty.
    pub fn canonical(&self) -> String {
        let map: serde_json::Map<String, serde_json::Value> = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        serde_json::Value::Object(map).to_string()
    }

    pub fn from_canonical(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Dimensions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
