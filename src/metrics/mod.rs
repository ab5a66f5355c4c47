pub mod types;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

pub use types::{Dimensions, MetricKind, MetricName, MetricValue, Source};

/// Dimension naming the upstream property a record was fetched from, so
/// rows from different properties never share an identity key.
pub const PROPERTY_DIMENSION: &str = "property";

/// One observation of one metric for one dimension combination on one
/// calendar date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    /// Calendar day in the property's reporting timezone.
    pub date: NaiveDate,
    pub dimensions: Dimensions,
    pub metric_name: MetricName,
    pub metric_value: MetricValue,
    pub source: Source,
    /// When the record was ingested, not when it was observed.
    pub fetched_at: DateTime<Utc>,
}

impl MetricRecord {
    pub fn new(
        date: NaiveDate,
        metric_name: MetricName,
        metric_value: impl Into<MetricValue>,
        source: Source,
    ) -> Self {
        Self {
            date,
            dimensions: Dimensions::new(),
            metric_name,
            metric_value: metric_value.into(),
            source,
            fetched_at: Utc::now(),
        }
    }

    pub fn with_dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(name, value);
        self
    }

    pub fn with_dimensions(mut self, dimensions: Dimensions) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = fetched_at;
        self
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            date: self.date,
            dimensions: self.dimensions.canonical(),
            metric_name: self.metric_name,
            source: self.source,
        }
    }

    /// Schema-level checks applied before a record is written.
    pub fn validate(&self) -> Result<()> {
        if !self.metric_value.is_finite() {
            return Err(Error::ConstraintViolation(format!(
                "non-finite value {} for {} on {}",
                self.metric_value, self.metric_name, self.date
            )));
        }
        if self.dimensions.iter().any(|(name, _)| name.is_empty()) {
            return Err(Error::ConstraintViolation(format!(
                "empty dimension name for {} on {}",
                self.metric_name, self.date
            )));
        }
        Ok(())
    }
}

/// Fields that decide whether two records describe the same observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub date: NaiveDate,
    /// Canonical form of the record's dimensions.
    pub dimensions: String,
    pub metric_name: MetricName,
    pub source: Source,
}
