use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::fetch::client::DEFAULT_API_BASE_URL;
use crate::fetch::RetryPolicy;
use crate::window::MAX_DAYS_BACK;

pub const KEY_PROPERTY_ID: &str = "property_id";
pub const KEY_API_BASE_URL: &str = "api_base_url";
pub const KEY_DEFAULT_DAYS_BACK: &str = "default_days_back";
pub const KEY_DAYS_TO_KEEP: &str = "days_to_keep";
pub const KEY_FETCH_TIMEOUT_SECS: &str = "fetch_timeout_secs";
pub const KEY_REQUEST_TIMEOUT_SECS: &str = "request_timeout_secs";
pub const KEY_STORAGE_TIMEOUT_SECS: &str = "storage_timeout_secs";
pub const KEY_MAX_RETRIES: &str = "max_retries";
pub const KEY_BACKOFF_SECS: &str = "backoff_secs";
pub const KEY_SCHEDULE_INTERVAL_MINUTES: &str = "schedule_interval_minutes";

pub const KNOWN_KEYS: &[&str] = &[
    KEY_PROPERTY_ID,
    KEY_API_BASE_URL,
    KEY_DEFAULT_DAYS_BACK,
    KEY_DAYS_TO_KEEP,
    KEY_FETCH_TIMEOUT_SECS,
    KEY_REQUEST_TIMEOUT_SECS,
    KEY_STORAGE_TIMEOUT_SECS,
    KEY_MAX_RETRIES,
    KEY_BACKOFF_SECS,
    KEY_SCHEDULE_INTERVAL_MINUTES,
];

pub const DEFAULT_DAYS_BACK: u32 = 7;
pub const DEFAULT_DAYS_TO_KEEP: u32 = 90;
/// Retention may not be shorter than a week.
pub const MIN_DAYS_TO_KEEP: u32 = 7;

/// Runtime settings for the pipeline, resolved from the `app_config` table
/// with defaults for anything unset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineConfig {
    pub property_id: Option<String>,
    pub api_base_url: String,
    pub default_days_back: u32,
    pub days_to_keep: u32,
    /// Bound on a whole fetch phase, rate-limit backoff included.
    #[serde(serialize_with = "as_secs")]
    pub fetch_timeout: Duration,
    /// Bound on each HTTP request.
    #[serde(serialize_with = "as_secs")]
    pub request_timeout: Duration,
    #[serde(serialize_with = "as_secs")]
    pub storage_timeout: Duration,
    #[serde(skip)]
    pub retry: RetryPolicy,
    #[serde(serialize_with = "as_secs")]
    pub schedule_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            property_id: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            default_days_back: DEFAULT_DAYS_BACK,
            days_to_keep: DEFAULT_DAYS_TO_KEEP,
            fetch_timeout: Duration::from_secs(600),
            request_timeout: Duration::from_secs(30),
            storage_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            schedule_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl PipelineConfig {
    /// Build from stored `(key, value)` pairs. Unknown keys are ignored so
    /// older binaries tolerate newer settings.
    pub fn from_pairs<K: AsRef<str>, V: AsRef<str>>(pairs: &[(K, V)]) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in pairs {
            let key = key.as_ref();
            if !KNOWN_KEYS.contains(&key) {
                log::debug!("Ignoring unknown config key {key:?}");
                continue;
            }
            config.apply(key, value.as_ref())?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Set one key. Rejects unknown keys and unparseable values.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            KEY_PROPERTY_ID => {
                self.property_id = (!value.is_empty()).then(|| value.to_string());
            }
            KEY_API_BASE_URL => {
                url::Url::parse(value)
                    .map_err(|e| Error::Config(format!("{key}: invalid URL {value:?}: {e}")))?;
                self.api_base_url = value.to_string();
            }
            KEY_DEFAULT_DAYS_BACK => self.default_days_back = parse_num(key, value)?,
            KEY_DAYS_TO_KEEP => self.days_to_keep = parse_num(key, value)?,
            KEY_FETCH_TIMEOUT_SECS => {
                self.fetch_timeout = Duration::from_secs(parse_positive(key, value)?)
            }
            KEY_REQUEST_TIMEOUT_SECS => {
                self.request_timeout = Duration::from_secs(parse_positive(key, value)?)
            }
            KEY_STORAGE_TIMEOUT_SECS => {
                self.storage_timeout = Duration::from_secs(parse_positive(key, value)?)
            }
            KEY_MAX_RETRIES => self.retry.max_retries = parse_num(key, value)?,
            KEY_BACKOFF_SECS => self.retry.backoff = RetryPolicy::parse_backoff(value)?,
            KEY_SCHEDULE_INTERVAL_MINUTES => {
                self.schedule_interval = Duration::from_secs(parse_positive(key, value)? * 60)
            }
            _ => {
                return Err(Error::Config(format!(
                    "unknown config key {key:?} (known: {})",
                    KNOWN_KEYS.join(", ")
                )))
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_days_back == 0 || self.default_days_back > MAX_DAYS_BACK {
            return Err(Error::Config(format!(
                "{KEY_DEFAULT_DAYS_BACK} must be between 1 and {MAX_DAYS_BACK}"
            )));
        }
        validate_days_to_keep(self.days_to_keep)
            .map_err(|_| Error::Config(format!("{KEY_DAYS_TO_KEEP} must be at least {MIN_DAYS_TO_KEEP}")))?;
        if self.retry.max_retries > 0 && self.retry.backoff.is_empty() {
            return Err(Error::Config(format!(
                "{KEY_BACKOFF_SECS} must list at least one delay when {KEY_MAX_RETRIES} > 0"
            )));
        }
        // Otherwise a throttled fetch times out before its retries run.
        let backoff = self.retry.total_backoff();
        if self.fetch_timeout <= backoff {
            return Err(Error::Config(format!(
                "{KEY_FETCH_TIMEOUT_SECS} ({}s) must be longer than the total rate-limit backoff ({}s)",
                self.fetch_timeout.as_secs(),
                backoff.as_secs()
            )));
        }
        if self.request_timeout > self.fetch_timeout {
            return Err(Error::Config(format!(
                "{KEY_REQUEST_TIMEOUT_SECS} may not exceed {KEY_FETCH_TIMEOUT_SECS}"
            )));
        }
        Ok(())
    }

    /// The property id, or a configuration error naming how to set it.
    pub fn require_property_id(&self) -> Result<&str> {
        self.property_id.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "no analytics property configured. Run: analyticsdw config set {KEY_PROPERTY_ID} <ID>"
            ))
        })
    }
}

pub fn validate_days_to_keep(days_to_keep: u32) -> Result<()> {
    if days_to_keep < MIN_DAYS_TO_KEEP {
        return Err(Error::InvalidArgument(format!(
            "days_to_keep must be at least {MIN_DAYS_TO_KEEP}, got {days_to_keep}"
        )));
    }
    Ok(())
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{key}: expected a number, got {value:?}")))
}

fn parse_positive(key: &str, value: &str) -> Result<u64> {
    match parse_num::<u64>(key, value)? {
        0 => Err(Error::Config(format!("{key} must be greater than zero"))),
        n => Ok(n),
    }
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}
