use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_SECONDS: &[u64] = &[60, 120, 240];

/// How rate-limited (429) requests are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Wait before retry `n` is `backoff[n]`; the last entry repeats.
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF_SECONDS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Vec<Duration>) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self::new(0, Vec::new())
    }

    /// Parse a comma separated list of seconds, e.g. `"60,120,240"`.
    pub fn parse_backoff(s: &str) -> Result<Vec<Duration>> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                    Error::Config(format!("invalid backoff value {part:?} in {s:?}"))
                })
            })
            .collect()
    }

    /// Wait before retry number `attempt` (0-based). A server-provided
    /// `Retry-After` takes precedence when it is longer.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let scheduled = self
            .backoff
            .get(attempt as usize)
            .or(self.backoff.last())
            .copied()
            .unwrap_or_default();
        retry_after.map_or(scheduled, |ra| ra.max(scheduled))
    }

    /// Time spent sleeping when every retry is used and the server sends no
    /// `Retry-After`.
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_retries).map(|n| self.delay_for(n, None)).sum()
    }
}

/// Run `op`, retrying with backoff while it reports `UpstreamRateLimited`.
///
/// `op` is called again for each attempt. Any other error is returned
/// immediately. Once retries are exhausted the final error carries the total
/// number of attempts made.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Err(Error::UpstreamRateLimited { retry_after, .. }) => {
                if attempt >= policy.max_retries {
                    return Err(Error::UpstreamRateLimited {
                        attempts: attempt + 1,
                        retry_after,
                    });
                }
                let wait = policy.delay_for(attempt, retry_after);
                log::warn!(
                    "Rate limited (429). Waiting {}s before retry {}/{}",
                    wait.as_secs_f64(),
                    attempt + 1,
                    policy.max_retries
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
