pub mod coordinator;
pub mod schedule;

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::window::DateWindow;

pub use coordinator::Coordinator;
pub use schedule::Scheduler;

/// Where the coordinator is in its current (or most recent) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Fetching,
    Persisting,
    Done,
    Failed,
}

impl RunState {
    pub fn is_active(self) -> bool {
        matches!(self, RunState::Fetching | RunState::Persisting)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Fetching => "fetching",
            RunState::Persisting => "persisting",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of one successful run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub window: DateWindow,
    pub records_fetched: u64,
    /// Inserted plus updated.
    pub records_written: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub skipped_duplicate: u64,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}
