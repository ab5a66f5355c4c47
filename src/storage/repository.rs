use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::date_util::{date_key, parse_date_key};
use crate::error::{Error, ErrorKind, Result};
use crate::metrics::{Dimensions, IdentityKey, MetricRecord, MetricValue, PROPERTY_DIMENSION};
use crate::window::{DateFilter, DateWindow};

// ── Commit gate ────────────────────────────────────────────────────

const GATE_OPEN: u8 = 0;
const GATE_ABORTED: u8 = 1;
const GATE_COMMITTING: u8 = 2;

/// Decides, exactly once, whether a write transaction commits or rolls back.
///
/// The connection thread calls [`CommitGate::begin_commit`] right before
/// `COMMIT`; an async caller that gives up (timeout, cancellation) calls
/// [`CommitGate::abort`]. Whichever happens first wins, so a caller that
/// successfully aborts knows the batch will never become visible.
#[derive(Debug, Default)]
pub struct CommitGate(AtomicU8);

impl CommitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the transaction is now guaranteed to roll back,
    /// `false` if it already started committing.
    pub fn abort(&self) -> bool {
        match self
            .0
            .compare_exchange(GATE_OPEN, GATE_ABORTED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(state) => state == GATE_ABORTED,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst) == GATE_ABORTED
    }

    fn begin_commit(&self) -> bool {
        self.0
            .compare_exchange(GATE_OPEN, GATE_COMMITTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

// ── Metrics ────────────────────────────────────────────────────────

/// Outcome of writing one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    /// New identity keys.
    pub inserted: u64,
    /// Existing identity keys whose value was overwritten (last write wins).
    pub updated: u64,
    /// Records superseded by a later record with the same identity key in the
    /// same batch.
    pub skipped_duplicate: u64,
}

impl UpsertReport {
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Write a batch of records in a single transaction.
///
/// Existing identity keys get their `metric_value` and `fetched_at`
/// overwritten. Records are validated inside the open transaction, so an
/// invalid record anywhere in the batch rolls the whole batch back.
pub fn upsert_metrics(
    conn: &mut Connection,
    records: &[MetricRecord],
    gate: &CommitGate,
) -> Result<UpsertReport> {
    let keys: Vec<IdentityKey> = records.iter().map(|r| r.identity_key()).collect();
    let mut last_index: HashMap<&IdentityKey, usize> = HashMap::with_capacity(keys.len());
    for (i, key) in keys.iter().enumerate() {
        last_index.insert(key, i);
    }

    let mut report = UpsertReport {
        skipped_duplicate: (records.len() - last_index.len()) as u64,
        ..Default::default()
    };

    let tx = conn.transaction()?;
    {
        let mut exists = tx.prepare_cached(
            "SELECT 1 FROM fact_metrics
             WHERE date_key = ?1 AND dimensions = ?2 AND metric_name = ?3 AND source = ?4",
        )?;
        let mut upsert = tx.prepare_cached(
            "INSERT INTO fact_metrics (
                date_key, dimensions, metric_name, metric_value, source, fetched_at,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'), datetime('now'))
            ON CONFLICT(date_key, dimensions, metric_name, source) DO UPDATE SET
                metric_value = excluded.metric_value,
                fetched_at = excluded.fetched_at,
                updated_at = excluded.updated_at",
        )?;

        for (i, (record, key)) in records.iter().zip(&keys).enumerate() {
            if gate.is_aborted() {
                return Err(Error::RunCancelled);
            }
            record.validate()?;
            if last_index.get(key) != Some(&i) {
                continue;
            }

            let day = date_key(key.date);
            let existed = exists.exists(params![
                day,
                key.dimensions,
                key.metric_name.as_str(),
                key.source.as_str()
            ])?;
            upsert.execute(params![
                day,
                key.dimensions,
                key.metric_name.as_str(),
                record.metric_value,
                key.source.as_str(),
                record.fetched_at.to_rfc3339(),
            ])?;

            if existed {
                report.updated += 1;
            } else {
                report.inserted += 1;
            }
        }
    }

    // Dropping the transaction without committing rolls it back.
    if !gate.begin_commit() {
        return Err(Error::RunCancelled);
    }
    tx.commit()?;
    Ok(report)
}

/// A persisted metric row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMetric {
    pub date: NaiveDate,
    pub dimensions: Dimensions,
    pub metric_name: String,
    pub metric_value: MetricValue,
    pub source: String,
    pub fetched_at: String,
    pub updated_at: String,
}

pub fn find_metric(
    conn: &Connection,
    key: &IdentityKey,
) -> std::result::Result<Option<StoredMetric>, rusqlite::Error> {
    conn.query_row(
        "SELECT date_key, dimensions, metric_name, metric_value, source, fetched_at, updated_at
         FROM fact_metrics
         WHERE date_key = ?1 AND dimensions = ?2 AND metric_name = ?3 AND source = ?4",
        params![
            date_key(key.date),
            key.dimensions,
            key.metric_name.as_str(),
            key.source.as_str()
        ],
        |row| {
            let day: String = row.get(0)?;
            let dimensions: String = row.get(1)?;
            Ok(StoredMetric {
                date: date_from_sql(0, &day)?,
                dimensions: Dimensions::from_canonical(&dimensions).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
                })?,
                metric_name: row.get(2)?,
                metric_value: row.get(3)?,
                source: row.get(4)?,
                fetched_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        },
    )
    .optional()
}

/// Aggregate view of the stored metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataSummary {
    pub total_records: u64,
    pub date_range: Option<DateWindow>,
    pub distinct_dates: u64,
    pub metric_names: Vec<String>,
    pub sources: Vec<String>,
    /// Upstream properties with stored data.
    pub properties: Vec<String>,
    pub last_updated: Option<String>,
}

pub fn summarize(
    conn: &Connection,
    filter: &DateFilter,
) -> std::result::Result<DataSummary, rusqlite::Error> {
    let from = filter.from.map(date_key);
    let to = filter.to.map(date_key);
    const WHERE: &str = "(?1 IS NULL OR date_key >= ?1) AND (?2 IS NULL OR date_key <= ?2)";

    let (total, min_day, max_day, distinct_dates, last_updated): (
        i64,
        Option<String>,
        Option<String>,
        i64,
        Option<String>,
    ) = conn.query_row(
        &format!(
            "SELECT COUNT(*), MIN(date_key), MAX(date_key), COUNT(DISTINCT date_key), MAX(updated_at)
             FROM fact_metrics WHERE {WHERE}"
        ),
        params![from, to],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
    )?;

    let date_range = match (min_day, max_day) {
        (Some(start), Some(end)) => Some(DateWindow {
            start: date_from_sql(1, &start)?,
            end: date_from_sql(2, &end)?,
        }),
        _ => None,
    };

    let metric_names = distinct_strings(
        conn,
        &format!("SELECT DISTINCT metric_name FROM fact_metrics WHERE {WHERE} ORDER BY metric_name"),
        &from,
        &to,
    )?;
    let sources = distinct_strings(
        conn,
        &format!("SELECT DISTINCT source FROM fact_metrics WHERE {WHERE} ORDER BY source"),
        &from,
        &to,
    )?;
    let properties = distinct_strings(
        conn,
        &format!(
            "SELECT DISTINCT json_extract(dimensions, '$.{PROPERTY_DIMENSION}') AS property
             FROM fact_metrics
             WHERE {WHERE} AND json_extract(dimensions, '$.{PROPERTY_DIMENSION}') IS NOT NULL
             ORDER BY property"
        ),
        &from,
        &to,
    )?;

    Ok(DataSummary {
        total_records: total as u64,
        date_range,
        distinct_dates: distinct_dates as u64,
        metric_names,
        sources,
        properties,
        last_updated,
    })
}

fn distinct_strings(
    conn: &Connection,
    sql: &str,
    from: &Option<String>,
    to: &Option<String>,
) -> std::result::Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![from, to], |row| row.get(0))?;
    rows.collect()
}

/// Dates with at least one stored record inside `window`.
pub fn covered_dates(
    conn: &Connection,
    window: &DateWindow,
) -> std::result::Result<Vec<NaiveDate>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT date_key FROM fact_metrics
         WHERE date_key >= ?1 AND date_key <= ?2 ORDER BY date_key",
    )?;
    let rows = stmt.query_map(params![date_key(window.start), date_key(window.end)], |row| {
        let day: String = row.get(0)?;
        date_from_sql(0, &day)
    })?;
    rows.collect()
}

/// Outcome of a retention cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub deleted: u64,
}

/// Permanently delete every record dated strictly before `cutoff`.
pub fn delete_older_than(
    conn: &mut Connection,
    cutoff: NaiveDate,
    gate: &CommitGate,
) -> Result<DeleteReport> {
    let tx = conn.transaction()?;
    let deleted = tx.execute(
        "DELETE FROM fact_metrics WHERE date_key < ?1",
        params![date_key(cutoff)],
    )?;
    if !gate.begin_commit() {
        return Err(Error::RunCancelled);
    }
    tx.commit()?;
    Ok(DeleteReport {
        deleted: deleted as u64,
    })
}

// ── Pipeline runs ──────────────────────────────────────────────────

pub const RUN_RUNNING: &str = "running";
pub const RUN_COMPLETED: &str = "completed";
pub const RUN_FAILED: &str = "failed";
pub const RUN_CANCELLED: &str = "cancelled";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub status: String,
    pub days_back: u32,
    pub window_start: String,
    pub window_end: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub records_fetched: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_skipped: u64,
    pub duration_ms: Option<u64>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

pub fn insert_run(
    conn: &Connection,
    days_back: u32,
    window: &DateWindow,
) -> std::result::Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO pipeline_runs (status, days_back, window_start, window_end, started_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))",
        params![
            RUN_RUNNING,
            days_back,
            date_key(window.start),
            date_key(window.end)
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Close every run still marked running. Returns how many were closed.
pub fn close_abandoned_runs(conn: &Connection) -> std::result::Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE pipeline_runs SET
            status = ?1, completed_at = datetime('now'),
            error_kind = ?2, error_message = ?3
         WHERE status = ?4",
        params![
            RUN_CANCELLED,
            ErrorKind::RunCancelled.as_str(),
            "abandoned before completion",
            RUN_RUNNING
        ],
    )
}

pub fn complete_run(
    conn: &Connection,
    run_id: i64,
    records_fetched: u64,
    report: &UpsertReport,
    duration_ms: u64,
) -> std::result::Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE pipeline_runs SET
            status = ?2, completed_at = datetime('now'),
            records_fetched = ?3, records_inserted = ?4,
            records_updated = ?5, records_skipped = ?6,
            duration_ms = ?7
         WHERE id = ?1",
        params![
            run_id,
            RUN_COMPLETED,
            records_fetched as i64,
            report.inserted as i64,
            report.updated as i64,
            report.skipped_duplicate as i64,
            duration_ms as i64,
        ],
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn fail_run(
    conn: &Connection,
    run_id: i64,
    status: &str,
    records_fetched: u64,
    error_kind: &str,
    error_message: &str,
    duration_ms: u64,
) -> std::result::Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE pipeline_runs SET
            status = ?2, completed_at = datetime('now'),
            records_fetched = ?3, error_kind = ?4, error_message = ?5,
            duration_ms = ?6
         WHERE id = ?1",
        params![
            run_id,
            status,
            records_fetched as i64,
            error_kind,
            error_message,
            duration_ms as i64,
        ],
    )?;
    Ok(())
}

/// Most recent runs first.
pub fn list_runs(conn: &Connection, limit: u32) -> std::result::Result<Vec<RunRecord>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, status, days_back, window_start, window_end, started_at, completed_at,
                records_fetched, records_inserted, records_updated, records_skipped,
                duration_ms, error_kind, error_message
         FROM pipeline_runs ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(RunRecord {
            id: row.get(0)?,
            status: row.get(1)?,
            days_back: row.get(2)?,
            window_start: row.get(3)?,
            window_end: row.get(4)?,
            started_at: row.get(5)?,
            completed_at: row.get(6)?,
            records_fetched: row.get::<_, i64>(7)? as u64,
            records_inserted: row.get::<_, i64>(8)? as u64,
            records_updated: row.get::<_, i64>(9)? as u64,
            records_skipped: row.get::<_, i64>(10)? as u64,
            duration_ms: row.get::<_, Option<i64>>(11)?.map(|v| v as u64),
            error_kind: row.get(12)?,
            error_message: row.get(13)?,
        })
    })?;
    rows.collect()
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> std::result::Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> std::result::Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> std::result::Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Helpers ────────────────────────────────────────────────────────

fn date_from_sql(column: usize, s: &str) -> std::result::Result<NaiveDate, rusqlite::Error> {
    parse_date_key(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            format!("invalid date key: {s}").into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricName, Source};
    use crate::storage::Database;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn sessions(date: NaiveDate, value: i64) -> MetricRecord {
        MetricRecord::new(date, MetricName::Sessions, value, Source::GoogleAnalytics)
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM fact_metrics", [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let batch = vec![sessions(d(2025, 1, 1), 10), sessions(d(2025, 1, 2), 20)];
                let first = upsert_metrics(conn, &batch, &CommitGate::new())?;
                assert_eq!(first, UpsertReport { inserted: 2, updated: 0, skipped_duplicate: 0 });

                let corrected = vec![sessions(d(2025, 1, 1), 11), sessions(d(2025, 1, 2), 20)];
                let second = upsert_metrics(conn, &corrected, &CommitGate::new())?;
                assert_eq!(second, UpsertReport { inserted: 0, updated: 2, skipped_duplicate: 0 });
                assert_eq!(second.written(), 2);
                assert_eq!(count(conn), 2);

                let stored = find_metric(conn, &sessions(d(2025, 1, 1), 0).identity_key())?
                    .expect("row exists");
                assert_eq!(stored.metric_value, MetricValue::Integer(11));
                Ok::<(), Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upsert_in_batch_duplicates_last_wins() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let batch = vec![
                    sessions(d(2025, 1, 1), 1),
                    sessions(d(2025, 1, 1), 2),
                    sessions(d(2025, 1, 1), 3),
                ];
                let report = upsert_metrics(conn, &batch, &CommitGate::new())?;
                assert_eq!(report, UpsertReport { inserted: 1, updated: 0, skipped_duplicate: 2 });

                let stored = find_metric(conn, &batch[0].identity_key())?.unwrap();
                assert_eq!(stored.metric_value, MetricValue::Integer(3));
                Ok::<(), Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upsert_distinguishes_dimensions() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let batch = vec![
                    sessions(d(2025, 1, 1), 5).with_dimension("channel", "Direct"),
                    sessions(d(2025, 1, 1), 7).with_dimension("channel", "Referral"),
                    sessions(d(2025, 1, 1), 12),
                ];
                let report = upsert_metrics(conn, &batch, &CommitGate::new())?;
                assert_eq!(report.inserted, 3);
                assert_eq!(count(conn), 3);
                Ok::<(), Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upsert_failure_mid_batch_rolls_back() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let batch = vec![
                    sessions(d(2025, 1, 1), 1),
                    sessions(d(2025, 1, 2), 2),
                    MetricRecord::new(d(2025, 1, 3), MetricName::BounceRate, f64::INFINITY, Source::GoogleAnalytics),
                    sessions(d(2025, 1, 4), 4),
                ];
                let err = upsert_metrics(conn, &batch, &CommitGate::new()).unwrap_err();
                assert!(matches!(err, Error::ConstraintViolation(_)));
                assert_eq!(count(conn), 0);
                Ok::<(), Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_aborted_gate_rolls_back() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let gate = CommitGate::new();
                assert!(gate.abort());
                let err = upsert_metrics(conn, &[sessions(d(2025, 1, 1), 1)], &gate).unwrap_err();
                assert!(matches!(err, Error::RunCancelled));
                assert_eq!(count(conn), 0);

                let err = upsert_metrics(conn, &[], &gate).unwrap_err();
                assert!(matches!(err, Error::RunCancelled));
                Ok::<(), Error>(())
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_commit_gate_decides_once() {
        let gate = CommitGate::new();
        assert!(gate.begin_commit());
        assert!(!gate.abort());
        assert!(!gate.is_aborted());

        let gate = CommitGate::new();
        assert!(gate.abort());
        assert!(gate.abort());
        assert!(!gate.begin_commit());
    }

    #[tokio::test]
    async fn test_delete_older_than_is_strict() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let batch = vec![
                    sessions(d(2025, 1, 1), 1),
                    sessions(d(2025, 1, 2), 2),
                    sessions(d(2025, 1, 3), 3),
                ];
                upsert_metrics(conn, &batch, &CommitGate::new())?;

                let report = delete_older_than(conn, d(2025, 1, 2), &CommitGate::new())?;
                assert_eq!(report.deleted, 1);
                assert!(find_metric(conn, &batch[0].identity_key())?.is_none());
                assert!(find_metric(conn, &batch[1].identity_key())?.is_some());
                assert!(find_metric(conn, &batch[2].identity_key())?.is_some());
                Ok::<(), Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_summarize_empty_and_filtered() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let empty = summarize(conn, &DateFilter::default())?;
                assert_eq!(empty.total_records, 0);
                assert_eq!(empty.date_range, None);
                assert!(empty.metric_names.is_empty());
                assert!(empty.properties.is_empty());

                let batch = vec![
                    sessions(d(2025, 1, 1), 1),
                    MetricRecord::new(d(2025, 1, 5), MetricName::BounceRate, 0.4, Source::GoogleAnalytics),
                    sessions(d(2025, 1, 9), 3),
                ];
                upsert_metrics(conn, &batch, &CommitGate::new())?;

                let all = summarize(conn, &DateFilter::default())?;
                assert_eq!(all.total_records, 3);
                assert_eq!(all.distinct_dates, 3);
                assert_eq!(
                    all.date_range,
                    Some(DateWindow { start: d(2025, 1, 1), end: d(2025, 1, 9) })
                );
                assert_eq!(all.metric_names, vec!["bounce_rate", "sessions"]);
                assert_eq!(all.sources, vec!["google_analytics"]);
                assert!(all.last_updated.is_some());

                let filtered = summarize(conn, &DateFilter::new(Some(d(2025, 1, 2)), None).unwrap())?;
                assert_eq!(filtered.total_records, 2);
                assert_eq!(filtered.date_range.unwrap().start, d(2025, 1, 5));
                Ok::<(), Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_properties_are_stored_side_by_side() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let batch = vec![
                    sessions(d(2025, 1, 1), 10).with_dimension(PROPERTY_DIMENSION, "111"),
                    sessions(d(2025, 1, 1), 20).with_dimension(PROPERTY_DIMENSION, "222"),
                ];
                let report = upsert_metrics(conn, &batch, &CommitGate::new())?;
                assert_eq!(report.inserted, 2);
                assert_eq!(count(conn), 2);

                let first = find_metric(conn, &batch[0].identity_key())?.unwrap();
                assert_eq!(first.metric_value, MetricValue::Integer(10));
                assert_eq!(first.dimensions.get(PROPERTY_DIMENSION), Some("111"));

                let summary = summarize(conn, &DateFilter::default())?;
                assert_eq!(summary.properties, vec!["111", "222"]);
                Ok::<(), Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_covered_dates() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                upsert_metrics(
                    conn,
                    &[sessions(d(2025, 1, 1), 1), sessions(d(2025, 1, 3), 1), sessions(d(2025, 2, 1), 1)],
                    &CommitGate::new(),
                )?;
                let window = DateWindow::new(d(2025, 1, 1), d(2025, 1, 31)).unwrap();
                assert_eq!(covered_dates(conn, &window)?, vec![d(2025, 1, 1), d(2025, 1, 3)]);
                Ok::<(), Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_history_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let window = DateWindow::new(d(2025, 1, 1), d(2025, 1, 8)).unwrap();
                let ok_id = insert_run(conn, 7, &window)?;
                complete_run(
                    conn,
                    ok_id,
                    5,
                    &UpsertReport { inserted: 3, updated: 1, skipped_duplicate: 1 },
                    120,
                )?;
                let failed_id = insert_run(conn, 7, &window)?;
                fail_run(conn, failed_id, RUN_FAILED, 0, "upstream_timeout", "timed out", 60_000)?;

                let runs = list_runs(conn, 10)?;
                assert_eq!(runs.len(), 2);
                assert_eq!(runs[0].id, failed_id);
                assert_eq!(runs[0].status, RUN_FAILED);
                assert_eq!(runs[0].error_kind.as_deref(), Some("upstream_timeout"));
                assert_eq!(runs[1].status, RUN_COMPLETED);
                assert_eq!(runs[1].records_inserted, 3);
                assert_eq!(runs[1].records_skipped, 1);
                assert_eq!(runs[1].window_start, "2025-01-01");
                assert_eq!(list_runs(conn, 1)?.len(), 1);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                set_config(conn, "property_id", "12345")?;
                let val = get_config(conn, "property_id")?;
                assert_eq!(val, Some("12345".to_string()));

                set_config(conn, "property_id", "67890")?;
                assert_eq!(get_config(conn, "property_id")?, Some("67890".to_string()));

                let missing = get_config(conn, "nonexistent")?;
                assert_eq!(missing, None);
                assert_eq!(list_config(conn)?.len(), 1);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }
}
