use chrono::{Datelike, Duration, NaiveDate};

/// Storage format for calendar dates (`date_key` columns).
pub const DATE_KEY_FORMAT: &str = "%Y-%m-%d";

/// Format used by the analytics reporting API for the `date` dimension.
pub const REPORT_DATE_FORMAT: &str = "%Y%m%d";

/// Today's date in the local (reporting) timezone.
pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn date_key(d: NaiveDate) -> String {
    d.format(DATE_KEY_FORMAT).to_string()
}

pub fn parse_date_key(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_KEY_FORMAT).ok()
}

/// Parse a `YYYYMMDD` value as returned by the reporting API.
pub fn parse_report_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.len() != 8 || !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(s, REPORT_DATE_FORMAT).ok()
}

/// The date `days` days before `from`.
pub fn days_before(from: NaiveDate, days: u32) -> NaiveDate {
    from - Duration::days(days as i64)
}

/// Get the last day of a given month.
pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .unwrap_or(NaiveDate::MAX)
}

/// Last day of the month containing `d`.
pub fn end_of_month(d: NaiveDate) -> NaiveDate {
    last_day_of_month(d.year(), d.month())
}
