use std::fmt;

use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::date_util::{days_before, end_of_month};
use crate::error::{Error, Result};

/// Largest trailing window a single run may request.
pub const MAX_DAYS_BACK: u32 = 365;

/// A date range [start, end] inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidArgument(format!(
                "window start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// `[today - days_back, today]`.
    pub fn trailing(days_back: u32, today: NaiveDate) -> Result<Self> {
        if days_back == 0 || days_back > MAX_DAYS_BACK {
            return Err(Error::InvalidArgument(format!(
                "days_back must be between 1 and {MAX_DAYS_BACK}, got {days_back}"
            )));
        }
        Self::new(days_before(today, days_back), today)
    }

    /// Number of calendar days covered, counting both ends.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, d: NaiveDate) -> bool {
        self.start <= d && d <= self.end
    }

    /// Split into month-aligned sub-windows.
    pub fn split_into_months(&self) -> Vec<DateWindow> {
        let mut batches = Vec::new();
        let mut cursor = self.start;

        while cursor <= self.end {
            let batch_end = end_of_month(cursor).min(self.end);
            batches.push(DateWindow {
                start: cursor,
                end: batch_end,
            });
            cursor = batch_end + Duration::days(1);
        }

        batches
    }

    /// Ranges inside this window with no entry in `covered`.
    pub fn gaps(&self, covered: &[NaiveDate]) -> Vec<DateWindow> {
        let mut dates: Vec<NaiveDate> = covered
            .iter()
            .copied()
            .filter(|d| self.contains(*d))
            .collect();
        dates.sort();
        dates.dedup();

        let mut gaps = Vec::new();
        let mut cursor = self.start;
        for d in dates {
            if d > cursor {
                gaps.push(DateWindow {
                    start: cursor,
                    end: d - Duration::days(1),
                });
            }
            cursor = d + Duration::days(1);
        }
        if cursor <= self.end {
            gaps.push(DateWindow {
                start: cursor,
                end: self.end,
            });
        }
        gaps
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Optional inclusive bounds for read queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DateFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateFilter {
    pub fn new(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<Self> {
        if let (Some(f), Some(t)) = (from, to) {
            if f > t {
                return Err(Error::InvalidArgument(format!(
                    "filter start {f} is after end {t}"
                )));
            }
        }
        Ok(Self { from, to })
    }
}

impl From<DateWindow> for DateFilter {
    fn from(w: DateWindow) -> Self {
        Self {
            from: Some(w.start),
            to: Some(w.end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_trailing_window() {
        let w = DateWindow::trailing(7, d(2025, 3, 10)).unwrap();
        assert_eq!(w.start, d(2025, 3, 3));
        assert_eq!(w.end, d(2025, 3, 10));
        assert_eq!(w.days(), 8);
    }

    #[test]
    fn test_trailing_window_bounds() {
        assert!(matches!(
            DateWindow::trailing(0, d(2025, 3, 10)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(DateWindow::trailing(365, d(2025, 3, 10)).is_ok());
        assert!(DateWindow::trailing(366, d(2025, 3, 10)).is_err());
    }

    #[test]
    fn test_new_rejects_inverted_window() {
        assert!(DateWindow::new(d(2025, 1, 2), d(2025, 1, 1)).is_err());
        let single = DateWindow::new(d(2025, 1, 1), d(2025, 1, 1)).unwrap();
        assert_eq!(single.days(), 1);
    }

    #[test]
    fn test_split_into_months() {
        let w = DateWindow::new(d(2025, 1, 15), d(2025, 3, 10)).unwrap();
        let batches = w.split_into_months();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], DateWindow { start: d(2025, 1, 15), end: d(2025, 1, 31) });
        assert_eq!(batches[1], DateWindow { start: d(2025, 2, 1), end: d(2025, 2, 28) });
        assert_eq!(batches[2], DateWindow { start: d(2025, 3, 1), end: d(2025, 3, 10) });
    }

    #[test]
    fn test_split_within_one_month() {
        let w = DateWindow::new(d(2025, 1, 3), d(2025, 1, 9)).unwrap();
        assert_eq!(w.split_into_months(), vec![w]);
    }

    #[test]
    fn test_gaps() {
        let w = DateWindow::new(d(2025, 1, 1), d(2025, 1, 10)).unwrap();
        assert_eq!(w.gaps(&[]), vec![w]);

        let covered = [d(2025, 1, 3), d(2025, 1, 1), d(2025, 1, 2), d(2025, 1, 7), d(2024, 12, 31)];
        let gaps = w.gaps(&covered);
        assert_eq!(
            gaps,
            vec![
                DateWindow { start: d(2025, 1, 4), end: d(2025, 1, 6) },
                DateWindow { start: d(2025, 1, 8), end: d(2025, 1, 10) },
            ]
        );

        let all: Vec<NaiveDate> = w.start.iter_days().take(10).collect();
        assert!(w.gaps(&all).is_empty());
    }

    #[test]
    fn test_date_filter() {
        let f = DateFilter::new(Some(d(2025, 1, 5)), None).unwrap();
        assert_eq!(f.from, Some(d(2025, 1, 5)));
        assert_eq!(f.to, None);
        assert!(DateFilter::new(Some(d(2025, 1, 5)), Some(d(2025, 1, 4))).is_err());
    }
}
