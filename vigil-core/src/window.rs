//! Closed time windows for range queries.

use crate::error::{SyncError, VigilResult};
use crate::Timestamp;
use chrono::{NaiveDate, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    start: Timestamp,
    end: Timestamp,
}

impl TimeWindow {
    /// Build a window from two timestamps. `start` must not be after `end`.
    pub fn new(start: Timestamp, end: Timestamp) -> VigilResult<Self> {
        if start > end {
            return Err(SyncError::InvalidRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
                reason: "start is after end".to_string(),
            }
            .into());
        }
        Ok(Self { start, end })
    }

    /// Parse a window from RFC 3339 timestamps or plain `YYYY-MM-DD` dates
    /// (midnight UTC).
    pub fn parse(start: &str, end: &str) -> VigilResult<Self> {
        let invalid = |reason: String| SyncError::InvalidRange {
            start: start.to_string(),
            end: end.to_string(),
            reason,
        };
        let start_ts = parse_bound(start).ok_or_else(|| invalid("unparseable start".to_string()))?;
        let end_ts = parse_bound(end).ok_or_else(|| invalid("unparseable end".to_string()))?;
        if start_ts > end_ts {
            return Err(invalid("start is after end".to_string()).into());
        }
        Ok(Self {
            start: start_ts,
            end: end_ts,
        })
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Inclusive on both ends.
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts <= self.end
    }

    /// Canonical `start..end` rendering used in cache keys.
    pub fn canonical(&self) -> (String, String) {
        (canonical_ts(self.start), canonical_ts(self.end))
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (start, end) = self.canonical();
        write!(f, "{start}..{end}")
    }
}

fn canonical_ts(ts: Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_bound(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    Utc.from_local_datetime(&date.and_hms_opt(0, 0, 0)?).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_date_and_timestamp_forms_are_equal() {
        let a = TimeWindow::parse("2024-01-01", "2024-01-02").unwrap();
        let b = TimeWindow::parse("2024-01-01T00:00:00Z", "2024-01-02T00:00:00+00:00").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.canonical().0, "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_offsets_are_normalised_to_utc() {
        let window = TimeWindow::parse("2024-01-01T02:00:00+02:00", "2024-01-01T01:00:00Z").unwrap();
        assert_eq!(window.start(), window.end());
    }

    #[test]
    fn test_reversed_window_is_rejected() {
        let err = TimeWindow::parse("2024-02-01", "2024-01-01").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRange);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(TimeWindow::parse("yesterday", "2024-01-01").is_err());
        assert!(TimeWindow::parse("2024-01-01", "").is_err());
    }

    #[test]
    fn test_contains_is_inclusive() {
        let window = TimeWindow::parse("2024-01-01", "2024-01-02").unwrap();
        assert!(window.contains(window.start()));
        assert!(window.contains(window.end()));
        assert!(!window.contains(window.end() + chrono::Duration::milliseconds(1)));
    }
}
