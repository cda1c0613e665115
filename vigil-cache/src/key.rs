//! Cache keys.
//!
//! `CacheKey`'s private inner struct means a key can only come from
//! [`CacheKey::live`], [`CacheKey::range`] or [`CacheKey::device_list`].
//! They take a validated [`Subject`] and a canonical [`TimeWindow`], so two
//! requests that mean the same thing always produce equal keys.

use std::fmt;
use vigil_core::{Subject, TimeWindow};

/// Which request shape a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Live,
    Range,
    DeviceList,
}

/// Deterministic cache and registry key.
///
/// # String Form
///
/// - `live:{subject}`
/// - `range:{subject}:{start}:{end}:{limit}` with RFC 3339 millisecond bounds
/// - `device_list`
///
/// Subjects cannot contain `:`, so the string form is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Private inner data - cannot be constructed externally
    inner: KeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyInner {
    Live {
        subject: Subject,
    },
    Range {
        subject: Subject,
        window: TimeWindow,
        limit: usize,
    },
    DeviceList,
}

impl CacheKey {
    /// Key of a subject's live feed.
    pub fn live(subject: &Subject) -> Self {
        Self {
            inner: KeyInner::Live {
                subject: subject.clone(),
            },
        }
    }

    /// Key of a range query. `limit` is the effective limit after defaults
    /// are applied.
    pub fn range(subject: &Subject, window: TimeWindow, limit: usize) -> Self {
        Self {
            inner: KeyInner::Range {
                subject: subject.clone(),
                window,
                limit,
            },
        }
    }

    /// Key of the device listing feed. There is only one.
    pub fn device_list() -> Self {
        Self {
            inner: KeyInner::DeviceList,
        }
    }

    /// The subject this key belongs to; `None` for the device listing.
    pub fn subject(&self) -> Option<&Subject> {
        match &self.inner {
            KeyInner::Live { subject } | KeyInner::Range { subject, .. } => Some(subject),
            KeyInner::DeviceList => None,
        }
    }

    pub fn kind(&self) -> KeyKind {
        match self.inner {
            KeyInner::Live { .. } => KeyKind::Live,
            KeyInner::Range { .. } => KeyKind::Range,
            KeyInner::DeviceList => KeyKind::DeviceList,
        }
    }

    pub fn window(&self) -> Option<TimeWindow> {
        match self.inner {
            KeyInner::Range { window, .. } => Some(window),
            KeyInner::Live { .. } | KeyInner::DeviceList => None,
        }
    }

    pub fn limit(&self) -> Option<usize> {
        match self.inner {
            KeyInner::Range { limit, .. } => Some(limit),
            KeyInner::Live { .. } | KeyInner::DeviceList => None,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            KeyInner::Live { subject } => write!(f, "live:{subject}"),
            KeyInner::Range {
                subject,
                window,
                limit,
            } => {
                let (start, end) = window.canonical();
                write!(f, "range:{subject}:{start}:{end}:{limit}")
            }
            KeyInner::DeviceList => f.write_str("device_list"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(raw: &str) -> Subject {
        Subject::parse(raw).unwrap()
    }

    #[test]
    fn test_live_key_format() {
        let key = CacheKey::live(&subject("device_01"));
        assert_eq!(key.to_string(), "live:device_01");
        assert_eq!(key.kind(), KeyKind::Live);
        assert_eq!(key.subject().map(Subject::as_str), Some("device_01"));
        assert_eq!(key.window(), None);
    }

    #[test]
    fn test_device_list_key_has_no_subject() {
        let key = CacheKey::device_list();
        assert_eq!(key.to_string(), "device_list");
        assert_eq!(key.kind(), KeyKind::DeviceList);
        assert_eq!(key.subject(), None);
        assert_eq!(key.limit(), None);
        assert_eq!(key, CacheKey::device_list());
    }

    #[test]
    fn test_equivalent_ranges_share_a_key() {
        let s = subject("device_01");
        let a = CacheKey::range(&s, TimeWindow::parse("2024-01-01", "2024-01-02").unwrap(), 50);
        let b = CacheKey::range(
            &s,
            TimeWindow::parse("2024-01-01T00:00:00Z", "2024-01-02T00:00:00.000Z").unwrap(),
            50,
        );
        assert_eq!(a, b);
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(
            a.to_string(),
            "range:device_01:2024-01-01T00:00:00.000Z:2024-01-02T00:00:00.000Z:50"
        );
    }

    #[test]
    fn test_limit_and_subject_distinguish_keys() {
        let window = TimeWindow::parse("2024-01-01", "2024-01-02").unwrap();
        let a = CacheKey::range(&subject("a"), window, 50);
        assert_ne!(a, CacheKey::range(&subject("a"), window, 51));
        assert_ne!(a, CacheKey::range(&subject("b"), window, 50));
        assert_ne!(CacheKey::live(&subject("a")), CacheKey::live(&subject("b")));
    }
}
