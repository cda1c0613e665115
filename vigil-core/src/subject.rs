//! Subject identifiers.
//!
//! A subject names one monitored device. The sync layer treats it as an
//! opaque string compared by equality, but it is validated up front because
//! it ends up inside backend paths and cache keys.

use crate::error::{SyncError, VigilResult};
use crate::RawValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum subject length in bytes.
pub const MAX_SUBJECT_LEN: usize = 128;

/// Backend path listing every known device, one child per subject.
pub const DEVICE_LIST_PATH: &str = "devices";

/// How many device ids a listing keeps, counted from the end of key order.
pub const DEVICE_LIST_LIMIT: usize = 50;

/// Characters that would break backend paths (`/ . # $ [ ]`) or the cache
/// key layout (`:`).
const FORBIDDEN: &[char] = &['/', '.', '#', '$', '[', ']', ':'];

/// A validated subject identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subject(String);

impl Subject {
    /// Validate `raw` as a subject.
    ///
    /// Fails with `InvalidSubject` when the input is empty, whitespace only,
    /// too long, or contains control characters or any of `/ . # $ [ ] :`.
    pub fn parse(raw: &str) -> VigilResult<Self> {
        let reject = |reason: String| {
            Err(SyncError::InvalidSubject {
                subject: raw.to_string(),
                reason,
            }
            .into())
        };

        if raw.trim().is_empty() {
            return reject("subject is empty".to_string());
        }
        if raw.len() > MAX_SUBJECT_LEN {
            return reject(format!("subject exceeds {MAX_SUBJECT_LEN} bytes"));
        }
        if let Some(c) = raw.chars().find(|c| c.is_control() || FORBIDDEN.contains(c)) {
            return reject(format!("subject contains forbidden character {c:?}"));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Backend path of the subject's current value.
    pub fn live_path(&self) -> String {
        format!("devices/{}/current_data", self.0)
    }

    /// Backend path of the subject's historical records.
    pub fn history_path(&self) -> String {
        format!("devices/{}/history", self.0)
    }
}

/// Device ids of a listing node, in key order, keeping the last `limit`.
///
/// A null or non-object node lists nothing. Keys that are not valid
/// subjects are skipped.
pub fn subjects_from_listing(raw: &RawValue, limit: usize) -> Vec<Subject> {
    let Some(children) = raw.as_object() else {
        return Vec::new();
    };
    let mut subjects: Vec<Subject> = children
        .keys()
        .filter_map(|key| Subject::parse(key).ok())
        .collect();
    subjects.sort();
    let skip = subjects.len().saturating_sub(limit);
    subjects.split_off(skip)
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Subject {
    type Error = crate::error::VigilError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Subject> for String {
    fn from(subject: Subject) -> Self {
        subject.0
    }
}
