//! Historical telemetry records.

use crate::error::{SyncError, VigilResult};
use crate::{RawValue, Timestamp};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One timestamped child of a subject's history node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Child key in the backend (array index for array-shaped payloads).
    pub id: String,
    pub timestamp: Timestamp,
    /// Every field of the child, `timestamp` included.
    pub fields: Map<String, Value>,
}

impl TelemetryRecord {
    /// Read a numeric field such as `ear`, `mouth` or `safety_score`.
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(Value::as_f64)
    }
}

/// Decode a raw history payload into records, in backend order.
///
/// Objects map child keys to records and arrays use the index as the id.
/// `null` means the subject has no history. Children that are not objects
/// or lack a usable `timestamp` (RFC 3339 string or epoch milliseconds)
/// are skipped. Any other top-level shape is a decode error.
pub fn records_from_history(path: &str, raw: &RawValue) -> VigilResult<Vec<TelemetryRecord>> {
    match raw {
        Value::Null => Ok(Vec::new()),
        Value::Object(children) => Ok(children
            .iter()
            .filter_map(|(id, child)| record_from_child(id.clone(), child))
            .collect()),
        Value::Array(children) => Ok(children
            .iter()
            .enumerate()
            .filter_map(|(idx, child)| record_from_child(idx.to_string(), child))
            .collect()),
        other => Err(SyncError::Decode {
            path: path.to_string(),
            reason: format!("expected object or array, got {}", json_type(other)),
        }
        .into()),
    }
}

fn record_from_child(id: String, child: &Value) -> Option<TelemetryRecord> {
    let fields = child.as_object()?;
    let timestamp = parse_timestamp(fields.get("timestamp")?)?;
    Some(TelemetryRecord {
        id,
        timestamp,
        fields: fields.clone(),
    })
}

fn parse_timestamp(value: &Value) -> Option<Timestamp> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
