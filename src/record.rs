//! Wire-format rendering for audit records.
//!
//! Every emitted record is a single JSON line with exactly three top-level
//! keys: `EVENT`, `DATA`, `EVENT-CODE`. `DATA` keys serialize in the order
//! they were inserted, and neither slashes nor non-ASCII text is escaped,
//! so payloads read back literally in the log.

use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Longest record emitted as-is. A rendering past this length gets its
/// payload field substituted and is rendered once more.
pub const MAX_RECORD_LEN: usize = 2048;

/// Sentinel that replaces an oversized payload field.
pub const TRUNCATION_MARKER: &str = "Too long";

/// Render one record. Pure: same inputs, same line.
pub fn format_record(event: &str, data: &Map<String, Value>, event_code: &str) -> String {
    let mut envelope = Map::with_capacity(3);
    envelope.insert("EVENT".to_string(), Value::String(event.to_string()));
    envelope.insert("DATA".to_string(), Value::Object(data.clone()));
    envelope.insert("EVENT-CODE".to_string(), Value::String(event_code.to_string()));
    Value::Object(envelope).to_string()
}

/// Render one record, bounded by [`MAX_RECORD_LEN`].
///
/// When the first rendering is too long, the `payload_field` entry of `data`
/// is replaced with [`TRUNCATION_MARKER`] (and, with `mark` set, a
/// `Truncated: true` sibling is appended) and the record rendered a second
/// time. The second rendering is returned regardless of its own length;
/// there is no further shrinking. All other fields survive unchanged.
pub fn render_bounded(
    event: &str,
    mut data: Map<String, Value>,
    payload_field: &str,
    event_code: &str,
    mark: bool,
) -> String {
    let line = format_record(event, &data, event_code);
    if line.len() <= MAX_RECORD_LEN {
        return line;
    }
    data.insert(
        payload_field.to_string(),
        Value::String(TRUNCATION_MARKER.to_string()),
    );
    if mark {
        data.insert("Truncated".to_string(), Value::Bool(true));
    }
    format_record(event, &data, event_code)
}

/// Wall-clock timestamp field, RFC 3339 with microseconds.
pub(crate) fn timestamp(at: SystemTime) -> Value {
    let at: DateTime<Utc> = at.into();
    Value::String(at.to_rfc3339_opts(SecondsFormat::Micros, true))
}
