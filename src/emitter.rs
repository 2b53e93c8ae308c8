//! The wire-format audit handler.
//!
//! [`AuditEmitter`] turns each captured request/response pair into the
//! paired `Request`/`Response` JSON records and emits them through
//! `tracing` at info severity, one record per line.

use serde_json::{Map, Value};
use tracing::info;

use crate::record::{render_bounded, timestamp};
use crate::types::{RequestData, ResponseData};
use crate::CaptureHandler;

/// Emits a `Request` and a `Response` record for every captured pair, both
/// carrying the pair's correlation code.
///
/// Record shape: `{"EVENT": ..., "DATA": {...}, "EVENT-CODE": ...}`. A
/// record whose rendering would pass 2048 bytes has its payload field
/// (`Parameters` for requests, `Content` for responses) swapped for
/// `"Too long"`.
///
/// # Examples
///
/// ```rust,no_run
/// use logpair::{AuditEmitter, AuditLogConfig, AuditLogLayer};
///
/// # #[tokio::main]
/// # async fn main() {
/// let layer = AuditLogLayer::new(AuditLogConfig::default(), AuditEmitter::new());
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AuditEmitter {
    include_timing: bool,
    mark_truncated: bool,
}

impl AuditEmitter {
    pub fn new() -> Self {
        Self {
            include_timing: true,
            mark_truncated: false,
        }
    }

    /// Include or drop the `StartAt`/`EndAt`/`TotalTime` fields. On by
    /// default.
    pub fn include_timing(mut self, on: bool) -> Self {
        self.include_timing = on;
        self
    }

    /// Append `Truncated: true` to records whose payload was substituted.
    /// Off by default.
    pub fn mark_truncated(mut self, on: bool) -> Self {
        self.mark_truncated = on;
        self
    }

    /// Render the `Request` record for a capture without emitting it.
    pub fn request_record(&self, data: &RequestData) -> String {
        let mut fields = Map::new();
        fields.insert("Ip".to_string(), opt_string(&data.client_ip));
        fields.insert("Method".to_string(), Value::String(data.method.to_string()));
        fields.insert("Url".to_string(), Value::String(data.full_url()));
        fields.insert("User".to_string(), opt_string(&data.user));
        fields.insert("Parameters".to_string(), Value::Object(data.parameters()));
        if self.include_timing {
            fields.insert("StartAt".to_string(), timestamp(data.timestamp));
        }
        render_bounded(
            "Request",
            fields,
            "Parameters",
            &data.event_code,
            self.mark_truncated,
        )
    }

    /// Render the `Response` record for a capture without emitting it.
    pub fn response_record(&self, data: &ResponseData) -> String {
        let mut fields = Map::new();
        fields.insert("StatusCode".to_string(), Value::from(data.status.as_u16()));
        fields.insert("Content".to_string(), content_value(data.body.as_deref()));
        if self.include_timing {
            fields.insert("EndAt".to_string(), timestamp(data.timestamp));
            fields.insert("TotalTime".to_string(), Value::from(data.duration.as_secs_f64()));
        }
        render_bounded(
            "Response",
            fields,
            "Content",
            &data.event_code,
            self.mark_truncated,
        )
    }
}

impl Default for AuditEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureHandler for AuditEmitter {
    async fn handle_request(&self, data: RequestData) {
        info!("{}", self.request_record(&data));
    }

    async fn handle_response(&self, _request_data: RequestData, response_data: ResponseData) {
        info!("{}", self.response_record(&response_data));
    }
}

fn opt_string(value: &Option<String>) -> Value {
    match value {
        Some(v) => Value::String(v.clone()),
        None => Value::Null,
    }
}

/// Structured content when the body parses as a JSON object or array, the
/// raw text otherwise.
fn content_value(body: Option<&[u8]>) -> Value {
    let Some(bytes) = body else {
        return Value::Null;
    };
    match serde_json::from_slice::<Value>(bytes) {
        Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
        _ => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}
