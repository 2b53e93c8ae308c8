//! Outbound call logging.
//!
//! Applies the same record and truncation contract to calls this service
//! makes to others. Every call emits `CurlSend` before dispatch and either
//! `CurlReceive` (info) or `CurlError` (warning) after, all joined by the
//! event's correlation code plus a per-call `RequestID`.

use std::time::{Duration, SystemTime};

use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::keygen::{self, generate_random_key, generate_uuid};
use crate::record::{render_bounded, timestamp};
use crate::{mint_code, CodeStrategy};

/// Transport failure during an outbound call.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Timeouts passed through to the transport.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Connect timeout. `None` leaves the transport default (unbounded).
    pub connect_timeout: Option<Duration>,
    /// Overall deadline for the call.
    pub timeout: Option<Duration>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            timeout: Some(Duration::from_secs(15)),
        }
    }
}

/// One correlated outbound-call scope.
///
/// Mints its own correlation code, or chains from an inbound request by
/// passing that request's [`EventCode`](crate::EventCode) value so the
/// downstream call shows up in the same trace.
///
/// # Examples
///
/// ```rust,no_run
/// use logpair::{CallOptions, ClientEvent};
///
/// # async fn call() -> Result<(), logpair::ClientError> {
/// let event = ClientEvent::new();
/// let body = event
///     .send_request(
///         "http://svc.internal/items",
///         reqwest::Method::GET,
///         None,
///         reqwest::header::HeaderMap::new(),
///         CallOptions::default(),
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClientEvent {
    event_code: String,
    mark_truncated: bool,
}

impl ClientEvent {
    /// Start a fresh outbound scope with its own correlation code.
    pub fn new() -> Self {
        Self::with_code(mint_code(CodeStrategy::ShortKey))
    }

    /// Chain an outbound scope onto an existing correlation code.
    pub fn with_code(event_code: impl Into<String>) -> Self {
        Self {
            event_code: event_code.into(),
            mark_truncated: false,
        }
    }

    /// Append `Truncated: true` to records whose payload was substituted.
    pub fn mark_truncated(mut self, on: bool) -> Self {
        self.mark_truncated = on;
        self
    }

    /// The correlation code stamped on this scope's records.
    pub fn event_code(&self) -> &str {
        &self.event_code
    }

    /// Perform an HTTP call, logging `CurlSend` before dispatch and
    /// `CurlReceive`/`CurlError` after.
    ///
    /// Returns the raw response body text on transport success (any HTTP
    /// status counts as success here) and [`ClientError`] when the
    /// transport itself fails: unreachable host, timeout, broken stream.
    pub async fn send_request(
        &self,
        url: &str,
        method: Method,
        body: Option<&Value>,
        headers: HeaderMap,
        options: CallOptions,
    ) -> Result<String, ClientError> {
        let request_id =
            generate_random_key(keygen::CODE_LEN, keygen::ALL).unwrap_or_else(generate_uuid);
        let started_at = SystemTime::now();
        info!(
            "{}",
            self.send_record(url, &headers, body, &options, &request_id, started_at)
        );

        let outcome = self.dispatch(url, method, body, headers, &options).await;
        let ended_at = SystemTime::now();

        match outcome {
            Ok((status, text)) => {
                info!(
                    "{}",
                    self.receive_record(status, &text, &request_id, started_at, ended_at)
                );
                Ok(text)
            }
            Err(e) => {
                warn!("{}", self.error_record(&e.to_string(), &request_id));
                Err(ClientError::Transport(e))
            }
        }
    }

    async fn dispatch(
        &self,
        url: &str,
        method: Method,
        body: Option<&Value>,
        headers: HeaderMap,
        options: &CallOptions,
    ) -> Result<(reqwest::StatusCode, String), reqwest::Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(connect) = options.connect_timeout {
            builder = builder.connect_timeout(connect);
        }
        if let Some(deadline) = options.timeout {
            builder = builder.timeout(deadline);
        }
        let client = builder.build()?;

        let mut request = client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        Ok((status, text))
    }

    fn send_record(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: Option<&Value>,
        options: &CallOptions,
        request_id: &str,
        started_at: SystemTime,
    ) -> String {
        let mut fields = Map::new();
        fields.insert("Url".to_string(), Value::String(url.to_string()));
        fields.insert("Header".to_string(), headers_value(headers));
        fields.insert(
            "Data".to_string(),
            match body {
                Some(value) => Value::String(value.to_string()),
                None => Value::Null,
            },
        );
        fields.insert("Option".to_string(), options_value(options));
        fields.insert("RequestID".to_string(), Value::String(request_id.to_string()));
        fields.insert("StartAt".to_string(), timestamp(started_at));
        render_bounded("CurlSend", fields, "Data", &self.event_code, self.mark_truncated)
    }

    fn receive_record(
        &self,
        status: reqwest::StatusCode,
        body: &str,
        request_id: &str,
        started_at: SystemTime,
        ended_at: SystemTime,
    ) -> String {
        let elapsed = ended_at.duration_since(started_at).unwrap_or_default();
        let mut fields = Map::new();
        fields.insert("StatusCode".to_string(), Value::from(status.as_u16()));
        fields.insert("ResponseBody".to_string(), Value::String(body.to_string()));
        fields.insert("RequestID".to_string(), Value::String(request_id.to_string()));
        fields.insert("EndAt".to_string(), timestamp(ended_at));
        fields.insert("TotalTime".to_string(), Value::from(elapsed.as_secs_f64()));
        render_bounded(
            "CurlReceive",
            fields,
            "ResponseBody",
            &self.event_code,
            self.mark_truncated,
        )
    }

    fn error_record(&self, message: &str, request_id: &str) -> String {
        let mut fields = Map::new();
        fields.insert("ErrorMessage".to_string(), Value::String(message.to_string()));
        fields.insert("RequestID".to_string(), Value::String(request_id.to_string()));
        render_bounded(
            "CurlError",
            fields,
            "ErrorMessage",
            &self.event_code,
            self.mark_truncated,
        )
    }
}

impl Default for ClientEvent {
    fn default() -> Self {
        Self::new()
    }
}

fn headers_value(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        map.insert(
            name.as_str().to_string(),
            Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        );
    }
    Value::Object(map)
}

fn options_value(options: &CallOptions) -> Value {
    let seconds = |timeout: Option<Duration>| match timeout {
        Some(t) => Value::from(t.as_secs_f64()),
        None => Value::Null,
    };
    let mut map = Map::new();
    map.insert("ConnectTimeout".to_string(), seconds(options.connect_timeout));
    map.insert("Timeout".to_string(), seconds(options.timeout));
    Value::Object(map)
}
