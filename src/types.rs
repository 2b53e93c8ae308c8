//! Captured request and response data handed to capture handlers.

use axum::http::{Method, StatusCode, Uri};
use bytes::Bytes;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Data captured from an inbound HTTP request.
///
/// Built by the middleware once the request body (if captured) has been
/// fully read, and handed to the [`CaptureHandler`](crate::CaptureHandler)
/// for both the request and response phases.
#[derive(Debug, Clone)]
pub struct RequestData {
    /// Correlation code shared with the paired response capture.
    pub event_code: String,
    /// When the middleware received the request.
    pub timestamp: SystemTime,
    /// HTTP method (GET, POST, ...).
    pub method: Method,
    /// Request URI including path and query.
    pub uri: Uri,
    /// Peer address, or the first `x-forwarded-for` entry when fronted by a
    /// proxy.
    pub client_ip: Option<String>,
    /// Identifier of the authenticated caller, when the configured identity
    /// resolver knows one.
    pub user: Option<String>,
    /// Header values as raw bytes, no encoding guarantees.
    pub headers: HashMap<String, Vec<Bytes>>,
    /// Request body, when capture is enabled and the stream completed.
    pub body: Option<Bytes>,
}

impl RequestData {
    /// Absolute URL of the request: the URI itself when it already carries
    /// an authority, otherwise reconstructed from the `Host` header.
    pub fn full_url(&self) -> String {
        if self.uri.authority().is_some() {
            return self.uri.to_string();
        }
        match self.header_str("host") {
            Some(host) => format!("http://{}{}", host, self.uri),
            None => self.uri.to_string(),
        }
    }

    /// The parsed input-parameter set: query-string pairs merged with the
    /// fields of a JSON-object or url-encoded form body. Body fields win on
    /// key collision.
    pub fn parameters(&self) -> Map<String, Value> {
        let mut params = Map::new();
        if let Some(query) = self.uri.query() {
            if let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(query) {
                for (key, value) in pairs {
                    params.insert(key, Value::String(value));
                }
            }
        }

        let Some(body) = &self.body else {
            return params;
        };
        let content_type = self.header_str("content-type").unwrap_or_default();
        if content_type.contains("json") {
            if let Ok(Value::Object(fields)) = serde_json::from_slice(body) {
                for (key, value) in fields {
                    params.insert(key, value);
                }
            }
        } else if content_type.contains("x-www-form-urlencoded") {
            if let Ok(pairs) = serde_urlencoded::from_bytes::<Vec<(String, String)>>(body) {
                for (key, value) in pairs {
                    params.insert(key, Value::String(value));
                }
            }
        }
        params
    }

    fn header_str(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|values| values.first())
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }
}

/// Data captured from an HTTP response.
#[derive(Debug, Clone)]
pub struct ResponseData {
    /// Correlation code matching the originating request.
    pub event_code: String,
    /// When response headers were ready.
    pub timestamp: SystemTime,
    /// HTTP status code.
    pub status: StatusCode,
    /// Header values as raw bytes, no encoding guarantees.
    pub headers: HashMap<String, Vec<Bytes>>,
    /// Response body, when capture is enabled and the stream completed.
    pub body: Option<Bytes>,
    /// Elapsed from receipt of the request to response headers.
    pub duration_to_first_byte: Duration,
    /// Elapsed until the response stream completed. Equals
    /// `duration_to_first_byte` when body capture is off.
    pub duration: Duration,
}

/// Tasks queued for the background processing task.
#[derive(Debug)]
pub(crate) enum BackgroundTask {
    Request {
        data: RequestData,
    },
    Response {
        request_data: RequestData,
        response_data: ResponseData,
    },
}
