//! # logpair
//!
//! Axum middleware that emits a paired audit trail: one `Request` record
//! when a request arrives, one `Response` record when its response is ready,
//! both stamped with a shared correlation code so the pair can be joined in
//! the logs. Bodies are captured stream-aware, records are size-bounded, and
//! all rendering happens on a background task so the request path never
//! waits on the log sink.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use axum::{routing::get, Router};
//! use logpair::{AuditEmitter, AuditLogConfig, AuditLogLayer};
//! use tower::ServiceBuilder;
//!
//! async fn hello() -> &'static str {
//!     "Hello, World!"
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let layer = AuditLogLayer::new(AuditLogConfig::default(), AuditEmitter::new());
//!
//!     let app = Router::new()
//!         .route("/hello", get(hello))
//!         .layer(ServiceBuilder::new().layer(layer));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```
//!
//! ## Correlation codes
//!
//! A request that arrives with an `event_code` query parameter (or an
//! `x-event-code` header) keeps that code; otherwise a fresh 8-character
//! code is minted. Either way the resolved code is inserted into the
//! request's extensions as [`EventCode`], so downstream handlers can read
//! it and forward it to chained calls:
//!
//! ```rust
//! use axum::Extension;
//! use logpair::{ClientEvent, EventCode};
//!
//! async fn proxy(Extension(code): Extension<EventCode>) -> String {
//!     let downstream = ClientEvent::with_code(code.0.clone());
//!     // downstream.send_request(...) logs under the same code
//!     code.0
//! }
//! ```
//!
//! ## Custom handlers
//!
//! The capture side is decoupled from emission: implement [`CaptureHandler`]
//! to process captured pairs yourself, or combine handlers with
//! [`FanoutHandler`].
//!
//! ```rust
//! use logpair::{CaptureHandler, RequestData, ResponseData};
//!
//! #[derive(Debug)]
//! struct SlowRequestAlert;
//!
//! impl CaptureHandler for SlowRequestAlert {
//!     async fn handle_request(&self, _data: RequestData) {}
//!
//!     async fn handle_response(&self, request_data: RequestData, response_data: ResponseData) {
//!         if response_data.duration.as_millis() > 1000 {
//!             println!("slow: {} {}", request_data.method, request_data.uri);
//!         }
//!     }
//! }
//! ```

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    response::Response,
};
use bytes::Bytes;
use std::{
    collections::HashMap,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::SystemTime,
};
use tokio::sync::mpsc;
use tower::{Layer, Service};
use tracing::{debug, error, instrument};

pub mod capture;
pub mod client;
pub mod emitter;
pub mod fanout;
pub mod keygen;
pub mod record;
pub mod types;

use capture::capture_body;
use types::BackgroundTask;

pub use client::{CallOptions, ClientError, ClientEvent};
pub use emitter::AuditEmitter;
pub use fanout::FanoutHandler;
pub use types::{RequestData, ResponseData};

/// Request-scoped correlation code.
///
/// Inserted into the request's extensions by [`AuditLogService`] so
/// downstream handlers can observe the code and forward it (e.g. to a
/// chained [`ClientEvent`]).
#[derive(Debug, Clone)]
pub struct EventCode(pub String);

/// How fresh correlation codes are minted when the inbound request carries
/// none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CodeStrategy {
    /// 8-character key over digits and ASCII letters. The canonical form.
    #[default]
    ShortKey,
    /// Random v4 UUID, the long form kept for fleets still expecting it.
    Uuid,
}

pub(crate) fn mint_code(strategy: CodeStrategy) -> String {
    match strategy {
        CodeStrategy::ShortKey => keygen::generate_random_key(keygen::CODE_LEN, keygen::ALL)
            .unwrap_or_else(keygen::generate_uuid),
        CodeStrategy::Uuid => keygen::generate_uuid(),
    }
}

/// Configuration for the audit logging middleware.
///
/// # Examples
///
/// ```rust
/// use logpair::{AuditLogConfig, CodeStrategy};
///
/// let config = AuditLogConfig {
///     capture_request_body: true,
///     capture_response_body: false,
///     code_strategy: CodeStrategy::Uuid,
/// };
/// ```
#[derive(Clone, Debug)]
pub struct AuditLogConfig {
    /// Capture request bodies (needed for body-borne `Parameters`).
    pub capture_request_body: bool,
    /// Capture response bodies (needed for the `Content` field).
    pub capture_response_body: bool,
    /// Strategy for minting fresh correlation codes.
    pub code_strategy: CodeStrategy,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            capture_request_body: true,
            capture_response_body: true,
            code_strategy: CodeStrategy::ShortKey,
        }
    }
}

/// Resolves the identity of the caller behind a request.
///
/// Injected into [`AuditLogLayer`] so the audit trail can carry a `User`
/// field without the middleware reaching into global authentication state.
/// Closures of type `Fn(&Request) -> Option<String>` implement this
/// directly:
///
/// ```rust
/// use axum::extract::Request;
/// use logpair::{AuditEmitter, AuditLogConfig, AuditLogLayer};
///
/// # async {
/// let layer = AuditLogLayer::new(AuditLogConfig::default(), AuditEmitter::new())
///     .with_identity(|request: &Request| {
///         request
///             .headers()
///             .get("x-user-id")
///             .and_then(|v| v.to_str().ok())
///             .map(String::from)
///     });
/// # };
/// ```
pub trait IdentityResolver: Send + Sync + 'static {
    /// Identifier of the current caller, or `None` when anonymous.
    fn identify(&self, request: &Request) -> Option<String>;
}

impl<F> IdentityResolver for F
where
    F: Fn(&Request) -> Option<String> + Send + Sync + 'static,
{
    fn identify(&self, request: &Request) -> Option<String> {
        self(request)
    }
}

/// Treats every caller as anonymous. The default resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl IdentityResolver for Anonymous {
    fn identify(&self, _request: &Request) -> Option<String> {
        None
    }
}

/// Trait for processing captured request and response data.
///
/// Both methods receive the capture off the request path, on a background
/// task; the correlation code rides inside the data. [`AuditEmitter`] is the
/// wire-format implementation; see the crate docs for a custom one.
pub trait CaptureHandler: Send + Sync + 'static {
    /// Called once the request (and its body, when captured) is available.
    fn handle_request(&self, data: RequestData) -> impl std::future::Future<Output = ()> + Send;

    /// Called once the paired response (and its body, when captured) is
    /// available. The originating request's capture is passed along for
    /// context.
    fn handle_response(
        &self,
        request_data: RequestData,
        response_data: ResponseData,
    ) -> impl std::future::Future<Output = ()> + Send;
}

/// Tower layer for the audit logging middleware.
///
/// Spawns the background task that drains captured pairs into the provided
/// [`CaptureHandler`], and hands every wrapped service a sender into it.
#[derive(Clone)]
pub struct AuditLogLayer {
    config: AuditLogConfig,
    identity: Arc<dyn IdentityResolver>,
    tx: mpsc::UnboundedSender<BackgroundTask>,
}

impl AuditLogLayer {
    /// Create the layer and spawn its background processing task. Must be
    /// called within a tokio runtime.
    pub fn new<H: CaptureHandler>(config: AuditLogConfig, handler: H) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BackgroundTask>();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                match task {
                    BackgroundTask::Request { data } => handler.handle_request(data).await,
                    BackgroundTask::Response {
                        request_data,
                        response_data,
                    } => handler.handle_response(request_data, response_data).await,
                }
            }
        });

        Self {
            config,
            identity: Arc::new(Anonymous),
            tx,
        }
    }

    /// Replace the identity resolver that fills the capture's `user` field.
    pub fn with_identity<R: IdentityResolver>(mut self, resolver: R) -> Self {
        self.identity = Arc::new(resolver);
        self
    }
}

impl<S> Layer<S> for AuditLogLayer {
    type Service = AuditLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuditLogService {
            inner,
            config: self.config.clone(),
            identity: self.identity.clone(),
            tx: self.tx.clone(),
        }
    }
}

/// Tower service wrapping an inner service with paired audit capture.
///
/// Created by [`AuditLogLayer`]; not used directly.
#[derive(Clone)]
pub struct AuditLogService<S> {
    inner: S,
    config: AuditLogConfig,
    identity: Arc<dyn IdentityResolver>,
    tx: mpsc::UnboundedSender<BackgroundTask>,
}

impl<S> Service<Request> for AuditLogService<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    #[instrument(skip_all)]
    fn call(&mut self, mut request: Request) -> Self::Future {
        let received_at = SystemTime::now();
        let event_code = resolve_event_code(&request, self.config.code_strategy);
        let user = self.identity.identify(&request);
        let client_ip = client_ip(&request);

        // Thread the resolved code through request-scoped context so
        // downstream handlers can observe and forward it.
        request.extensions_mut().insert(EventCode(event_code.clone()));

        let method = request.method().clone();
        let uri = request.uri().clone();
        let headers = convert_headers(request.headers());

        debug!(event_code = %event_code, method = %method, uri = %uri, "request received");

        let config = self.config.clone();
        let tx_for_request = self.tx.clone();
        let tx_for_response = self.tx.clone();

        let request_capture = if config.capture_request_body {
            let body = std::mem::replace(request.body_mut(), Body::empty());
            let (tapped, collected) = capture_body(body);
            *request.body_mut() = tapped;
            Some(collected)
        } else {
            None
        };

        let code_for_capture = event_code.clone();
        let request_data_future = tokio::spawn(async move {
            let body = match request_capture {
                Some(collected) => match collected.await {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        error!(event_code = %code_for_capture, error = %e, "request body capture failed");
                        return Err(());
                    }
                },
                None => None,
            };

            let data = RequestData {
                event_code: code_for_capture,
                timestamp: received_at,
                method,
                uri,
                client_ip,
                user,
                headers,
                body,
            };

            if tx_for_request
                .send(BackgroundTask::Request { data: data.clone() })
                .is_err()
            {
                error!(event_code = %data.event_code, "audit channel closed before request capture");
                return Err(());
            }
            Ok(data)
        });

        let inner_future = self.inner.call(request);

        Box::pin(async move {
            let mut response = inner_future.await?;

            let headers_ready_at = SystemTime::now();
            let status = response.status();
            let response_headers = convert_headers(response.headers());
            let duration_to_first_byte = headers_ready_at
                .duration_since(received_at)
                .unwrap_or_default();

            let response_capture = if config.capture_response_body {
                let body = std::mem::replace(response.body_mut(), Body::empty());
                let (tapped, collected) = capture_body(body);
                *response.body_mut() = tapped;
                Some(collected)
            } else {
                None
            };

            tokio::spawn(async move {
                let request_data = match request_data_future.await {
                    Ok(Ok(data)) => data,
                    Ok(Err(())) => return,
                    Err(e) => {
                        error!(event_code = %event_code, error = %e, "request capture task failed");
                        return;
                    }
                };

                let body = match response_capture {
                    Some(collected) => match collected.await {
                        Ok(bytes) => Some(bytes),
                        Err(e) => {
                            error!(event_code = %request_data.event_code, error = %e, "response body capture failed");
                            None
                        }
                    },
                    None => None,
                };

                let duration = SystemTime::now()
                    .duration_since(received_at)
                    .unwrap_or(duration_to_first_byte);

                let response_data = ResponseData {
                    event_code: request_data.event_code.clone(),
                    timestamp: headers_ready_at,
                    status,
                    headers: response_headers,
                    body,
                    duration_to_first_byte,
                    duration,
                };

                if tx_for_response
                    .send(BackgroundTask::Response {
                        request_data,
                        response_data,
                    })
                    .is_err()
                {
                    error!("audit channel closed before response capture");
                }
            });

            Ok(response)
        })
    }
}

/// Resolve the request's correlation code: the inbound `event_code` query
/// parameter wins, then the `x-event-code` header, then a freshly minted
/// code.
fn resolve_event_code(request: &Request, strategy: CodeStrategy) -> String {
    let from_query = request.uri().query().and_then(|query| {
        serde_urlencoded::from_str::<Vec<(String, String)>>(query)
            .ok()?
            .into_iter()
            .find(|(key, _)| key == "event_code")
            .map(|(_, value)| value)
    });
    let from_header = || {
        request
            .headers()
            .get("x-event-code")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };
    from_query
        .or_else(from_header)
        .filter(|code| !code.is_empty())
        .unwrap_or_else(|| mint_code(strategy))
}

/// Client address: the connection peer when the server registered
/// `ConnectInfo`, else the first `x-forwarded-for` entry.
fn client_ip(request: &Request) -> Option<String> {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip().to_string());
    }
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
}

fn convert_headers(headers: &axum::http::HeaderMap) -> HashMap<String, Vec<Bytes>> {
    let mut result: HashMap<String, Vec<Bytes>> = HashMap::new();
    for (name, value) in headers {
        result
            .entry(name.as_str().to_owned())
            .or_default()
            .push(Bytes::copy_from_slice(value.as_bytes()));
    }
    result
}
