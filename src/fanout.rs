//! Handler composition.
//!
//! [`FanoutHandler`] forwards every captured request/response pair to any
//! number of [`CaptureHandler`]s, running them concurrently. Useful to pair
//! the audit emitter with an analytics or alerting handler without stacking
//! layers.

use crate::{CaptureHandler, RequestData, ResponseData};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Dyn-compatible shim over [`CaptureHandler`] so heterogeneous handlers can
/// share one list.
trait ErasedHandler: Send + Sync + 'static {
    fn request(&self, data: RequestData) -> BoxFuture<'_>;
    fn response(&self, request_data: RequestData, response_data: ResponseData) -> BoxFuture<'_>;
}

impl<H: CaptureHandler> ErasedHandler for H {
    fn request(&self, data: RequestData) -> BoxFuture<'_> {
        Box::pin(self.handle_request(data))
    }

    fn response(&self, request_data: RequestData, response_data: ResponseData) -> BoxFuture<'_> {
        Box::pin(self.handle_response(request_data, response_data))
    }
}

/// A handler that delegates to multiple inner handlers concurrently.
///
/// # Examples
///
/// ```rust
/// use logpair::{AuditEmitter, FanoutHandler};
///
/// let handler = FanoutHandler::new()
///     .with(AuditEmitter::new())
///     .with(AuditEmitter::new().include_timing(false));
/// assert_eq!(handler.len(), 2);
/// ```
#[derive(Default)]
pub struct FanoutHandler {
    handlers: Vec<Arc<dyn ErasedHandler>>,
}

impl FanoutHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler to the set.
    pub fn with<H: CaptureHandler>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

impl CaptureHandler for FanoutHandler {
    async fn handle_request(&self, data: RequestData) {
        let calls: Vec<_> = self
            .handlers
            .iter()
            .map(|handler| {
                let handler = handler.clone();
                let data = data.clone();
                async move { handler.request(data).await }
            })
            .collect();
        futures::future::join_all(calls).await;
    }

    async fn handle_response(&self, request_data: RequestData, response_data: ResponseData) {
        let calls: Vec<_> = self
            .handlers
            .iter()
            .map(|handler| {
                let handler = handler.clone();
                let request_data = request_data.clone();
                let response_data = response_data.clone();
                async move { handler.response(request_data, response_data).await }
            })
            .collect();
        futures::future::join_all(calls).await;
    }
}
