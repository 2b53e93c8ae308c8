use axum::{extract::Query, routing::get, routing::post, Extension, Json, Router};
use bytes::Bytes;
use logpair::{
    AuditEmitter, AuditLogConfig, AuditLogLayer, CallOptions, CaptureHandler, ClientEvent,
    EventCode, FanoutHandler, RequestData, ResponseData,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

/// In-memory view of captured pairs, served on /stats alongside the emitted
/// audit records.
#[derive(Debug, Clone, Default)]
struct StatsHandler {
    calls: Arc<Mutex<Vec<CapturedCall>>>,
}

#[derive(Debug, Clone, Serialize)]
struct CapturedCall {
    event_code: String,
    method: String,
    url: String,
    user: Option<String>,
    status: Option<u16>,
    duration_ms: Option<u64>,
    completed: bool,
}

impl CaptureHandler for StatsHandler {
    async fn handle_request(&self, data: RequestData) {
        self.calls.lock().unwrap().push(CapturedCall {
            event_code: data.event_code.clone(),
            method: data.method.to_string(),
            url: data.full_url(),
            user: data.user,
            status: None,
            duration_ms: None,
            completed: false,
        });
    }

    async fn handle_response(&self, request_data: RequestData, response_data: ResponseData) {
        let mut calls = self.calls.lock().unwrap();
        if let Some(call) = calls
            .iter_mut()
            .find(|call| call.event_code == request_data.event_code)
        {
            call.status = Some(response_data.status.as_u16());
            call.duration_ms = Some(response_data.duration.as_millis() as u64);
            call.completed = true;
        }
    }
}

async fn hello_handler() -> &'static str {
    "Hello, World!"
}

async fn echo_handler(body: Bytes) -> String {
    format!("Echo: {}", String::from_utf8_lossy(&body))
}

async fn items_handler(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    Json(json!({ "ok": true, "params": params }))
}

/// Forwards to another service under the inbound request's correlation code,
/// so the outbound CurlSend/CurlReceive records join the same trace.
async fn proxy_handler(Extension(code): Extension<EventCode>) -> String {
    let downstream = ClientEvent::with_code(code.0);
    match downstream
        .send_request(
            "http://localhost:3000/hello",
            reqwest::Method::GET,
            None,
            reqwest::header::HeaderMap::new(),
            CallOptions::default(),
        )
        .await
    {
        Ok(body) => format!("downstream said: {body}"),
        Err(e) => format!("downstream failed: {e}"),
    }
}

async fn stats_handler(stats: Arc<StatsHandler>) -> Json<Value> {
    let calls = stats.calls.lock().unwrap().clone();
    Json(json!({
        "total": calls.len(),
        "completed": calls.iter().filter(|call| call.completed).count(),
        "calls": calls,
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let stats = Arc::new(StatsHandler::default());
    let stats_for_route = stats.clone();

    let handler = FanoutHandler::new()
        .with(AuditEmitter::new())
        .with(stats.as_ref().clone());
    let layer = AuditLogLayer::new(AuditLogConfig::default(), handler).with_identity(
        |request: &axum::extract::Request| {
            request
                .headers()
                .get("x-user-id")
                .and_then(|value| value.to_str().ok())
                .map(String::from)
        },
    );

    let app = Router::new()
        .route("/hello", get(hello_handler))
        .route("/echo", post(echo_handler))
        .route("/api/items", get(items_handler))
        .route("/proxy", get(proxy_handler))
        .route("/stats", get(move || stats_handler(stats_for_route.clone())))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(layer)
                .into_inner(),
        );

    info!("demo endpoints:");
    info!("  GET  /hello               - plain greeting");
    info!("  POST /echo                - echo the request body");
    info!("  GET  /api/items?x=1       - JSON body, shows Parameters capture");
    info!("  GET  /proxy               - chained outbound call, same EVENT-CODE");
    info!("  GET  /stats               - captured pairs as JSON");
    info!("");
    info!("try:");
    info!("  curl 'http://localhost:3000/api/items?x=1'");
    info!("  curl 'http://localhost:3000/api/items?event_code=ABC12345&x=1'");
    info!("  curl -H 'x-user-id: user-042' http://localhost:3000/hello");
    info!("  curl http://localhost:3000/proxy");
    info!("  curl http://localhost:3000/stats");

    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    info!("demo server listening on http://localhost:3000");
    axum::serve(listener, app).await?;

    Ok(())
}
