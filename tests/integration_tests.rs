use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use bytes::Bytes;
use futures::stream;
use logpair::{
    AuditEmitter, AuditLogConfig, AuditLogLayer, CaptureHandler, CodeStrategy, EventCode,
    RequestData, ResponseData,
};
use serde_json::json;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use tower::ServiceBuilder;

/// Collects every capture for verification.
#[derive(Debug, Clone)]
struct TestHandler {
    requests: Arc<Mutex<Vec<RequestData>>>,
    pairs: Arc<Mutex<HashMap<String, (RequestData, ResponseData)>>>,
}

impl TestHandler {
    fn new() -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            pairs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn requests(&self) -> Vec<RequestData> {
        self.requests.lock().unwrap().clone()
    }

    fn pairs(&self) -> Vec<(String, RequestData, ResponseData)> {
        self.pairs
            .lock()
            .unwrap()
            .iter()
            .map(|(code, (request, response))| (code.clone(), request.clone(), response.clone()))
            .collect()
    }

    fn wait_for_pairs(&self, expected: usize, timeout: Duration) -> bool {
        let start = SystemTime::now();
        while start.elapsed().unwrap() < timeout {
            if self.pairs.lock().unwrap().len() >= expected {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl CaptureHandler for TestHandler {
    async fn handle_request(&self, data: RequestData) {
        self.requests.lock().unwrap().push(data);
    }

    async fn handle_response(&self, request_data: RequestData, response_data: ResponseData) {
        self.pairs.lock().unwrap().insert(
            request_data.event_code.clone(),
            (request_data, response_data),
        );
    }
}

async fn hello_handler() -> impl IntoResponse {
    "Hello, World!"
}

async fn echo_handler(body: Bytes) -> impl IntoResponse {
    format!("Echo: {}", String::from_utf8_lossy(&body))
}

async fn items_handler() -> impl IntoResponse {
    Json(json!({"ok": true}))
}

async fn code_handler(Extension(code): Extension<EventCode>) -> String {
    code.0
}

async fn streaming_handler() -> impl IntoResponse {
    let chunks = stream::iter(vec![
        Ok::<_, std::convert::Infallible>(Bytes::from("chunk1")),
        Ok(Bytes::from("chunk2")),
        Ok(Bytes::from("chunk3")),
    ]);

    Response::builder()
        .header("content-type", "text/plain")
        .body(Body::from_stream(chunks))
        .unwrap()
}

fn test_app(handler: TestHandler, config: AuditLogConfig) -> Router {
    Router::new()
        .route("/hello", get(hello_handler))
        .route("/echo", post(echo_handler))
        .route("/api/items", get(items_handler))
        .route("/code", get(code_handler))
        .route("/streaming", get(streaming_handler))
        .layer(
            ServiceBuilder::new()
                .layer(AuditLogLayer::new(config, handler))
                .into_inner(),
        )
}

#[tokio::test(flavor = "multi_thread")]
async fn response_passes_through_unmodified() {
    let handler = TestHandler::new();
    let app = test_app(handler.clone(), AuditLogConfig::default());
    let server = axum_test::TestServer::new(app).unwrap();

    let response = server.get("/hello").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "Hello, World!");

    let streaming = server.get("/streaming").await;
    assert_eq!(streaming.status_code(), StatusCode::OK);
    assert_eq!(streaming.text(), "chunk1chunk2chunk3");

    assert!(handler.wait_for_pairs(2, Duration::from_secs(2)));
}

#[tokio::test(flavor = "multi_thread")]
async fn pair_shares_one_fresh_code() {
    let handler = TestHandler::new();
    let app = test_app(handler.clone(), AuditLogConfig::default());
    let server = axum_test::TestServer::new(app).unwrap();

    // The downstream handler echoes the code it observed in its extensions.
    let observed = server.get("/code").await.text();
    assert_eq!(observed.len(), 8);
    assert!(observed.chars().all(|c| c.is_ascii_alphanumeric()));

    assert!(handler.wait_for_pairs(1, Duration::from_secs(2)));
    let pairs = handler.pairs();
    assert_eq!(pairs.len(), 1);

    let (code, request, response) = &pairs[0];
    assert_eq!(code, &observed);
    assert_eq!(request.event_code, observed);
    assert_eq!(response.event_code, observed);
}

#[tokio::test(flavor = "multi_thread")]
async fn inbound_query_code_is_propagated_not_reminted() {
    let handler = TestHandler::new();
    let app = test_app(handler.clone(), AuditLogConfig::default());
    let server = axum_test::TestServer::new(app).unwrap();

    let observed = server.get("/code?event_code=ABC12345").await.text();
    assert_eq!(observed, "ABC12345");

    assert!(handler.wait_for_pairs(1, Duration::from_secs(2)));
    let pairs = handler.pairs();
    let (code, request, response) = &pairs[0];
    assert_eq!(code, "ABC12345");
    assert_eq!(request.event_code, "ABC12345");
    assert_eq!(response.event_code, "ABC12345");
}

#[tokio::test(flavor = "multi_thread")]
async fn inbound_header_code_is_propagated() {
    let handler = TestHandler::new();
    let app = test_app(handler.clone(), AuditLogConfig::default());
    let server = axum_test::TestServer::new(app).unwrap();

    let observed = server
        .get("/code")
        .add_header(
            HeaderName::from_static("x-event-code"),
            HeaderValue::from_static("HDR00001"),
        )
        .await
        .text();
    assert_eq!(observed, "HDR00001");
}

#[tokio::test(flavor = "multi_thread")]
async fn uuid_strategy_mints_uuid_codes() {
    let handler = TestHandler::new();
    let config = AuditLogConfig {
        code_strategy: CodeStrategy::Uuid,
        ..AuditLogConfig::default()
    };
    let app = test_app(handler.clone(), config);
    let server = axum_test::TestServer::new(app).unwrap();

    let observed = server.get("/code").await.text();
    assert_eq!(observed.len(), 36);
    assert_eq!(observed.matches('-').count(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn request_and_response_bodies_are_captured() {
    let handler = TestHandler::new();
    let app = test_app(handler.clone(), AuditLogConfig::default());
    let server = axum_test::TestServer::new(app).unwrap();

    let response = server.post("/echo").text("capture me").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "Echo: capture me");

    assert!(handler.wait_for_pairs(1, Duration::from_secs(2)));
    let pairs = handler.pairs();
    let (_, request, response) = &pairs[0];
    assert_eq!(request.method, Method::POST);
    assert_eq!(
        String::from_utf8_lossy(request.body.as_ref().unwrap()),
        "capture me"
    );
    assert_eq!(
        String::from_utf8_lossy(response.body.as_ref().unwrap()),
        "Echo: capture me"
    );
    assert!(response.duration >= response.duration_to_first_byte);
}

#[tokio::test(flavor = "multi_thread")]
async fn capture_can_be_disabled() {
    let handler = TestHandler::new();
    let config = AuditLogConfig {
        capture_request_body: false,
        capture_response_body: false,
        ..AuditLogConfig::default()
    };
    let app = test_app(handler.clone(), config);
    let server = axum_test::TestServer::new(app).unwrap();

    let response = server.post("/echo").text("nothing kept").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "Echo: nothing kept");

    assert!(handler.wait_for_pairs(1, Duration::from_secs(2)));
    let pairs = handler.pairs();
    let (_, request, response) = &pairs[0];
    assert!(request.body.is_none());
    assert!(response.body.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_get_distinct_codes() {
    let handler = TestHandler::new();
    let app = test_app(handler.clone(), AuditLogConfig::default());
    let server = Arc::new(axum_test::TestServer::new(app).unwrap());

    let calls: Vec<_> = (0..5)
        .map(|i| {
            let server = server.clone();
            async move { server.post("/echo").text(format!("request {i}")).await }
        })
        .collect();
    let responses = futures::future::join_all(calls).await;
    for (i, response) in responses.iter().enumerate() {
        assert_eq!(response.text(), format!("Echo: request {i}"));
    }

    assert!(handler.wait_for_pairs(5, Duration::from_secs(2)));
    let pairs = handler.pairs();
    assert_eq!(pairs.len(), 5);

    let codes: std::collections::HashSet<_> =
        pairs.iter().map(|(code, _, _)| code.clone()).collect();
    assert_eq!(codes.len(), 5);

    for (_, request, response) in &pairs {
        let request_body = String::from_utf8_lossy(request.body.as_ref().unwrap()).into_owned();
        let response_body = String::from_utf8_lossy(response.body.as_ref().unwrap()).into_owned();
        assert_eq!(response_body, format!("Echo: {request_body}"));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn identity_resolver_fills_the_user_field() {
    let handler = TestHandler::new();
    let layer = AuditLogLayer::new(AuditLogConfig::default(), handler.clone()).with_identity(
        |request: &axum::extract::Request| {
            request
                .headers()
                .get("x-user-id")
                .and_then(|value| value.to_str().ok())
                .map(String::from)
        },
    );
    let app = Router::new().route("/hello", get(hello_handler)).layer(layer);
    let server = axum_test::TestServer::new(app).unwrap();

    server
        .get("/hello")
        .add_header(
            HeaderName::from_static("x-user-id"),
            HeaderValue::from_static("user-042"),
        )
        .await;
    server.get("/hello").await;

    assert!(handler.wait_for_pairs(2, Duration::from_secs(2)));
    let requests = handler.requests();
    assert_eq!(requests.len(), 2);
    let users: Vec<_> = requests.iter().map(|r| r.user.clone()).collect();
    assert!(users.contains(&Some("user-042".to_string())));
    assert!(users.contains(&None));
}

#[tokio::test(flavor = "multi_thread")]
async fn forwarded_for_header_feeds_client_ip() {
    let handler = TestHandler::new();
    let app = test_app(handler.clone(), AuditLogConfig::default());
    let server = axum_test::TestServer::new(app).unwrap();

    server
        .get("/hello")
        .add_header(
            HeaderName::from_static("x-forwarded-for"),
            HeaderValue::from_static("203.0.113.9"),
        )
        .await;

    assert!(handler.wait_for_pairs(1, Duration::from_secs(2)));
    let pairs = handler.pairs();
    let (_, request, _) = &pairs[0];
    assert_eq!(request.client_ip, Some("203.0.113.9".to_string()));
}

/// The full audit scenario: anonymous GET with a query parameter, JSON 200
/// back, both records rendered off the same captured pair.
#[tokio::test(flavor = "multi_thread")]
async fn audit_records_for_a_full_round_trip() {
    let handler = TestHandler::new();
    let app = test_app(handler.clone(), AuditLogConfig::default());
    let server = axum_test::TestServer::new(app).unwrap();

    let response = server.get("/api/items?x=1").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<serde_json::Value>(), json!({"ok": true}));

    assert!(handler.wait_for_pairs(1, Duration::from_secs(2)));
    let pairs = handler.pairs();
    let (code, request, response) = &pairs[0];

    let emitter = AuditEmitter::new();
    let request_record: serde_json::Value =
        serde_json::from_str(&emitter.request_record(request)).unwrap();
    let response_record: serde_json::Value =
        serde_json::from_str(&emitter.response_record(response)).unwrap();

    assert_eq!(request_record["EVENT"], json!("Request"));
    assert_eq!(request_record["DATA"]["Method"], json!("GET"));
    assert!(request_record["DATA"]["Url"]
        .as_str()
        .unwrap()
        .ends_with("/api/items?x=1"));
    assert_eq!(request_record["DATA"]["User"], serde_json::Value::Null);
    assert_eq!(request_record["DATA"]["Parameters"], json!({"x": "1"}));

    assert_eq!(response_record["EVENT"], json!("Response"));
    assert_eq!(response_record["DATA"]["StatusCode"], json!(200));
    assert_eq!(response_record["DATA"]["Content"], json!({"ok": true}));

    assert_eq!(request_record["EVENT-CODE"], json!(code.clone()));
    assert_eq!(response_record["EVENT-CODE"], json!(code.clone()));
}
