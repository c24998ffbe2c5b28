//! End-to-End Tests
//!
//! Runs the real server on an ephemeral port with in-memory log and span
//! collection, and a mock backend standing in for the downstream service.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use trace_relay::config::Config;
use trace_relay::logging::{LogRecord, MemorySink, Severity};
use trace_relay::server::routes::CONNECTION_ID_HEADER;
use trace_relay::server::Server;
use trace_relay::state::{AppState, StateGuard};
use trace_relay::telemetry::{
    ExportError, Span, SpanKind, SpanTransport, TraceContext,
};
use trace_relay::value::Scalar;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RECEIVED: &str = "Chat message received. User: {User}, MessageLength: {MessageLength}";
const COMPLETED: &str = "Chat message completed. User: {User}, Recipients: {Recipients}";
const FAILED: &str = "Chat message failed. User: {User}, Error: {Error}";

#[derive(Default)]
struct RecordingTransport {
    spans: Mutex<Vec<Span>>,
}

#[async_trait]
impl SpanTransport for RecordingTransport {
    async fn export(&self, batch: &[Span]) -> Result<(), ExportError> {
        self.spans.lock().extend(batch.iter().cloned());
        Ok(())
    }
}

struct TestEnv {
    addr: SocketAddr,
    client: reqwest::Client,
    sink: Arc<MemorySink>,
    transport: Arc<RecordingTransport>,
    shutdown_tx: oneshot::Sender<()>,
    server: tokio::task::JoinHandle<()>,
    guard: StateGuard,
}

impl TestEnv {
    async fn start(backend_url: Option<String>, ratio: f64) -> Self {
        let mut config = Config::default();
        config.server.address = "127.0.0.1:0".into();
        config.tracing.sampling.ratio = ratio;
        config.downstream.backend_url = backend_url;
        config.downstream.timeout_seconds = 5;

        let sink = Arc::new(MemorySink::new(Severity::Trace));
        let transport = Arc::new(RecordingTransport::default());
        let (state, guard): (AppState, StateGuard) = AppState::builder(config)
            .without_console()
            .with_sink(sink.clone())
            .with_transport(transport.clone())
            .build()
            .unwrap();

        let server = Server::bind(state).await.unwrap();
        let addr = server.local_addr();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let _ = server
                .serve(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Self {
            addr,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap(),
            sink,
            transport,
            shutdown_tx,
            server,
            guard,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn send_chat(&self, body: &str, traceparent: Option<&str>) -> reqwest::Response {
        let mut request = self
            .client
            .post(self.url("/api/chat/send"))
            .header("content-type", "application/json")
            .body(body.to_string());
        if let Some(value) = traceparent {
            request = request.header("traceparent", value);
        }
        request.send().await.unwrap()
    }

    /// Stop the server and flush spans; returns the exported spans
    async fn finish(self) -> Vec<Span> {
        let _ = self.shutdown_tx.send(());
        let _ = self.server.await;
        self.guard.shutdown().await;
        let spans = self.transport.spans.lock().clone();
        spans
    }
}

fn response_context(response: &reqwest::Response) -> TraceContext {
    let value = response
        .headers()
        .get("traceparent")
        .and_then(|v| v.to_str().ok())
        .expect("response should carry traceparent");
    TraceContext::parse(value, None).unwrap()
}

fn single(sink: &MemorySink, template: &str) -> LogRecord {
    let records = sink.find(template);
    assert_eq!(records.len(), 1, "expected one '{}' record", template);
    records.into_iter().next().unwrap()
}

#[tokio::test]
async fn test_health() {
    let env = TestEnv::start(None, 1.0).await;

    let response = env.client.get(env.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");

    let missing = env.client.get(env.url("/nope")).send().await.unwrap();
    assert_eq!(missing.status(), 404);

    env.finish().await;
}

#[tokio::test]
async fn test_chat_send_correlates_logs_spans_and_backend() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat/send"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&backend)
        .await;

    let env = TestEnv::start(Some(backend.uri()), 1.0).await;
    let response = env
        .send_chat(r#"{"user":"alice","message":"hello"}"#, None)
        .await;

    assert_eq!(response.status(), 200);
    let server_ctx = response_context(&response);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "sent");

    // Both records share the trace minted for the request
    let received = single(&env.sink, RECEIVED);
    let completed = single(&env.sink, COMPLETED);
    assert_eq!(received.trace_id(), Some(server_ctx.trace_id()));
    assert_eq!(completed.trace_id(), Some(server_ctx.trace_id()));
    assert_eq!(completed.span_id(), Some(server_ctx.span_id()));

    // Both records carry the request they were logged for
    for record in [&received, &completed] {
        assert_eq!(
            record.fields().get("RequestPath"),
            Some(&Scalar::from("/api/chat/send"))
        );
        assert_eq!(record.fields().get("RequestMethod"), Some(&Scalar::from("POST")));
    }

    // The backend saw the same trace
    let requests = backend.received_requests().await.unwrap();
    let forwarded = requests[0]
        .headers
        .get("traceparent")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| TraceContext::parse(v, None))
        .unwrap();
    assert_eq!(forwarded.trace_id(), server_ctx.trace_id());
    assert_ne!(forwarded.span_id(), server_ctx.span_id());
    backend.verify().await;

    let spans = env.finish().await;
    let server_span = spans
        .iter()
        .find(|s| s.kind() == SpanKind::Server)
        .unwrap();
    let client_span = spans
        .iter()
        .find(|s| s.kind() == SpanKind::Client)
        .unwrap();
    assert_eq!(server_span.context().span_id(), server_ctx.span_id());
    assert_eq!(server_span.parent_span_id(), None);
    assert_eq!(client_span.context().span_id(), forwarded.span_id());
    assert_eq!(client_span.parent_span_id(), Some(server_ctx.span_id()));
}

#[tokio::test]
async fn test_inbound_context_is_continued() {
    let env = TestEnv::start(None, 0.0).await;
    let inbound = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    let response = env
        .send_chat(r#"{"user":"bob","message":"hi"}"#, Some(inbound))
        .await;
    assert_eq!(response.status(), 200);

    let ctx = response_context(&response);
    assert_eq!(ctx.trace_id().to_hex(), "0af7651916cd43dd8448eb211c80319c");
    assert_ne!(ctx.span_id().to_hex(), "b7ad6b7169203331");
    // Sampled upstream wins over a ratio of 0
    assert!(ctx.is_sampled());

    let spans = env.finish().await;
    assert_eq!(spans.len(), 1);
    assert_eq!(
        spans[0].parent_span_id().map(|id| id.to_hex()),
        Some("b7ad6b7169203331".to_string())
    );
}

#[tokio::test]
async fn test_unsampled_request_still_correlates_logs() {
    let env = TestEnv::start(None, 1.0).await;
    let inbound = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-00";

    let response = env
        .send_chat(r#"{"user":"bob","message":"hi"}"#, Some(inbound))
        .await;
    assert_eq!(response.status(), 200);
    assert!(!response_context(&response).is_sampled());

    let received = single(&env.sink, RECEIVED);
    assert_eq!(
        received.trace_id().map(|id| id.to_hex()),
        Some("0af7651916cd43dd8448eb211c80319c".to_string())
    );

    let spans = env.finish().await;
    assert!(spans.is_empty());
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let env = TestEnv::start(None, 1.0).await;

    let response = env.send_chat("not json", None).await;
    assert_eq!(response.status(), 400);
    assert!(response.headers().contains_key("traceparent"));
    assert_eq!(env.sink.find("Chat message rejected: {Error}").len(), 1);
    assert!(env.sink.find(RECEIVED).is_empty());

    env.finish().await;
}

#[tokio::test]
async fn test_backend_failure_returns_bad_gateway() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&backend)
        .await;

    let env = TestEnv::start(Some(backend.uri()), 1.0).await;
    let response = env
        .send_chat(r#"{"user":"alice","message":"hello"}"#, None)
        .await;

    assert_eq!(response.status(), 502);
    let ctx = response_context(&response);
    let failed = single(&env.sink, FAILED);
    assert_eq!(failed.trace_id(), Some(ctx.trace_id()));
    assert!(env.sink.find(COMPLETED).is_empty());

    env.finish().await;
}

/// Read SSE chunks until `needle` shows up
async fn read_until(response: &mut reqwest::Response, buffer: &mut String, needle: &str) {
    let read = async {
        while !buffer.contains(needle) {
            match response.chunk().await.unwrap() {
                Some(chunk) => buffer.push_str(&String::from_utf8_lossy(&chunk)),
                None => panic!("stream ended before '{}'", needle),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("timed out waiting for SSE data");
}

#[tokio::test]
async fn test_hub_stream_receives_broadcast() {
    let env = TestEnv::start(None, 1.0).await;

    let mut stream = env.client.get(env.url("/hub/connect")).send().await.unwrap();
    assert_eq!(stream.status(), 200);
    assert_eq!(
        stream.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    let connection_id = stream.headers()[CONNECTION_ID_HEADER]
        .to_str()
        .unwrap()
        .to_string();

    let mut buffer = String::new();
    read_until(&mut stream, &mut buffer, "event: Connected").await;
    assert!(buffer.contains(&connection_id));

    // Broadcast through the hub method as the connected client
    let response = env
        .client
        .post(env.url("/hub/send"))
        .header(CONNECTION_ID_HEADER, &connection_id)
        .body(r#"{"user":"carol","message":"over sse"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let report: serde_json::Value = response.json().await.unwrap();
    assert_eq!(report["delivered"], 1);

    read_until(&mut stream, &mut buffer, "over sse").await;
    assert!(buffer.contains("event: ReceiveMessage"));

    // The relay's record sits inside both the request and the hub method scope
    let received = single(&env.sink, RECEIVED);
    let fields = received.fields();
    assert_eq!(fields.get("RequestPath"), Some(&Scalar::from("/hub/send")));
    assert_eq!(fields.get("Hub"), Some(&Scalar::from("ChatHub")));
    assert_eq!(fields.get("Method"), Some(&Scalar::from("SendMessage")));
    assert_eq!(fields.get("ConnectionId"), Some(&Scalar::from(connection_id.as_str())));

    assert_eq!(
        env.sink
            .find("Hub connection opened. ConnectionId: {ConnectionId}")
            .len(),
        1
    );

    drop(stream);
    env.finish().await;
}

#[tokio::test]
async fn test_hub_send_from_unknown_connection() {
    let env = TestEnv::start(None, 1.0).await;

    let response = env
        .client
        .post(env.url("/hub/send"))
        .header(CONNECTION_ID_HEADER, "not-connected")
        .body(r#"{"user":"mallory","message":"hi"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(
        env.sink
            .find("Hub method failed: {Hub}.{Method}: {Error}")
            .len(),
        1
    );

    env.finish().await;
}
