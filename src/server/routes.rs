//! Request routing and handlers
//!
//! # Endpoints
//!
//! * `GET /health` - Health check (returns "ok")
//! * `POST /api/chat/send` - Accept a chat message, broadcast it and
//!   optionally forward it to the backend
//! * `GET /hub/connect` - Server-sent event stream of broadcast messages
//! * `POST /hub/send` - Hub `SendMessage` invocation
//! * All other requests return 404 Not Found

use crate::logging::with_operation;
use crate::relay::{new_connection_id, ChatMessage, ChatRelay, HubError, RelayEvent};
use crate::state::AppState;
use crate::telemetry::propagation::{extract_from_headers, TraceContext};
use crate::telemetry::{ActiveSpan, SpanKind, SpanStatus, TrackedSpan};
use crate::value::Fields;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use std::convert::Infallible;
use tokio::sync::mpsc;

/// Response body type shared by every handler
pub type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

/// Header naming the hub connection that invokes a hub method
pub const CONNECTION_ID_HEADER: &str = "x-connection-id";

pub const CHAT_SEND_PATH: &str = "/api/chat/send";
pub const HUB_CONNECT_PATH: &str = "/hub/connect";
pub const HUB_SEND_PATH: &str = "/hub/send";

/// Route a request to its handler
///
/// Each request is one logging operation. Everything logged while it is
/// handled carries `RequestPath` and `RequestMethod`.
pub async fn handle_request(
    req: Request<Incoming>,
    state: AppState,
) -> Result<Response<ResponseBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = with_operation(async {
        let _request_scope = state.logger().begin_scope(
            Fields::new()
                .with("RequestPath", path.as_str())
                .with("RequestMethod", method.as_str()),
        );

        match (&method, path.as_str()) {
            (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),
            (&Method::POST, CHAT_SEND_PATH) => chat_send(req, &state).await,
            (&Method::GET, HUB_CONNECT_PATH) => hub_connect(&state),
            (&Method::POST, HUB_SEND_PATH) => hub_send(req, &state).await,
            _ => {
                tracing::debug!(%method, path = %path, "No route");
                text_response(StatusCode::NOT_FOUND, "Not Found")
            }
        }
    })
    .await;
    Ok(response)
}

// ============================================================================
// Response helpers
// ============================================================================

pub(crate) fn full_body(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into()).boxed_unsync()
}

pub(crate) fn response_with(status: StatusCode, content_type: &'static str, body: ResponseBody) -> Response<ResponseBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

pub(crate) fn text_response(status: StatusCode, body: &'static str) -> Response<ResponseBody> {
    response_with(status, "text/plain", full_body(body))
}

fn json_response(status: StatusCode, body: &Value) -> Response<ResponseBody> {
    response_with(status, "application/json", full_body(body.to_string()))
}

/// Add the server span's `traceparent` (and `tracestate`) to a response
fn with_trace_headers(mut response: Response<ResponseBody>, context: &TraceContext) -> Response<ResponseBody> {
    crate::telemetry::propagation::inject_into_headers(context, response.headers_mut());
    response
}

// ============================================================================
// Server spans
// ============================================================================

/// Resolve the inbound context and open the server span for a request
///
/// A propagated context becomes the parent of the server span. Without one,
/// the freshly minted root context is the server span itself.
fn begin_server_span(state: &AppState, headers: &HeaderMap, name: &str) -> (TraceContext, TrackedSpan) {
    let inbound = state.sampler().resolve_inbound(extract_from_headers(headers));

    let (context, parent_span_id) = if inbound.is_propagated() {
        let parent = inbound.into_context();
        (parent.derive_child(), Some(parent.span_id()))
    } else {
        (inbound.into_context(), None)
    };

    let mut span = state.exporter().track(ActiveSpan::start(
        name,
        SpanKind::Server,
        context.clone(),
        parent_span_id,
    ));
    span.set_attribute("http.route", name);
    (context, span)
}

fn finish_span(mut span: TrackedSpan, status: StatusCode) {
    span.set_attribute("http.status_code", status.as_u16());
    let span_status = if status.is_success() {
        SpanStatus::Ok
    } else {
        SpanStatus::Error
    };
    span.end(span_status);
}

async fn read_message(req: Request<Incoming>) -> Result<ChatMessage, String> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| format!("failed to read body: {}", e))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| format!("invalid JSON: {}", e))
}

// ============================================================================
// Handlers
// ============================================================================

/// `POST /api/chat/send`
async fn chat_send(req: Request<Incoming>, state: &AppState) -> Response<ResponseBody> {
    let (context, span) = begin_server_span(state, req.headers(), "POST /api/chat/send");
    let logger = state.logger();

    let message = match read_message(req).await {
        Ok(message) => message.with_context(context.clone()),
        Err(error) => {
            logger.warn(
                "Chat message rejected: {Error}",
                Fields::new().with("Error", &error),
                Some(&context),
            );
            crate::metrics::record_chat_request("bad_request");
            finish_span(span, StatusCode::BAD_REQUEST);
            return with_trace_headers(
                json_response(StatusCode::BAD_REQUEST, &json!({ "error": error })),
                &context,
            );
        }
    };

    let report = state.relay().publish(message.clone()).await;

    if let Some(backend) = state.backend() {
        if let Err(e) = backend.send_message(&message, Some(&context)).await {
            logger.error(
                "Chat message failed. User: {User}, Error: {Error}",
                Fields::new()
                    .with("User", &message.user)
                    .with("Error", e.to_string()),
                Some(&context),
            );
            crate::metrics::record_chat_request("failed");
            finish_span(span, StatusCode::BAD_GATEWAY);
            return with_trace_headers(
                json_response(
                    StatusCode::BAD_GATEWAY,
                    &json!({ "error": "backend call failed" }),
                ),
                &context,
            );
        }
    }

    logger.info(
        "Chat message completed. User: {User}, Recipients: {Recipients}",
        Fields::new()
            .with("User", &message.user)
            .with("Recipients", report.recipients()),
        Some(&context),
    );
    crate::metrics::record_chat_request("completed");
    finish_span(span, StatusCode::OK);

    with_trace_headers(
        json_response(
            StatusCode::OK,
            &json!({
                "status": "sent",
                "delivered": report.delivered.len(),
                "disconnected": report.disconnected.len(),
            }),
        ),
        &context,
    )
}

/// `POST /hub/send`
async fn hub_send(req: Request<Incoming>, state: &AppState) -> Response<ResponseBody> {
    let (context, span) = begin_server_span(state, req.headers(), "POST /hub/send");
    let connection_id = req
        .headers()
        .get(CONNECTION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let message = match read_message(req).await {
        Ok(message) => message.with_context(context.clone()),
        Err(error) => {
            finish_span(span, StatusCode::BAD_REQUEST);
            return with_trace_headers(
                json_response(StatusCode::BAD_REQUEST, &json!({ "error": error })),
                &context,
            );
        }
    };

    let (status, body) = match state
        .hub()
        .send_message(connection_id.as_deref(), message)
        .await
    {
        Ok(report) => (
            StatusCode::OK,
            json!({ "delivered": report.delivered.len(), "disconnected": report.disconnected.len() }),
        ),
        Err(e @ HubError::NotConnected(_)) => (StatusCode::NOT_FOUND, json!({ "error": e.to_string() })),
    };

    finish_span(span, status);
    with_trace_headers(json_response(status, &body), &context)
}

/// An open SSE connection; dropping it unsubscribes
struct SseConnection {
    connection_id: String,
    rx: mpsc::Receiver<RelayEvent>,
    state: AppState,
}

impl Drop for SseConnection {
    fn drop(&mut self) {
        self.state.connections().close(&self.connection_id);
        self.state.hub().on_disconnected(&self.connection_id);
    }
}

fn sse_frame(event: &str, data: &Value) -> Frame<Bytes> {
    Frame::data(Bytes::from(format!("event: {}\ndata: {}\n\n", event, data)))
}

/// `GET /hub/connect`
fn hub_connect(state: &AppState) -> Response<ResponseBody> {
    let connection_id = new_connection_id();
    let rx = state.connections().open(&connection_id);
    state.hub().on_connected(&connection_id);

    let greeting = sse_frame("Connected", &json!({ "connectionId": connection_id }));
    let connection = SseConnection {
        connection_id: connection_id.clone(),
        rx,
        state: state.clone(),
    };

    let events = stream::unfold(connection, |mut connection| async move {
        let event = connection.rx.recv().await?;
        let frame = sse_frame(&event.event, &event.payload);
        Some((Ok::<_, Infallible>(frame), connection))
    });
    let body = stream::once(async move { Ok::<_, Infallible>(greeting) }).chain(events);

    let mut response = response_with(
        StatusCode::OK,
        "text/event-stream",
        StreamBody::new(body).boxed_unsync(),
    );
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(value) = HeaderValue::from_str(&connection_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(CONNECTION_ID_HEADER), value);
    }
    response
}
