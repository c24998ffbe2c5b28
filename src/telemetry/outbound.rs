//! Outbound HTTP call tracing
//!
//! [`OutboundCallDecorator::wrap`] puts a client span around any outbound
//! call: it derives the child context, injects `traceparent`/`tracestate`
//! into the request headers, times the call, and hands the sealed span to
//! the exporter. The call's result is returned unchanged.

use crate::relay::ChatMessage;
use crate::telemetry::exporter::TraceExporter;
use crate::telemetry::propagation::{inject_into_headers, TraceContext};
use crate::telemetry::sampling::Sampler;
use crate::telemetry::span::{ActiveSpan, SpanKind, SpanStatus};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Anything an outbound call can return that carries an HTTP status
pub trait ResponseStatus {
    fn status_code(&self) -> u16;
}

impl ResponseStatus for reqwest::Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }
}

impl ResponseStatus for StatusCode {
    fn status_code(&self) -> u16 {
        self.as_u16()
    }
}

/// Span status for an HTTP response: 2xx and 3xx are `Ok`
pub fn status_for(code: u16) -> SpanStatus {
    if (200..400).contains(&code) {
        SpanStatus::Ok
    } else {
        SpanStatus::Error
    }
}

/// Wraps outbound calls in client spans
#[derive(Debug, Clone)]
pub struct OutboundCallDecorator {
    sampler: Sampler,
    exporter: Arc<TraceExporter>,
}

impl OutboundCallDecorator {
    pub fn new(sampler: Sampler, exporter: Arc<TraceExporter>) -> Self {
        Self { sampler, exporter }
    }

    /// Run `call` inside a client span
    ///
    /// # Arguments
    ///
    /// * `method`, `url` - Describe the call; the span is named `"<METHOD> <host>"`
    /// * `headers` - Request headers; the trace headers are added before `call` receives them
    /// * `current` - Context of the operation making the call. When absent a
    ///   new root trace is started with the sampler's decision.
    /// * `call` - Performs the request with the prepared headers
    ///
    /// If the returned future is dropped before the call completes, the span
    /// is sealed as cancelled.
    pub async fn wrap<F, Fut, T, E>(
        &self,
        method: &Method,
        url: &Url,
        mut headers: HeaderMap,
        current: Option<&TraceContext>,
        call: F,
    ) -> Result<T, E>
    where
        F: FnOnce(HeaderMap) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: ResponseStatus,
        E: Display,
    {
        let context = match current {
            Some(parent) => parent.derive_child(),
            None => self.sampler.new_root(),
        };
        inject_into_headers(&context, &mut headers);

        let host = url.host_str().unwrap_or("unknown");
        let mut span = self.exporter.track(ActiveSpan::start(
            format!("{} {}", method, host),
            SpanKind::Client,
            context,
            current.map(TraceContext::span_id),
        ));
        span.set_attribute("http.method", method.as_str());
        span.set_attribute("http.url", url.as_str());

        let started = Instant::now();
        let result = call(headers).await;
        let elapsed = started.elapsed();
        span.set_attribute("http.duration_ms", elapsed.as_millis() as u64);

        let status = match &result {
            Ok(response) => {
                let code = response.status_code();
                span.set_attribute("http.status_code", code);
                crate::metrics::record_outbound_call(
                    method.as_str(),
                    &code.to_string(),
                    elapsed.as_secs_f64(),
                );
                status_for(code)
            }
            Err(e) => {
                span.set_attribute("error.message", e.to_string());
                crate::metrics::record_outbound_call(method.as_str(), "error", elapsed.as_secs_f64());
                SpanStatus::Error
            }
        };

        span.end(status);
        result
    }
}

/// `reqwest::Client` with every request wrapped by the decorator
#[derive(Debug, Clone)]
pub struct TracedHttpClient {
    client: reqwest::Client,
    decorator: OutboundCallDecorator,
}

impl TracedHttpClient {
    pub fn new(client: reqwest::Client, decorator: OutboundCallDecorator) -> Self {
        Self { client, decorator }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Execute a built request under a client span
    pub async fn execute(
        &self,
        mut request: reqwest::Request,
        current: Option<&TraceContext>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let method = request.method().clone();
        let url = request.url().clone();
        let headers = std::mem::take(request.headers_mut());

        self.decorator
            .wrap(&method, &url, headers, current, move |headers| {
                *request.headers_mut() = headers;
                self.client.execute(request)
            })
            .await
    }
}

/// Errors from the edge → backend hop
#[derive(Error, Debug)]
pub enum BackendCallError {
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    #[error("Backend request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Backend responded with status {0}")]
    Status(u16),
}

/// Client for the backend's chat endpoint
#[derive(Debug, Clone)]
pub struct BackendChatClient {
    http: TracedHttpClient,
    send_url: Url,
}

impl BackendChatClient {
    /// Path of the backend's chat endpoint
    pub const SEND_PATH: &'static str = "api/chat/send";

    pub fn new(backend_url: &str, http: TracedHttpClient) -> Result<Self, BackendCallError> {
        let base = format!("{}/", backend_url.trim_end_matches('/'));
        let send_url = Url::parse(&base)
            .and_then(|base| base.join(Self::SEND_PATH))
            .map_err(|e| BackendCallError::InvalidUrl(format!("{}: {}", backend_url, e)))?;

        Ok(Self { http, send_url })
    }

    pub fn send_url(&self) -> &Url {
        &self.send_url
    }

    /// Forward a chat message to the backend
    pub async fn send_message(
        &self,
        message: &ChatMessage,
        current: Option<&TraceContext>,
    ) -> Result<(), BackendCallError> {
        let request = self
            .http
            .client()
            .post(self.send_url.clone())
            .json(&message.payload())
            .build()?;

        let response = self.http.execute(request, current).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(BackendCallError::Status(status.as_u16()))
        }
    }
}
