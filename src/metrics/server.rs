//! Prometheus scrape listener
//!
//! Serves `GET /metrics` in the Prometheus text format on its own port. It
//! runs on the same accept loop as the main server; anything other than
//! `GET /metrics` is 404.
//!
//! # Example
//!
//! ```no_run
//! use trace_relay::config::MetricsConfig;
//! use trace_relay::metrics::server::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MetricsServer::bind(&MetricsConfig::default()).await?;
//! println!("Metrics server listening on {}", server.local_addr());
//! server.serve(std::future::pending()).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::MetricsConfig;
use crate::server::routes::{full_body, response_with, text_response, ResponseBody};
use crate::server::{bind_listener, serve_connections, ServerError};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use prometheus::{Encoder, TextEncoder, TEXT_FORMAT};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Path scraped by Prometheus
pub const METRICS_PATH: &str = "/metrics";

/// Listener for the metrics endpoint
pub struct MetricsServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl MetricsServer {
    /// Bind to `host:port` from the metrics configuration (port 0 picks a
    /// free port)
    pub async fn bind(config: &MetricsConfig) -> Result<Self, ServerError> {
        let (listener, local_addr) = bind_listener(&config.address()).await?;
        tracing::debug!("Metrics server bound to {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve scrapes until `shutdown` completes
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        serve_connections(&self.listener, shutdown, handle_request).await;
        tracing::debug!("Metrics server on {} stopped", self.local_addr);
        Ok(())
    }
}

async fn handle_request(req: Request<Incoming>) -> Result<Response<ResponseBody>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, METRICS_PATH) => render_metrics(),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

/// Encode every registered metric family
fn render_metrics() -> Response<ResponseBody> {
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        Ok(()) => response_with(StatusCode::OK, TEXT_FORMAT, full_body(buffer)),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode metrics");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
        }
    }
}
