//! HTTP server module
//!
//! Accepts connections and serves them with hyper (HTTP/1.1), one tokio task
//! per connection. Routing lives in [`routes`]. The metrics listener shares
//! the same accept loop.
//!
//! # Example
//!
//! ```no_run
//! use trace_relay::{config::Config, server::Server, state::AppState};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("config.yaml")?;
//! let (state, guard) = AppState::build(&config)?;
//! let server = Server::bind(state).await?;
//! server.run().await?;
//! guard.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod routes;

use crate::state::AppState;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use routes::ResponseBody;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("Server error: {0}")]
    RuntimeError(String),
}

/// HTTP Server
pub struct Server {
    state: AppState,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind to the configured address
    ///
    /// If port 0 is specified, the OS assigns an available port; see
    /// [`Server::local_addr`].
    pub async fn bind(state: AppState) -> Result<Self, ServerError> {
        let (listener, local_addr) = bind_listener(&state.config().server.address).await?;
        info!("Server bound to {}", local_addr);

        Ok(Self {
            state,
            listener,
            local_addr,
        })
    }

    /// The address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until Ctrl-C
    pub async fn run(self) -> Result<(), ServerError> {
        let (tx, rx) = tokio::sync::oneshot::channel::<std::io::Error>();
        let ctrl_c = async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                let _ = tx.send(e);
            }
        };
        self.serve(ctrl_c).await?;

        match rx.await {
            Ok(e) => Err(ServerError::RuntimeError(e.to_string())),
            Err(_) => Ok(()),
        }
    }

    /// Serve until `shutdown` completes
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        info!("Starting server on {}", self.local_addr);

        let state = self.state;
        serve_connections(&self.listener, shutdown, move |req| {
            let state = state.clone();
            async move { routes::handle_request(req, state).await }
        })
        .await;

        info!("Shutting down server");
        Ok(())
    }
}

/// Parse `address` and bind a listener to it
pub(crate) async fn bind_listener(address: &str) -> Result<(TcpListener, SocketAddr), ServerError> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|e| ServerError::BindError(format!("Invalid address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::BindError(format!("Failed to bind to {}: {}", addr, e)))?;

    let local_addr = listener
        .local_addr()
        .map_err(|e| ServerError::BindError(format!("Failed to get local address: {}", e)))?;

    Ok((listener, local_addr))
}

/// Accept connections until `shutdown` completes, serving each on its own task
///
/// Connections already accepted keep running after shutdown.
pub(crate) async fn serve_connections<F, H, Fut>(listener: &TcpListener, shutdown: F, handler: H)
where
    F: Future<Output = ()>,
    H: Fn(Request<Incoming>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<Response<ResponseBody>, Infallible>> + Send + 'static,
{
    tokio::pin!(shutdown);

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        let handler = handler.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);

            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                error!("Error serving connection from {}: {}", peer_addr, e);
            }
        });
    }
}
