//! Trawl Server - HTTP API server.
//!
//! This crate exposes the capture proxy manager over HTTP.
//!
//! ## Endpoints
//!
//! - `POST /api/sessions/{id}/proxy/start` - Launch the capture proxy
//! - `POST /api/sessions/{id}/proxy/stop` - Stop it, optionally dropping data
//! - `GET /api/sessions/{id}/proxy/status` - Status and traffic stats
//! - `GET /api/sessions/{id}/traffic` - Filtered, paginated traffic summaries
//! - `DELETE /api/sessions/{id}/traffic` - Clear old or all traffic
//! - `GET /api/sessions/{id}/traffic/{entry_id}` - One exchange with bodies
//! - `GET /api/health` - Liveness
//!
//! ## Example
//!
//! ```no_run
//! use trawl_core::TrawlConfig;
//! use trawl_proxy::ProxyManager;
//! use trawl_server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = ProxyManager::new(TrawlConfig::from_env());
//!     let server = Server::new(ServerConfig::default(), manager).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod models;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use trawl_proxy::ProxyManager;

pub use error::{ApiError, ErrorResponse, Result};
pub use state::AppState;

/// Default server port.
pub const DEFAULT_PORT: u16 = 8787;

/// Default server host (localhost only).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1).
    pub host: String,
    /// Port to bind to (default: 8787).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Builds the API router around `state`.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handlers::health))
        .route(
            "/api/sessions/{session_id}/proxy/start",
            post(handlers::start_proxy),
        )
        .route(
            "/api/sessions/{session_id}/proxy/stop",
            post(handlers::stop_proxy),
        )
        .route(
            "/api/sessions/{session_id}/proxy/status",
            get(handlers::proxy_status),
        )
        .route(
            "/api/sessions/{session_id}/traffic",
            get(handlers::query_traffic).delete(handlers::clear_traffic),
        )
        .route(
            "/api/sessions/{session_id}/traffic/{entry_id}",
            get(handlers::get_traffic_entry),
        )
        .layer(cors)
        .with_state(state)
}

/// The HTTP API server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Creates a server that drives `manager`.
    pub fn new(
        config: ServerConfig,
        manager: ProxyManager,
    ) -> std::result::Result<Self, ServerError> {
        Self::with_state(config, AppState::new(manager))
    }

    /// Creates a server with custom application state.
    pub fn with_state(
        config: ServerConfig,
        state: AppState,
    ) -> std::result::Result<Self, ServerError> {
        let router = build_router(state);

        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;

        Ok(Self { router, addr })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the server until the process is killed.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the server until `shutdown` resolves, then drains open requests.
    pub async fn run_until<F>(self, shutdown: F) -> std::result::Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Starting Trawl API server on {}", self.addr);

        let listener = self.bind()?;

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        info!("Trawl API server stopped");
        Ok(())
    }

    fn bind(&self) -> std::result::Result<tokio::net::TcpListener, ServerError> {
        let domain = if self.addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        // Restarts must not fail on sockets lingering in TIME_WAIT.
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        socket
            .bind(&self.addr.into())
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .listen(128)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        tokio::net::TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::BindError(self.addr, e))
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}
