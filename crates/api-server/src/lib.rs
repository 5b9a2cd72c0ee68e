//! API Server
//!
//! REST and WebSocket surface of the custody lifecycle coordinator.
//!
//! # Features
//!
//! - **REST API**: delete/reset/rotation sagas, signature delivery,
//!   capital snapshots
//! - **WebSocket**: real-time saga step progress and reconciliation events
//! - **OpenAPI**: auto-generated Swagger documentation
//!
//! # Example
//!
//! ```ignore
//! use api_server::{ApiServer, ServerConfig};
//!
//! let config = ServerConfig::from_env();
//! let server = ApiServer::new(config, core_config, pool)?;
//! server.run().await?;
//! ```

pub mod error;
pub mod handlers;
pub mod routes;
pub mod signature_gateway;
pub mod state;
pub mod websocket;

pub use error::ApiError;
pub use routes::create_router;
pub use signature_gateway::ChannelSignatureGateway;
pub use state::AppState;

use axum::extract::DefaultBodyLimit;
use axum::http::Request;
use custody_core::config::Config;
use equity_monitor::{spawn_equity_aggregator, spawn_reconciliation_poller};
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::{info, Level};
use uuid::Uuid;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Enable CORS for all origins (development only).
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            cors_permissive: true,
        }
    }
}

impl ServerConfig {
    /// Create from environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .or_else(|_| std::env::var("API_PORT"))
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            cors_permissive: std::env::var("CORS_PERMISSIVE")
                .map(|v| v == "true")
                .unwrap_or(true),
        }
    }

    /// Get the socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Invalid socket address")
    }
}

/// The API server.
pub struct ApiServer {
    config: ServerConfig,
    core_config: Config,
    state: AppState,
    reconcile_rx: mpsc::Receiver<Uuid>,
}

impl ApiServer {
    /// Create a new API server.
    pub fn new(config: ServerConfig, core_config: Config, pool: PgPool) -> Self {
        let (state, reconcile_rx) = AppState::new(pool, &core_config);
        Self {
            config,
            core_config,
            state,
            reconcile_rx,
        }
    }

    /// Run the server.
    pub async fn run(self) -> anyhow::Result<()> {
        let state = Arc::new(self.state);

        let router = create_router(state.clone());
        let router = router
            .layer(
                TraceLayer::new_for_http()
                    .on_request(|request: &Request<_>, _span: &tracing::Span| {
                        tracing::info!(
                            method = %request.method(),
                            uri = %request.uri(),
                            "Incoming request"
                        );
                    })
                    .on_response(DefaultOnResponse::new().level(Level::DEBUG))
                    .on_failure(
                        |error: tower_http::classify::ServerErrorsFailureClass,
                         latency: std::time::Duration,
                         _span: &tracing::Span| {
                            tracing::error!(
                                error = %error,
                                latency_ms = latency.as_millis(),
                                "Request failed"
                            );
                        },
                    ),
            )
            .layer(DefaultBodyLimit::max(2 * 1024 * 1024)) // 2 MB
            .layer(if self.config.cors_permissive {
                CorsLayer::permissive()
            } else {
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any)
            });

        // ── Spawn background tasks ──

        spawn_equity_aggregator(self.core_config.aggregator.clone(), state.aggregator.clone());

        spawn_reconciliation_poller(
            self.core_config.reconciler.clone(),
            state.reconciler.clone(),
            self.reconcile_rx,
        );

        // Surface operations orphaned mid-signature by a previous process.
        match state.saga.awaiting_signature().await {
            Ok(parked) if !parked.is_empty() => {
                info!(
                    count = parked.len(),
                    "Operations awaiting a signature from a previous run; resume or abandon them"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list parked operations on startup");
            }
        }

        let addr = self.config.socket_addr();
        info!(address = %addr, "Starting API server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
