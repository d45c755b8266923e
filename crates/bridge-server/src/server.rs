use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use bridge_core::ApiKey;
use bridge_engine::SessionRegistry;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::require_api_key;
use crate::handlers;

/// Server configuration.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_key: ApiKey,
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            api_key: ApiKey::new("bridge-secret-key"),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub api_key: Arc<ApiKey>,
}

/// Build the Axum router. Everything except `/health` requires the API key.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let sessions = Router::new()
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{id}/start", post(handlers::start_session))
        .route("/sessions/{id}/status", get(handlers::session_status))
        .route("/sessions/{id}/send", post(handlers::send_message))
        .route("/sessions/{id}/disconnect", post(handlers::disconnect_session))
        .route("/sessions/{id}/logout", post(handlers::logout_session))
        .route("/sessions/{id}/reset", post(handlers::reset_session))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(sessions)
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. The server runs until the handle is shut down.
pub async fn start(
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState {
        registry,
        api_key: Arc::new(config.api_key),
    };
    let router = build_router(state, config.request_timeout);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "management API listening");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "management API stopped");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        shutdown,
        task,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting requests and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}
