//! HTTP API server for the Chorus gateway

pub mod chat;
mod error;
pub mod health;
pub mod history;
pub mod providers;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::chat::ChatService;
use crate::config::ServerConfig;
use crate::db::DbPool;

pub use error::ApiError;

/// Shared state for API handlers
pub struct ApiState {
    pub chat: ChatService,
    pub db: DbPool,
    pub server: ServerConfig,
}

impl ApiState {
    #[must_use]
    pub const fn new(chat: ChatService, db: DbPool, server: ServerConfig) -> Self {
        Self { chat, db, server }
    }
}

/// Build the router with all routes
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = cors_layer(&state.server);
    let body_limit = state.server.max_request_body_size;
    let static_dir = state.server.static_dir.clone();

    let mut router = Router::new()
        .merge(chat::router(state.clone()))
        .merge(providers::router(state.clone()))
        .merge(history::router(state.clone()))
        .merge(health::router(state));

    // Serve the frontend bundle if configured
    if let Some(static_dir) = static_dir {
        let index_file = static_dir.join("index.html");
        let serve_dir = ServeDir::new(&static_dir).not_found_service(ServeFile::new(index_file));

        router = router.fallback_service(serve_dir);
        tracing::info!(path = %static_dir.display(), "serving static files");
    }

    router
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if server.allows_any_origin() {
        return cors.allow_origin(Any).expose_headers(Any);
    }

    let origins: Vec<HeaderValue> = server
        .cors_allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
        .expose_headers([chat::SESSION_ID_HEADER])
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
}

impl ApiServer {
    #[must_use]
    pub fn new(state: ApiState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Run the API server until `shutdown` is cancelled
    ///
    /// In-flight requests are allowed to finish after shutdown begins.
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.state.server.host, self.state.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server on {addr}: {e}")))?;

        tracing::info!(%addr, "API server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        tracing::info!("API server stopped");
        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
