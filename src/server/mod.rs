//! HTTP API
//!
//! Thin axum layer over the generation service.
//!
//! ## Endpoints
//!
//! - `POST /generate` - Generate text from `{prompt, model?}`
//! - `GET /stream` - Stream generated text via SSE (`?prompt=&model=`)
//! - `GET /models` - Supported models
//! - `GET /conversations` - Logged interactions, most recent first
//! - `GET /health` - Health check

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::service::{GenerationService, StreamingAdapter};

pub mod error;
pub mod handlers;
pub mod types;

pub use error::ApiError;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<GenerationService>,
    pub streaming: Arc<StreamingAdapter>,
}

impl AppState {
    pub fn new(service: Arc<GenerationService>, streaming: Arc<StreamingAdapter>) -> Self {
        Self { service, streaming }
    }
}

/// Build the router with CORS restricted to `allow_origins`.
pub fn create_router(state: AppState, allow_origins: &[String]) -> Router {
    Router::new()
        .route("/generate", post(handlers::generate_handler))
        .route("/stream", get(handlers::stream_handler))
        .route("/models", get(handlers::models_handler))
        .route("/conversations", get(handlers::conversations_handler))
        .route("/health", get(handlers::health_handler))
        .layer(cors_layer(allow_origins))
        .with_state(state)
}

fn cors_layer(allow_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allow_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Ignoring invalid CORS origin {:?}: {}", origin, e);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Serve until Ctrl-C.
pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
