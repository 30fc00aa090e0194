//! MiniVault - local text generation API
//!
//! Serves text generation, streaming and interaction history over HTTP.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use minivault::app::App;
use minivault::config::{load_config, ServiceConfig};
use minivault::inference::{EngineLoader, EngineRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("minivault=info")),
        )
        .init();

    info!("Starting MiniVault API v{}", env!("CARGO_PKG_VERSION"));

    let registry = EngineRegistry::builtin();
    let config = load_config(&registry);
    let loader = build_loader(&config);

    let app = App::new(config, registry, loader).context("failed to open interaction log")?;

    // Preloading is best-effort; models load on demand if it fails.
    let loaded = app.preload().await;
    if loaded.is_empty() && !app.config.preload.is_empty() {
        info!("No models preloaded; API will load models on first request");
    }

    let listener = TcpListener::bind(app.config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", app.config.bind_address))?;
    info!("MiniVault API listening on http://{}", listener.local_addr()?);

    minivault::server::serve(listener, app.router()).await?;

    info!("MiniVault API stopped");
    Ok(())
}

#[cfg(feature = "llama")]
fn build_loader(config: &ServiceConfig) -> Arc<dyn EngineLoader> {
    info!("Loading models from {}", config.models_directory.display());
    Arc::new(minivault::inference::LlamaLoader::new(
        &config.models_directory,
        gpu_layers(),
    ))
}

#[cfg(not(feature = "llama"))]
fn build_loader(_config: &ServiceConfig) -> Arc<dyn EngineLoader> {
    tracing::warn!("Built without a generation backend; enable the `llama` feature");
    Arc::new(minivault::inference::UnavailableLoader)
}

/// Layers offloaded to GPU, from `MINIVAULT_GPU_LAYERS` (default: all)
#[cfg(feature = "llama")]
fn gpu_layers() -> u32 {
    std::env::var("MINIVAULT_GPU_LAYERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(99)
}
