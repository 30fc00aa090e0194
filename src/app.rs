//! Application wiring
//!
//! Builds the engine cache, interaction log, generation service and
//! streaming adapter from a [`ServiceConfig`]. Each `App` is independent, so
//! tests can build as many as they like.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use crate::config::ServiceConfig;
use crate::inference::{EngineCache, EngineLoader, EngineRegistry};
use crate::server::{create_router, AppState};
use crate::service::{GenerationService, StreamingAdapter};
use crate::storage::{InteractionLog, StorageError};

/// A fully wired service instance
pub struct App {
    pub config: ServiceConfig,
    pub service: Arc<GenerationService>,
    pub streaming: Arc<StreamingAdapter>,
}

impl App {
    /// Wire the service. Opens (and creates) the interaction log.
    pub fn new(
        config: ServiceConfig,
        registry: EngineRegistry,
        loader: Arc<dyn EngineLoader>,
    ) -> Result<Self, StorageError> {
        let log = InteractionLog::open(&config.log_path)?;
        let cache = EngineCache::new(registry, loader, config.cache_capacity);

        let service = Arc::new(GenerationService::new(
            Arc::new(cache),
            Arc::new(log),
            config.sampling.clone(),
            config.default_model.clone(),
        ));
        let streaming = Arc::new(StreamingAdapter::new(
            service.clone(),
            Duration::from_millis(config.stream_delay_ms),
        ));

        tracing::info!(
            "App initialized (default model: {}, cache capacity: {})",
            config.default_model,
            config.cache_capacity
        );

        Ok(Self {
            config,
            service,
            streaming,
        })
    }

    /// Construct the configured preload models. Failures are logged only.
    pub async fn preload(&self) -> Vec<String> {
        self.service.cache().preload(&self.config.preload).await
    }

    pub fn router(&self) -> Router {
        create_router(
            AppState::new(self.service.clone(), self.streaming.clone()),
            &self.config.allow_origins,
        )
    }
}
