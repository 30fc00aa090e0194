//! Generation service
//!
//! Validates a request against the registry, obtains an engine from the
//! cache and runs it on the blocking pool. Engine failures never escape as
//! panics; they come back as [`GenerationError`].

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::inference::cache::{EngineCache, EngineConstructionError};
use crate::inference::engine::{EngineError, SamplingConfig};
use crate::inference::registry::ModelSpec;
use crate::storage::{InteractionLog, LogWriteError, StorageError};
use crate::truncate_str;
use crate::types::record::Conversation;

/// Errors returned to callers of the generation service
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Model '{model}' not available. Available models: {supported:?}")]
    UnsupportedModel {
        model: String,
        supported: Vec<String>,
    },

    #[error(transparent)]
    EngineConstruction(#[from] EngineConstructionError),

    #[error("Generation failed for model '{model}': {source}")]
    Generation {
        model: String,
        #[source]
        source: EngineError,
    },
}

/// One generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: String,
    pub sampling: SamplingConfig,
}

impl GenerationRequest {
    /// Request with the default sampling configuration
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            sampling: SamplingConfig::default(),
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }
}

/// Result of a non-streaming generation
#[derive(Debug, Clone)]
pub struct Completion {
    /// Full engine output, prompt included
    pub response: String,
    /// Set when the interaction could not be logged. The response is valid
    /// regardless.
    pub log_error: Option<String>,
}

/// Service health report
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: String,
    pub message: String,
    pub detail: String,
}

/// Validates, dispatches and logs generation requests
pub struct GenerationService {
    cache: Arc<EngineCache>,
    log: Arc<InteractionLog>,
    sampling: SamplingConfig,
    default_model: String,
}

impl GenerationService {
    pub fn new(
        cache: Arc<EngineCache>,
        log: Arc<InteractionLog>,
        sampling: SamplingConfig,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            log,
            sampling,
            default_model: default_model.into(),
        }
    }

    pub fn cache(&self) -> &EngineCache {
        &self.cache
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Supported models in registry order
    pub fn models(&self) -> &[ModelSpec] {
        self.cache.registry().list_models()
    }

    /// Builds a request with the service's sampling configuration, falling
    /// back to the default model when none is named.
    pub fn request(&self, prompt: impl Into<String>, model: Option<String>) -> GenerationRequest {
        GenerationRequest::new(prompt, model.unwrap_or_else(|| self.default_model.clone()))
            .with_sampling(self.sampling.clone())
    }

    /// Rejects identifiers that are not in the registry.
    pub fn validate(&self, model: &str) -> Result<(), GenerationError> {
        let registry = self.cache.registry();
        if registry.is_supported(model) {
            Ok(())
        } else {
            Err(GenerationError::UnsupportedModel {
                model: model.to_string(),
                supported: registry.names(),
            })
        }
    }

    /// Runs one generation without logging it.
    ///
    /// Returns the engine output unmodified, echoed prompt included.
    pub async fn complete(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.validate(&request.model)?;

        tracing::debug!(
            "Generating with {}: {:?}",
            request.model,
            truncate_str(&request.prompt, 80)
        );

        let engine = self.cache.acquire(&request.model).await?;
        let prompt = request.prompt.clone();
        let sampling = request.sampling.clone();

        let result = tokio::task::spawn_blocking(move || engine.generate(&prompt, &sampling))
            .await
            .unwrap_or_else(|e| Err(EngineError::Inference(format!("engine panicked: {e}"))));

        result.map_err(|source| {
            tracing::error!("Generation failed for model '{}': {}", request.model, source);
            GenerationError::Generation {
                model: request.model.clone(),
                source,
            }
        })
    }

    /// Runs one generation and logs it on success.
    ///
    /// A failure to log is reported in [`Completion::log_error`] and does not
    /// fail the call.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<Completion, GenerationError> {
        let response = self.complete(request).await?;

        let log_error = self
            .log_interaction(&request.prompt, &response, &request.model)
            .await
            .err()
            .map(|e| e.to_string());

        Ok(Completion {
            response,
            log_error,
        })
    }

    /// Appends one record to the interaction log off the async runtime.
    pub async fn log_interaction(
        &self,
        prompt: &str,
        response: &str,
        model: &str,
    ) -> Result<(), LogWriteError> {
        let log = Arc::clone(&self.log);
        let (prompt, response, model) = (prompt.to_string(), response.to_string(), model.to_string());

        let result = tokio::task::spawn_blocking(move || {
            log.record(&prompt, &response, Some(&model)).map(|_| ())
        })
        .await
        .unwrap_or_else(|e| Err(LogWriteError::Io(std::io::Error::other(e.to_string()))));

        if let Err(e) = &result {
            tracing::error!("Interaction was not logged: {}", e);
        }
        result
    }

    /// Interaction history, most recent first
    pub async fn conversations(&self) -> Result<Vec<Conversation>, StorageError> {
        let log = Arc::clone(&self.log);
        tokio::task::spawn_blocking(move || log.list_all())
            .await
            .unwrap_or_else(|e| Err(StorageError::ReadError(std::io::Error::other(e.to_string()))))
    }

    /// Reports whether the default model can be obtained.
    ///
    /// May construct the default engine if it is not resident.
    pub async fn health(&self) -> Health {
        match self.cache.acquire(&self.default_model).await {
            Ok(_) => Health {
                status: "healthy".to_string(),
                message: "MiniVault API is running".to_string(),
                detail: format!("models available: {}", self.cache.loaded_models().join(", ")),
            },
            Err(e) => {
                tracing::warn!("Health check degraded: {}", e);
                Health {
                    status: "degraded".to_string(),
                    message: "MiniVault API is running but models may not be available"
                        .to_string(),
                    detail: e.to_string(),
                }
            }
        }
    }
}
