//! Generation engine seam
//!
//! The text-generation engine itself is an external collaborator: something
//! that maps a prompt and a sampling configuration to generated text. This
//! module defines that contract plus the loader used by the engine cache to
//! build engines on demand.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::registry::ModelSpec;

/// Errors raised by an engine or an engine loader
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Model file not found: {0}")]
    ModelNotFound(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("No generation backend available: {0}")]
    BackendUnavailable(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

/// Sampling configuration applied uniformly to every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Repetition penalty
    pub repetition_penalty: f32,
    /// Size of n-grams that may not repeat (0 = disabled)
    pub no_repeat_ngram_size: u32,
    /// Maximum total length in tokens, prompt included
    pub max_length: u32,
    /// Random seed for sampling
    pub seed: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            repetition_penalty: 1.1,
            no_repeat_ngram_size: 2,
            max_length: 120,
            seed: 42,
        }
    }
}

impl SamplingConfig {
    /// Clamp parameters into their valid ranges
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);

        if self.repetition_penalty <= 0.0 {
            self.repetition_penalty = 1.0;
        }

        if self.max_length == 0 {
            self.max_length = 120;
        }
    }
}

/// A constructed generation engine.
///
/// `generate` returns the full output text, echoed prompt included. It may be
/// slow and it may fail; it is never called on the async runtime directly.
pub trait Engine: Send + Sync {
    fn generate(&self, prompt: &str, config: &SamplingConfig) -> Result<String, EngineError>;

    /// Whether `generate` may run concurrently on one instance. Engines that
    /// return false get their calls serialized by the cache handle.
    fn supports_concurrent_generation(&self) -> bool {
        false
    }
}

/// Builds engines for registry entries. Construction is expensive.
pub trait EngineLoader: Send + Sync {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn Engine>, EngineError>;
}

/// Loader used when no generation backend is compiled in.
///
/// Every construction fails, which leaves the service running in a degraded
/// state: model listing and history still work.
#[derive(Debug, Default, Clone)]
pub struct UnavailableLoader;

impl EngineLoader for UnavailableLoader {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn Engine>, EngineError> {
        Err(EngineError::BackendUnavailable(format!(
            "cannot load '{}': rebuild with `--features llama`",
            spec.name
        )))
    }
}
