//! Generation engines
//!
//! The registry of supported models, the engine seam, the engine cache and
//! the streaming event type. The llama.cpp backend is behind the `llama`
//! feature.

pub mod cache;
pub mod engine;
#[cfg(feature = "llama")]
pub mod llama;
pub mod registry;
pub mod streaming;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use cache::{EngineCache, EngineConstructionError, EngineHandle, LoadedEngine};
pub use engine::{Engine, EngineError, EngineLoader, SamplingConfig, UnavailableLoader};
#[cfg(feature = "llama")]
pub use llama::LlamaLoader;
pub use registry::{EngineRegistry, ModelSpec};
pub use streaming::StreamEvent;
