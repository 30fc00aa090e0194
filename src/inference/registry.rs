//! Engine registry
//!
//! The fixed table of model identifiers this service is willing to serve.

use serde::Serialize;

/// A supported model identifier and its human-readable description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSpec {
    /// Identifier clients send in requests (e.g. `distilgpt2`)
    pub name: String,
    /// Short description shown by `GET /models`
    pub description: String,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Built-in models, fastest first. The first entry is the default model.
const BUILTIN_MODELS: &[(&str, &str)] = &[
    (
        "distilgpt2",
        "Fast, lightweight GPT-2 model (82M parameters)",
    ),
    ("gpt2", "Standard GPT-2 model (124M parameters)"),
    ("gpt2-medium", "Medium-sized GPT-2 model (355M parameters)"),
    (
        "microsoft/DialoGPT-small",
        "Small conversational model (117M parameters)",
    ),
    (
        "microsoft/DialoGPT-medium",
        "Medium conversational model (355M parameters)",
    ),
];

/// Ordered, immutable set of supported models.
///
/// Built once at startup; there is no way to add an identifier afterwards.
#[derive(Debug, Clone)]
pub struct EngineRegistry {
    models: Vec<ModelSpec>,
}

impl EngineRegistry {
    /// Creates a registry from an explicit table. Duplicate names keep their
    /// first occurrence.
    pub fn new(models: Vec<ModelSpec>) -> Self {
        let mut unique: Vec<ModelSpec> = Vec::with_capacity(models.len());
        for spec in models {
            if !unique.iter().any(|m| m.name == spec.name) {
                unique.push(spec);
            }
        }
        Self { models: unique }
    }

    /// The registry compiled into the binary.
    pub fn builtin() -> Self {
        Self::new(
            BUILTIN_MODELS
                .iter()
                .map(|(name, description)| ModelSpec::new(*name, *description))
                .collect(),
        )
    }

    pub fn list_models(&self) -> &[ModelSpec] {
        &self.models
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Identifiers in registry order.
    pub fn names(&self) -> Vec<String> {
        self.models.iter().map(|m| m.name.clone()).collect()
    }

    /// The first (fastest) model, if the table is not empty.
    pub fn default_model(&self) -> Option<&ModelSpec> {
        self.models.first()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
