//! Generation service
//!
//! Request validation, engine dispatch through the cache, interaction
//! logging, and the streaming adapter layered on top.

pub mod generation;
pub mod streaming;

pub use generation::{Completion, GenerationError, GenerationRequest, GenerationService, Health};
pub use streaming::{EventStream, StreamingAdapter};
