//! Shared domain types

pub mod record;

pub use record::{Conversation, LogRecord};
