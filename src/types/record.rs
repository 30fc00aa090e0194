//! Interaction records
//!
//! The on-disk shape of one completed interaction and the view of it served
//! by the history API.

use serde::{Deserialize, Serialize};

/// One line of the interaction log.
///
/// Unknown fields are ignored on read, so extra fields can be added without
/// breaking older readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// RFC 3339 timestamp, non-decreasing in file order
    pub timestamp: String,
    /// The prompt exactly as received
    pub prompt: String,
    /// Full text for `/generate`, generated suffix for `/stream`
    pub response: String,
    /// Model that produced the response. Absent in older logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A log record as returned by `GET /conversations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Line position in the log file. Not stable once the file is rewritten.
    pub id: String,
    pub timestamp: String,
    pub prompt: String,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Conversation {
    pub fn from_record(id: usize, record: LogRecord) -> Self {
        Self {
            id: id.to_string(),
            timestamp: record.timestamp,
            prompt: record.prompt,
            response: record.response,
            model: record.model,
        }
    }
}
