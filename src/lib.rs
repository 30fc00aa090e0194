//! MiniVault Library
//!
//! A local text-generation API: a bounded cache of generation engines, a
//! synthetic streaming layer and an append-only interaction log, served over
//! HTTP.

pub mod app;
pub mod config;
pub mod inference;
pub mod server;
pub mod service;
pub mod storage;
pub mod types;

/// Safely truncate a string at a char boundary, never panics.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    // Walk backwards from max_bytes to find a valid char boundary
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
