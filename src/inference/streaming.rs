//! Streaming output support
//!
//! Generation is not incremental: a stream is a completed result replayed as
//! one event per character, ending in exactly one terminal `Done`.

/// An event delivered to a streaming client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A fragment of generated text (one character)
    Chunk(String),
    /// Generation completed; always the last event
    Done,
    /// Generation failed; followed only by `Done`
    Error(String),
}

impl StreamEvent {
    /// Returns true if this is a chunk variant
    pub fn is_chunk(&self) -> bool {
        matches!(self, StreamEvent::Chunk(_))
    }

    /// Returns true if this is the terminal marker
    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done)
    }

    /// Returns true if an error occurred
    pub fn is_error(&self) -> bool {
        matches!(self, StreamEvent::Error(_))
    }

    /// Extracts the text if this is a Chunk variant
    pub fn as_chunk(&self) -> Option<&str> {
        match self {
            StreamEvent::Chunk(s) => Some(s),
            _ => None,
        }
    }

    /// Extracts the error message if this is an Error variant
    pub fn as_error(&self) -> Option<&str> {
        match self {
            StreamEvent::Error(s) => Some(s),
            _ => None,
        }
    }
}

/// The generated text that follows the echoed prompt.
///
/// Engines echo the prompt, but tokenizers do not always reproduce it byte
/// for byte, so when the output does not start with the prompt the first
/// `prompt.chars().count()` characters are dropped instead.
pub fn prompt_suffix<'a>(full_text: &'a str, prompt: &str) -> &'a str {
    if let Some(rest) = full_text.strip_prefix(prompt) {
        return rest;
    }

    let skip = prompt.chars().count();
    match full_text.char_indices().nth(skip) {
        Some((offset, _)) => &full_text[offset..],
        None => "",
    }
}

/// Splits text into one `Chunk` per character, in order.
pub fn chunk_events(text: &str) -> impl Iterator<Item = StreamEvent> + '_ {
    text.chars().map(|c| StreamEvent::Chunk(c.to_string()))
}
