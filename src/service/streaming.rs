//! Streaming adapter
//!
//! Turns one blocking generation into an ordered event sequence. Nothing is
//! computed incrementally: the full text is generated first, the echoed
//! prompt is cut off, and the remainder is replayed one character at a time
//! with optional pacing.
//!
//! The stream is lazy. Each event is produced only when the consumer polls
//! for it, so the interaction is logged only once the consumer asks for the
//! event after the last chunk. A consumer that drops the stream earlier
//! leaves no record.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::StreamExt;

use crate::inference::streaming::{chunk_events, prompt_suffix, StreamEvent};
use crate::service::generation::{GenerationError, GenerationRequest, GenerationService};

/// Lazy, finite, single-use sequence of stream events
pub type EventStream = BoxStream<'static, StreamEvent>;

pub struct StreamingAdapter {
    service: Arc<GenerationService>,
    delay: Duration,
}

impl StreamingAdapter {
    /// `delay` is the pause after each chunk; zero disables pacing.
    pub fn new(service: Arc<GenerationService>, delay: Duration) -> Self {
        Self { service, delay }
    }

    /// Starts streaming a generation.
    ///
    /// An unsupported model is rejected here, before any event is produced.
    /// Every other failure arrives in-band as `Error` followed by `Done`.
    pub fn stream(&self, request: GenerationRequest) -> Result<EventStream, GenerationError> {
        self.service.validate(&request.model)?;

        let emitter = Emitter {
            service: Arc::clone(&self.service),
            request,
            delay: self.delay,
            phase: Phase::Generate,
        };

        Ok(stream::unfold(emitter, |mut emitter| async move {
            let event = emitter.next_event().await?;
            Some((event, emitter))
        })
        .boxed())
    }
}

enum Phase {
    Generate,
    Replay {
        suffix: String,
        chunks: std::vec::IntoIter<StreamEvent>,
        paced: bool,
    },
    Failed,
    Finished,
}

/// State of one stream between polls
struct Emitter {
    service: Arc<GenerationService>,
    request: GenerationRequest,
    delay: Duration,
    phase: Phase,
}

impl Emitter {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            match mem::replace(&mut self.phase, Phase::Finished) {
                Phase::Generate => match self.service.complete(&self.request).await {
                    Ok(full_text) => {
                        let suffix = prompt_suffix(&full_text, &self.request.prompt).to_string();
                        let chunks: Vec<StreamEvent> = chunk_events(&suffix).collect();
                        self.phase = Phase::Replay {
                            suffix,
                            chunks: chunks.into_iter(),
                            paced: false,
                        };
                    }
                    Err(e) => {
                        self.phase = Phase::Failed;
                        return Some(StreamEvent::Error(e.to_string()));
                    }
                },
                Phase::Replay {
                    suffix,
                    mut chunks,
                    paced,
                } => {
                    if paced && !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }

                    if let Some(chunk) = chunks.next() {
                        self.phase = Phase::Replay {
                            suffix,
                            chunks,
                            paced: true,
                        };
                        return Some(chunk);
                    }

                    // A log failure is reported by the service and does not
                    // end the stream with an error: the client has the text.
                    let _ = self
                        .service
                        .log_interaction(&self.request.prompt, &suffix, &self.request.model)
                        .await;
                    return Some(StreamEvent::Done);
                }
                Phase::Failed => return Some(StreamEvent::Done),
                Phase::Finished => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::FakeLoader;
    use crate::service::generation::tests::build_service;
    use futures::StreamExt;

    async fn collect(stream: EventStream) -> Vec<StreamEvent> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_stream_emits_suffix_per_character_then_done() {
        let (_dir, service, _loader) = build_service(FakeLoader::new().with_completion("abc"));
        let adapter = StreamingAdapter::new(service.clone(), Duration::ZERO);

        let events = collect(adapter.stream(service.request("P", None)).unwrap()).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk("a".to_string()),
                StreamEvent::Chunk("b".to_string()),
                StreamEvent::Chunk("c".to_string()),
                StreamEvent::Done,
            ]
        );

        let history = service.conversations().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].prompt, "P");
        assert_eq!(history[0].response, "abc");
    }

    #[tokio::test]
    async fn test_stream_with_pacing_keeps_order() {
        let (_dir, service, _loader) = build_service(FakeLoader::new().with_completion("xyz"));
        let adapter = StreamingAdapter::new(service.clone(), Duration::from_millis(5));

        let events = collect(adapter.stream(service.request("Q", None)).unwrap()).await;
        let text: String = events.iter().filter_map(StreamEvent::as_chunk).collect();

        assert_eq!(text, "xyz");
        assert_eq!(events.last(), Some(&StreamEvent::Done));
    }

    #[tokio::test]
    async fn test_stream_failure_yields_error_then_done() {
        let (_dir, service, _loader) = build_service(FakeLoader::new().failing_generation());
        let adapter = StreamingAdapter::new(service.clone(), Duration::ZERO);

        let events = collect(adapter.stream(service.request("P", None)).unwrap()).await;

        assert_eq!(events.len(), 2);
        assert!(events[0].is_error());
        assert!(events[0].as_error().unwrap().contains("CUDA out of memory"));
        assert!(events[1].is_done());
        assert!(service.conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_rejects_unsupported_model_upfront() {
        let (_dir, service, loader) = build_service(FakeLoader::new());
        let adapter = StreamingAdapter::new(service.clone(), Duration::ZERO);

        let result = adapter.stream(service.request("P", Some("invalid_model".to_string())));

        assert!(matches!(result, Err(GenerationError::UnsupportedModel { .. })));
        assert_eq!(loader.total_loads(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_stops_stream_without_logging() {
        let (_dir, service, _loader) =
            build_service(FakeLoader::new().with_completion("abcdefghijklmnop"));
        let adapter = StreamingAdapter::new(service.clone(), Duration::from_millis(20));

        let mut stream = adapter.stream(service.request("P", None)).unwrap();
        let first = stream.next().await;
        assert_eq!(first, Some(StreamEvent::Chunk("a".to_string())));
        drop(stream);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(service.conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unpaced_disconnect_leaves_no_record() {
        let (_dir, service, _loader) = build_service(FakeLoader::new().with_completion("abcdefghij"));
        let adapter = StreamingAdapter::new(service.clone(), Duration::ZERO);

        let mut stream = adapter.stream(service.request("P", None)).unwrap();
        assert_eq!(stream.next().await, Some(StreamEvent::Chunk("a".to_string())));
        drop(stream);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(service.conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_logged_only_after_last_chunk_is_consumed() {
        let (_dir, service, _loader) = build_service(FakeLoader::new().with_completion("ab"));
        let adapter = StreamingAdapter::new(service.clone(), Duration::ZERO);

        let mut stream = adapter.stream(service.request("P", None)).unwrap();
        assert_eq!(stream.next().await, Some(StreamEvent::Chunk("a".to_string())));
        assert_eq!(stream.next().await, Some(StreamEvent::Chunk("b".to_string())));
        assert!(service.conversations().await.unwrap().is_empty());

        assert_eq!(stream.next().await, Some(StreamEvent::Done));
        assert_eq!(service.conversations().await.unwrap().len(), 1);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_empty_suffix_is_just_done() {
        let (_dir, service, _loader) = build_service(FakeLoader::new().with_completion(""));
        let adapter = StreamingAdapter::new(service.clone(), Duration::ZERO);

        let events = collect(adapter.stream(service.request("P", None)).unwrap()).await;

        assert_eq!(events, vec![StreamEvent::Done]);
        assert_eq!(service.conversations().await.unwrap()[0].response, "");
    }
}
