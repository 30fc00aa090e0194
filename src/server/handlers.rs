//! Route handlers

use std::convert::Infallible;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};

use crate::inference::registry::ModelSpec;
use crate::inference::streaming::StreamEvent;
use crate::server::error::ApiError;
use crate::server::types::{GenerateRequest, GenerateResponse, StreamParams};
use crate::server::AppState;
use crate::service::Health;
use crate::types::record::Conversation;

/// `POST /generate`
pub async fn generate_handler(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Json(body) = payload?;
    let request = state.service.request(body.prompt, body.model);

    let completion = state.service.generate(&request).await?;
    if let Some(e) = &completion.log_error {
        tracing::warn!("Returning unlogged response: {}", e);
    }

    Ok(Json(GenerateResponse {
        response: completion.response,
    }))
}

/// `GET /stream?prompt=..&model=..`
pub async fn stream_handler(
    State(state): State<AppState>,
    params: Result<Query<StreamParams>, QueryRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Query(params) = params?;
    let request = state.service.request(params.prompt, params.model);

    let events = state.streaming.stream(request)?;
    let events = events.map(|event| Ok::<_, Infallible>(to_sse(event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Encodes one event as an SSE `data:` field.
///
/// Carriage returns are dropped: they terminate SSE lines and cannot be
/// carried inside a field.
fn to_sse(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Chunk(text) => Event::default().data(text.replace('\r', "")),
        StreamEvent::Error(message) => {
            Event::default().data(format!("[ERROR] {}", message.replace('\r', "")))
        }
        StreamEvent::Done => Event::default().data("[DONE]"),
    }
}

/// `GET /models`
pub async fn models_handler(State(state): State<AppState>) -> Json<Vec<ModelSpec>> {
    Json(state.service.models().to_vec())
}

/// `GET /conversations`
pub async fn conversations_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    Ok(Json(state.service.conversations().await?))
}

/// `GET /health`
pub async fn health_handler(State(state): State<AppState>) -> Json<Health> {
    Json(state.service.health().await)
}
