//! Mapping of service errors onto HTTP responses

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::server::types::ErrorResponse;
use crate::service::GenerationError;
use crate::storage::StorageError;

/// An error response with a status code and a human-readable detail
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                detail: self.detail,
            }),
        )
            .into_response()
    }
}

impl From<GenerationError> for ApiError {
    fn from(e: GenerationError) -> Self {
        match e {
            GenerationError::UnsupportedModel { .. } => {
                ApiError::new(StatusCode::BAD_REQUEST, e.to_string())
            }
            GenerationError::EngineConstruction(_) | GenerationError::Generation { .. } => {
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Generation failed: {e}"),
                )
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to read conversations: {e}"),
        )
    }
}

/// Every body the request model cannot be built from is 422, whether the
/// JSON is malformed, mistyped or sent without a JSON content type.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text())
    }
}
