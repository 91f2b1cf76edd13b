//! Unified HTTP error type for axum request handlers.
//!
//! [`ApiError`] carries the error kinds the pipeline produces and converts
//! each into the right HTTP response via [`IntoResponse`]. Handlers return
//! `Result<T, ApiError>` and propagate with `?`: no manual `map_err`, no
//! boilerplate. Internal error text is never echoed to the client: the
//! response body carries a stable message per kind and the detail goes to the
//! log instead.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// The one provider-failure message clients are allowed to see.
pub const MODELS_UNAVAILABLE: &str = "Models not available currently. Please try again later.";

/// Error kinds surfaced by the request pipeline.
///
/// `Forbidden` and `NotFound` both render as HTTP 404 so callers cannot
/// distinguish "exists but not yours" from "does not exist".
#[derive(Debug)]
pub enum ApiError {
    /// Missing, malformed, or unverifiable credentials (401).
    Unauthenticated(String),
    /// Actor does not own the resource (rendered 404).
    Forbidden,
    /// Resource genuinely absent (404).
    NotFound,
    /// Client sent a body the pipeline refuses to process (400).
    BadRequest(String),
    /// A protected dependency (classifier) is down or its circuit is open (500).
    ModelsUnavailable,
    /// Anything else (500, generic body).
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            Self::Unauthenticated(msg) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", msg.clone())
            }
            Self::Forbidden | Self::NotFound => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", "not found".to_owned())
            }
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST", msg.clone()),
            Self::ModelsUnavailable => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "MODELS_UNAVAILABLE",
                MODELS_UNAVAILABLE.to_owned(),
            ),
            Self::Internal(err) => {
                tracing::error!(error = %err, "handler error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "internal server error".to_owned(),
                )
            }
        };

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

/// Convert any `Into<anyhow::Error>` into [`ApiError::Internal`].
///
/// This is the idiomatic axum pattern — see
/// <https://docs.rs/axum/latest/axum/error_handling/index.html>.
impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self::Internal(e.into())
    }
}
