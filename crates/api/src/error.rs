//! Error types for the API, mapped to HTTP responses per the error taxonomy
//! (invalid input -> 400, auth failure -> 401, policy -> 400/403, lock
//! conflict -> 429, transient infra -> 503).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::Level;
use treasury_core::CoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn log_level(&self) -> Level {
        match self {
            Self::BadRequest(_) | Self::Unauthorized(_) | Self::Forbidden(_) => Level::INFO,
            Self::Core(e) => e.log_level(),
            Self::Internal(_) => Level::ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            Self::Core(e) => match e {
                CoreError::LockConflict { .. } => {
                    (StatusCode::TOO_MANY_REQUESTS, "operation already in progress".to_string())
                }
                CoreError::NotADepositor(_) => (StatusCode::BAD_REQUEST, e.to_string()),
                CoreError::InvalidSignature | CoreError::MessageExpired => {
                    (StatusCode::UNAUTHORIZED, e.to_string())
                }
                CoreError::InvalidAsset { .. }
                | CoreError::InvalidAmount(_)
                | CoreError::MissingField { .. }
                | CoreError::JsonDecode { .. } => (StatusCode::BAD_REQUEST, e.to_string()),
                CoreError::Kv(_) | CoreError::KvConnection(_) | CoreError::Chain(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "temporarily unavailable, try again".to_string())
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()),
            },
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()),
        };

        match self.log_level() {
            Level::ERROR => tracing::error!(error = %self, "request failed"),
            Level::WARN => tracing::warn!(error = %self, "request failed"),
            Level::INFO => tracing::info!(error = %self, "request failed"),
            _ => tracing::debug!(error = %self, "request failed"),
        }

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
