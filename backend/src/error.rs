//! Error taxonomy for the ingestion pipeline.
//!
//! Every component maps its failures into one of the variants below so that
//! HTTP handlers can render a response with a single `?` and MQTT/pipeline
//! callers can match on taxonomy rather than ad-hoc strings.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("schema violation: {0}")]
    Schema(String),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("invalid point: {0}")]
    InvalidPoint(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("missing or invalid credentials")]
    Unauthorized,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistence connection error: {0}")]
    Connection(String),
    #[error("persistence query error: {0}")]
    Query(String),
    #[error("retry budget exhausted after {attempts} attempts: {source}")]
    RetriesExhausted { attempts: u32, source: Box<StoreError> },
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("external scorer timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("external scorer returned status {0}")]
    BadStatus(u16),
    #[error("external scorer transport error: {0}")]
    Transport(String),
}

/// Raised when a subscriber's bounded queue overflows. Never fails the
/// publisher — this exists purely so the drop can be logged and counted at
/// the call site.
#[derive(Debug, Error)]
#[error("subscriber queue overflow, dropping oldest event")]
pub struct SubscriberOverflowError;

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("could not reach persistence store after startup retry budget: {0}")]
    StoreUnreachable(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Top-level error enum handlers return. Implements [`IntoResponse`] so every
/// axum handler can use `Result<_, PipelineError>` uniformly.
///
/// Deliberately has no `Detector` variant: per spec §7 a `DetectorError` is
/// always absorbed into a z-score fallback inside the registry (see
/// `detector/mod.rs`) and never escapes to a caller, so there is nothing for
/// this enum to carry.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Client(ClientError::Schema(m)) => (StatusCode::BAD_REQUEST, m.clone()),
            Self::Client(ClientError::InvalidPoint(m)) => (StatusCode::BAD_REQUEST, m.clone()),
            Self::Client(ClientError::UnknownDevice(id)) => {
                (StatusCode::NOT_FOUND, format!("unknown device: {id}"))
            }
            Self::Client(ClientError::RateLimited) => {
                (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded".to_string())
            }
            Self::Client(ClientError::Unauthorized) => {
                (StatusCode::UNAUTHORIZED, "unauthorized".to_string())
            }
            Self::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };

        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}
