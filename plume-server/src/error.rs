//! Adapter error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Malformed or unsupported request envelope.
    #[error("{0}")]
    InvalidInput(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("model {0} not found")]
    ModelNotFound(String),

    #[error("model {0} is not ready")]
    NotReady(String),

    /// The pipeline failed; surfaced as a server error, never retried.
    #[error("{0:#}")]
    Inference(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdapterError::InvalidInput(_) | AdapterError::MissingField(_) => {
                StatusCode::BAD_REQUEST
            }
            AdapterError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            AdapterError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            AdapterError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdapterError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {self}");
        } else {
            warn!("request rejected: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;
