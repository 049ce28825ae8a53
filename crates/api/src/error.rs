//! Mapping engine failures onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use engine::EngineError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The request body is not a workflow definition at all.
    #[error("invalid workflow definition: {0}")]
    BadDefinition(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadDefinition(_) => StatusCode::BAD_REQUEST,
            Self::Engine(err) => match err {
                EngineError::GraphDefinition(_) => StatusCode::BAD_REQUEST,
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::InvalidState { .. } => StatusCode::CONFLICT,
                EngineError::MissingInput(_) | EngineError::SchemaValidation(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                EngineError::ActionExecution { .. }
                | EngineError::Cancelled
                | EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
