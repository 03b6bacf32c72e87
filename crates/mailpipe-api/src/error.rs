//! Error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mailpipe_common::Error;
use mailpipe_core::CampaignError;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tracing::error;

/// Error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Handler error
#[derive(Debug, ThisError)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] Error),

    #[error("{0}")]
    BadRequest(String),
}

impl From<CampaignError> for ApiError {
    fn from(e: CampaignError) -> Self {
        ApiError::Pipeline(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Pipeline(e) => (
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                e.code(),
            ),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        };
        if status.is_server_error() {
            error!(code, "Request failed: {}", self);
        }

        let body = ErrorResponse {
            error: code.to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
