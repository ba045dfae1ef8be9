use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::services::transcode::TranscodeError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not a member of this room")]
    NotMember,

    #[error("Only the room owner may do this")]
    NotOwner,

    #[error("Only the playback master may do this")]
    NotMaster,

    #[error("Room has been disbanded")]
    Disbanded,

    #[error("Too many requests")]
    RateLimited,

    #[error("Temporarily unavailable: {0}")]
    Transient(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Short machine-readable tag carried in WS error frames.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::Redis(_) => "cache",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation",
            AppError::Conflict(_) => "conflict",
            AppError::NotMember => "not_member",
            AppError::NotOwner => "not_owner",
            AppError::NotMaster => "not_master",
            AppError::Disbanded => "disbanded",
            AppError::RateLimited => "rate_limited",
            AppError::Transient(_) => "transient",
            AppError::Storage(_) => "storage",
            AppError::Transcode(_) => "transcode",
            AppError::Cancelled => "cancelled",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Forbidden | AppError::NotMember | AppError::NotOwner | AppError::NotMaster => {
                (StatusCode::FORBIDDEN, self.to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Disbanded => (StatusCode::CONFLICT, self.to_string()),
            AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            AppError::Transient(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Cancelled => (StatusCode::REQUEST_TIMEOUT, self.to_string()),
            AppError::Database(ref e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }
            AppError::Redis(ref e) => {
                tracing::error!("Redis error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Cache error".to_string())
            }
            AppError::Storage(ref msg) => {
                tracing::error!("Storage error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
            AppError::Transcode(ref e) => {
                tracing::error!("Transcode error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Transcode error".to_string())
            }
            AppError::Internal(ref e) => {
                tracing::error!("Internal error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
