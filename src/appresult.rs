use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::{auth::AuthError, repo::RepoError};

pub type AppResult<T> = Result<T, AppError>;

/// Failures surfaced over HTTP, i.e. before a socket is upgraded.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = match &self {
            AppError::Internal(err) => {
                tracing::error!(error = ?err, "internal error");
                "internal server error".to_owned()
            }
            other => other.to_string(),
        };

        (
            self.status_code(),
            Json(json!({ "code": self.error_code(), "error": message })),
        )
            .into_response()
    }
}

impl From<RepoError> for AppError {
    fn from(err: RepoError) -> Self {
        Self::Internal(anyhow::Error::from(err))
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        Self::Internal(anyhow::Error::from(err))
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::NotFound(msg) => AppError::NotFound(msg),
            ChatError::Forbidden(msg) => AppError::Forbidden(msg),
            ChatError::Validation(msg) | ChatError::InvalidId(msg) | ChatError::Unsupported(msg) => {
                AppError::BadRequest(msg)
            }
            ChatError::Storage(err) => err.into(),
            ChatError::Auth(err) => err.into(),
        }
    }
}

/// Failures inside a live session or a service call.
///
/// These are reported to the originating client as an `ERROR` event and
/// never close the session.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Validation(String),

    #[error("malformed identifier: {0}")]
    InvalidId(String),

    #[error("{0}")]
    Unsupported(String),

    #[error(transparent)]
    Storage(#[from] RepoError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl ChatError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Wire code carried by the `ERROR` event.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::NotFound(_) => "NOT_FOUND",
            ChatError::Forbidden(_) => "FORBIDDEN",
            ChatError::Validation(_) => "VALIDATION_ERROR",
            ChatError::InvalidId(_) => "INVALID_ID",
            ChatError::Unsupported(_) => "UNSUPPORTED",
            ChatError::Storage(_) | ChatError::Auth(_) => "INTERNAL_ERROR",
        }
    }

    /// Client-facing text. Infrastructure details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            ChatError::Storage(_) | ChatError::Auth(_) => "internal error".to_owned(),
            other => other.to_string(),
        }
    }
}
