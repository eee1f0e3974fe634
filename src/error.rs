//! Error types for instance lookups and command validation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Why a command was refused by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Command is required")]
    Empty,

    #[error("Command too long (max {max} characters, got {actual})")]
    TooLong { max: usize, actual: usize },

    #[error("Command not allowed: {0}")]
    NotAllowed(String),
}

impl Rejection {
    pub(crate) fn not_allowed(reason: impl Into<String>) -> Self {
        Self::NotAllowed(reason.into())
    }
}

/// Errors returned by instance operations.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// The id was never issued, or its instance is already gone.
    #[error("Instance not found")]
    NotFound,

    /// The id was valid but its TTL elapsed; detecting this deleted it.
    #[error("Instance expired")]
    Expired,

    #[error(transparent)]
    Rejected(#[from] Rejection),

    /// The sandbox directory could not be created.
    #[error("Failed to provision sandbox: {0}")]
    Provision(String),
}

impl InstanceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            InstanceError::NotFound => StatusCode::NOT_FOUND,
            InstanceError::Expired => StatusCode::GONE,
            InstanceError::Rejected(_) => StatusCode::BAD_REQUEST,
            InstanceError::Provision(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for InstanceError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status_code(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(InstanceError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(InstanceError::Expired.status_code(), StatusCode::GONE);
        assert_eq!(
            InstanceError::from(Rejection::Empty).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            InstanceError::Provision("disk full".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn rejection_message_passes_through() {
        let err = InstanceError::from(Rejection::TooLong { max: 200, actual: 201 });
        assert_eq!(err.to_string(), "Command too long (max 200 characters, got 201)");
    }
}
