//! API error body.
//!
//! Every failing endpoint answers with an [`ApiError`] serialized as JSON.
//! The status is derived from the [`ErrorCode`]; devices read `code` back to
//! decide whether a failure is worth retrying.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use classmark_core::{ClassmarkError, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A pushed item or request body broke a domain rule.
    ValidationFailed,
    /// Body or query could not be understood.
    InvalidInput,
    /// A required header is absent.
    MissingField,
    /// A header is present but malformed.
    InvalidFormat,
    /// More push items than `CLASSMARK_MAX_PUSH_ITEMS`.
    PayloadTooLarge,
    EntityNotFound,
    ViewNotFound,
    /// Temp id replayed with a different body, or a record changed under us.
    StateConflict,
    ViewComputeFailed,
    ServiceUnavailable,
    InternalError,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ValidationFailed | Self::InvalidInput | Self::MissingField | Self::InvalidFormat => {
                StatusCode::BAD_REQUEST
            }
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::EntityNotFound | Self::ViewNotFound => StatusCode::NOT_FOUND,
            Self::StateConflict => StatusCode::CONFLICT,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::ViewComputeFailed | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// JSON error body shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(ErrorCode::MissingField, format!("Required field '{field}' is missing"))
    }

    pub fn invalid_format(field: &str, expected: &str) -> Self {
        Self::new(
            ErrorCode::InvalidFormat,
            format!("Field '{field}' has invalid format, expected {expected}"),
        )
    }

    pub fn payload_too_large(items: usize, max: usize) -> Self {
        Self::new(
            ErrorCode::PayloadTooLarge,
            format!("Request carries {items} items, at most {max} are accepted"),
        )
    }

    pub fn view_not_found(view_kind: &str) -> Self {
        Self::new(
            ErrorCode::ViewNotFound,
            format!("No view registered for kind '{view_kind}'"),
        )
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

/// Storage and configuration faults are logged in full and reported
/// generically so internal details do not reach devices.
impl From<ClassmarkError> for ApiError {
    fn from(err: ClassmarkError) -> Self {
        match err {
            ClassmarkError::Validation(e) => Self::new(ErrorCode::ValidationFailed, e.to_string()),
            ClassmarkError::Conflict {
                entity_type,
                record_id,
                reason,
            } => Self::new(ErrorCode::StateConflict, reason).with_details(json!({
                "entity_type": entity_type,
                "record_id": record_id,
            })),
            ClassmarkError::Storage(StorageError::NotFound { entity_type, id }) => Self::new(
                ErrorCode::EntityNotFound,
                format!("{entity_type} with id {id} not found"),
            ),
            ClassmarkError::Storage(e) => {
                error!(error = %e, "Storage error");
                Self::internal_error("Storage operation failed")
            }
            ClassmarkError::Compute { view_kind, reason } => {
                error!(view_kind = %view_kind, reason = %reason, "View computation failed");
                Self::new(ErrorCode::ViewComputeFailed, "View computation failed")
                    .with_details(json!({ "view_kind": view_kind }))
            }
            ClassmarkError::Transport(e) => Self::new(ErrorCode::ServiceUnavailable, e.to_string()),
            ClassmarkError::Config(e) => {
                error!(error = %e, "Configuration error");
                Self::internal_error("Server misconfigured")
            }
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_input(format!("Invalid JSON: {err}"))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
