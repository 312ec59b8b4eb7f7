//! Error types for CLASSMARK operations

use std::time::Duration;
use thiserror::Error;

/// Storage layer errors (outbox, local records, server repositories).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Record not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Mutation not found in outbox: {temp_id}")]
    MutationNotFound { temp_id: String },

    #[error("Write failed for {target}: {reason}")]
    WriteFailed { target: String, reason: String },

    #[error("Read failed for {target}: {reason}")]
    ReadFailed { target: String, reason: String },

    #[error("Corrupt entry in {target}: {reason}")]
    Corrupt { target: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Validation errors. Always terminal when raised against a mutation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unknown entity type: {entity_type}")]
    UnknownEntityType { entity_type: String },

    #[error("Rejected by business rule: {reason}")]
    Rejected { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration from {path}: {reason}")]
    Load { path: String, reason: String },
}

/// Errors raised by the client to server transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("No network connectivity: {0}")]
    Connectivity(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Server responded with status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Classify a whole-call failure.
    ///
    /// Timeouts, lost connectivity, server faults, throttling and auth expiry
    /// leave the outcome indeterminate, so the affected items are retried.
    /// Any other 4xx means the server understood and refused the request.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            TransportError::Connectivity(_) | TransportError::Timeout(_) => FailureClass::Retryable,
            TransportError::Http { status, .. } => match *status {
                401 | 403 | 408 | 429 => FailureClass::Retryable,
                s if s >= 500 => FailureClass::Retryable,
                _ => FailureClass::Terminal,
            },
            TransportError::Decode(_) => FailureClass::Retryable,
        }
    }
}

/// How a failed mutation should be treated by the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Outcome unknown or transient. Resend later with the same temp id.
    Retryable,
    /// The server refused the mutation. Needs user attention.
    Terminal,
}

/// Master error type for all CLASSMARK errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClassmarkError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Conflict on {entity_type} {record_id}: {reason}")]
    Conflict {
        entity_type: String,
        record_id: String,
        reason: String,
    },

    #[error("View computation failed for {view_kind}: {reason}")]
    Compute { view_kind: String, reason: String },
}

impl ClassmarkError {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            ClassmarkError::Transport(err) => err.failure_class(),
            ClassmarkError::Storage(_) | ClassmarkError::Compute { .. } => FailureClass::Retryable,
            ClassmarkError::Validation(_)
            | ClassmarkError::Config(_)
            | ClassmarkError::Conflict { .. } => FailureClass::Terminal,
        }
    }
}

/// Result type alias for CLASSMARK operations.
pub type ClassmarkResult<T> = Result<T, ClassmarkError>;

// =============================================================================
// TESTS
// =============================================================================
