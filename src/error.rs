//! Structured error types for audit operations.

use serde::Serialize;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Not found errors
    IdentityNotFound,
    KeyNotFound,
    ReportNotFound,

    // Input errors
    InvalidFieldValue,
    MalformedData,

    // Conflict errors
    RefreshInProgress,

    // Internal errors
    ConfigError,
    StorageError,
    IoError,
    InternalError,
}

/// Error raised by the audit engine and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("no facts found for '{identity}', is the node known to the fact source?")]
    IdentityNotFound { identity: String },

    #[error("key '{key}' is not defined for '{identity}'")]
    KeyNotFound { identity: String, key: String },

    #[error("no estate report available yet, request a refresh first")]
    ReportNotFound,

    #[error("{field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("malformed data in {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("an estate refresh is already running")]
    RefreshInProgress,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuditError {
    /// Code used by the API layer and by JSON output.
    pub fn code(&self) -> ErrorCode {
        match self {
            AuditError::IdentityNotFound { .. } => ErrorCode::IdentityNotFound,
            AuditError::KeyNotFound { .. } => ErrorCode::KeyNotFound,
            AuditError::ReportNotFound => ErrorCode::ReportNotFound,
            AuditError::InvalidValue { .. } => ErrorCode::InvalidFieldValue,
            AuditError::Malformed { .. } => ErrorCode::MalformedData,
            AuditError::RefreshInProgress => ErrorCode::RefreshInProgress,
            AuditError::Config(_) => ErrorCode::ConfigError,
            AuditError::Storage(_) => ErrorCode::StorageError,
            AuditError::Io(_) => ErrorCode::IoError,
            AuditError::Internal(_) => ErrorCode::InternalError,
        }
    }

    // Convenience constructors

    pub fn identity_not_found(identity: &str) -> Self {
        AuditError::IdentityNotFound {
            identity: identity.to_string(),
        }
    }

    pub fn key_not_found(identity: &str, key: &str) -> Self {
        AuditError::KeyNotFound {
            identity: identity.to_string(),
            key: key.to_string(),
        }
    }

    pub fn invalid_value(field: &str, reason: impl Into<String>) -> Self {
        AuditError::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub fn malformed(path: &str, err: impl std::fmt::Display) -> Self {
        AuditError::Malformed {
            path: path.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        AuditError::Storage(err.to_string())
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        AuditError::Internal(err.to_string())
    }
}

impl From<rusqlite::Error> for AuditError {
    fn from(err: rusqlite::Error) -> Self {
        AuditError::storage(err)
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        AuditError::internal(err)
    }
}

// Storage and glue code returns anyhow; keep typed errors when they round-trip.
impl From<anyhow::Error> for AuditError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<AuditError>() {
            Ok(audit_err) => audit_err,
            Err(err) => AuditError::internal(err),
        }
    }
}

/// Result type for audit operations.
pub type AuditResult<T> = std::result::Result<T, AuditError>;
