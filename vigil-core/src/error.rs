//! Error types for Vigil operations

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the sync layer: backend access, caching, subscriptions
/// and range queries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Backend unavailable at {path}: {reason}")]
    BackendUnavailable { path: String, reason: String },

    #[error("Request for {key} timed out after {after:?}")]
    Timeout { key: String, after: Duration },

    #[error("Invalid subject {subject:?}: {reason}")]
    InvalidSubject { subject: String, reason: String },

    #[error("Invalid range {start:?}..{end:?}: {reason}")]
    InvalidRange {
        start: String,
        end: String,
        reason: String,
    },

    #[error("Connection limit reached (max_concurrent = {max_concurrent})")]
    CapacityExceeded { max_concurrent: usize },

    #[error("Could not decode payload at {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("{resource} lock poisoned")]
    LockPoisoned { resource: &'static str },
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
}

/// Master error type for all Vigil errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VigilError {
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Vigil operations.
pub type VigilResult<T> = Result<T, VigilError>;

/// Flat discriminant over [`VigilError`], used by consumers to pick UI copy
/// ("no data", "connection lost", ...) without matching nested enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BackendUnavailable,
    Timeout,
    InvalidSubject,
    InvalidRange,
    CapacityExceeded,
    Decode,
    Internal,
    Config,
}

impl VigilError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VigilError::Sync(SyncError::BackendUnavailable { .. }) => ErrorKind::BackendUnavailable,
            VigilError::Sync(SyncError::Timeout { .. }) => ErrorKind::Timeout,
            VigilError::Sync(SyncError::InvalidSubject { .. }) => ErrorKind::InvalidSubject,
            VigilError::Sync(SyncError::InvalidRange { .. }) => ErrorKind::InvalidRange,
            VigilError::Sync(SyncError::CapacityExceeded { .. }) => ErrorKind::CapacityExceeded,
            VigilError::Sync(SyncError::Decode { .. }) => ErrorKind::Decode,
            VigilError::Sync(SyncError::LockPoisoned { .. }) => ErrorKind::Internal,
            VigilError::Config(_) => ErrorKind::Config,
        }
    }

    /// Shorthand for a `BackendUnavailable` error at `path`.
    pub fn backend_unavailable(path: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::BackendUnavailable {
            path: path.into(),
            reason: reason.into(),
        }
        .into()
    }

    pub fn lock_poisoned(resource: &'static str) -> Self {
        SyncError::LockPoisoned { resource }.into()
    }
}

// =============================================================================
// TESTS
// =============================================================================
