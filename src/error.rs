//! Unified error handling for the location tracker.
//!
//! Every fallible operation in the crate returns [`TrackerError`]. Which
//! variants are recovered locally and which surface to the caller is decided
//! per component:
//! - `MalformedRecord` never escapes a history load (the entry is skipped).
//! - Provider, permission and fix errors inside a background run are caught
//!   and turned into a failed run.
//! - `PersistenceFailure` on the foreground append path is returned to the caller.

use thiserror::Error;

/// Unified error type for tracker operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrackerError {
    /// Location services are switched off on the device
    #[error("Location service is disabled")]
    ProviderUnavailable,

    /// The user has not granted location permission
    #[error("Location permission denied")]
    PermissionDenied,

    /// The provider failed to produce a fix (usually transient)
    #[error("Fix acquisition failed: {message}")]
    FixAcquisitionFailed { message: String },

    /// Reading or writing durable state failed
    #[error("Persistence error: {message}")]
    PersistenceFailure { message: String },

    /// One persisted entry could not be decoded
    #[error("Malformed record: {message}")]
    MalformedRecord { message: String },

    /// Coordinates outside the WGS84 range or non-finite
    #[error("Invalid coordinates ({latitude}, {longitude})")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    /// Configuration failed validation or could not be parsed
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The host background-task facility rejected a request
    #[error("Background host error: {message}")]
    BackgroundHost { message: String },
}

impl TrackerError {
    pub(crate) fn persistence(message: impl Into<String>) -> Self {
        TrackerError::PersistenceFailure {
            message: message.into(),
        }
    }

    #[cfg(test)]
    pub(crate) fn fix_failed(message: impl Into<String>) -> Self {
        TrackerError::FixAcquisitionFailed {
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        TrackerError::Config {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TrackerError::FixAcquisitionFailed { .. } | TrackerError::PersistenceFailure { .. }
        )
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for TrackerError {
    fn from(err: rusqlite::Error) -> Self {
        TrackerError::persistence(err.to_string())
    }
}

/// Result type alias for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
