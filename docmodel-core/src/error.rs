//! Error types and result alias for the document model layer.
//!
//! `Validation` and the two `Unsupported*` variants are raised synchronously
//! at the call that introduced the bad input, before any backend I/O. Errors
//! coming back from a backend round trip propagate unchanged so callers can
//! tell a malformed query apart from a store outage.

use bson::Bson;
use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Represents all possible errors raised by the model layer and its backends.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A value failed its Definition check, or a path did not resolve to
    /// exactly one Definition node.
    #[error("Validation failed at `{path}`: expected {expected}, received {received}")]
    Validation {
        /// The path that was being resolved or written.
        path: String,
        /// The expected type or shape at that path.
        expected: String,
        /// A rendering of the rejected value.
        received: String,
    },
    /// A filter operator outside the supported closed set.
    #[error("Unsupported filter operator: {0}")]
    UnsupportedOperator(String),
    /// A pipeline stage or accumulator outside the supported closed set.
    #[error("Unsupported pipeline stage: {0}")]
    UnsupportedStage(String),
    /// The backend is unreachable or the connection pool is exhausted.
    #[error("Connection error: {0}")]
    Connection(String),
    /// A backend-level uniqueness or shape violation.
    #[error("Constraint violation: {0}")]
    Constraint(String),
    /// Serialization/deserialization error at a value boundary (BSON, JSON).
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Any other error surfaced by the underlying storage engine.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Builds a `Validation` error with a rendered copy of the offending value.
    pub fn validation(path: impl Into<String>, expected: impl Into<String>, received: &Bson) -> Self {
        StoreError::Validation {
            path: path.into(),
            expected: expected.into(),
            received: format!("{received}"),
        }
    }

    /// Builds a `Validation` error for a path that does not resolve.
    pub fn bad_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::Validation {
            path: path.into(),
            expected: reason.into(),
            received: "unresolvable path".to_string(),
        }
    }
}

/// A specialized `Result` used throughout the model layer.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<BsonError> for StoreError {
    fn from(err: BsonError) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for StoreError {
    fn from(err: SerdeJsonError) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
