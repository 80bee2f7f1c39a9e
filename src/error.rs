//! Error taxonomy shared by every component.
//!
//! Write-path failures fall into distinct classes so callers can tell a
//! rejected request from a transient outage from a tamper signal:
//!
//! - [`Error::Validation`] is rejected synchronously and never partially applied.
//! - [`Error::NotFound`] is surfaced directly and never retried.
//! - [`Error::ConsistencyViolation`] is a potential tamper signal and is always logged at error level.
//! - [`Error::TsaUnavailable`] and [`Error::TsaRejected`] come from the time-stamp authority.
//! - [`Error::Storage`] carries whether the backend failure is transient.
//!
//! Only [`Error::is_retryable`] errors are retried by [`crate::retry::RetryExecutor`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for custody operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input, rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Unknown leaf index, evidence object, hold, export or checkpoint.
    #[error("not found: {0}")]
    NotFound(String),

    /// A proof or stored state disagrees with what the log committed to.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    /// The time-stamp authority could not be reached or timed out.
    #[error("time-stamp authority unavailable: {0}")]
    TsaUnavailable(String),

    /// The time-stamp authority answered but did not grant the request.
    #[error("time-stamp authority rejected the request (status {status}): {reason}")]
    TsaRejected {
        /// PKIStatus value reported by the authority (-1 if the reply was unusable)
        status: i64,
        /// Free text reason reported by the authority, or our own diagnosis
        reason: String,
    },

    /// Backing storage read or write failure.
    #[error("storage failure: {message}")]
    Storage {
        /// Whether retrying the same operation may succeed
        transient: bool,
        /// Backend error description
        message: String,
    },

    /// Malformed key or signature material.
    #[error("signature error: {0}")]
    Signature(String),

    /// Encoding or decoding of a persisted structure failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Reasons a request is rejected as malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Evidence payloads must carry at least one byte.
    #[error("payload is empty")]
    EmptyPayload,

    /// Payload exceeds the configured cap.
    #[error("payload of {size} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge {
        /// Observed size
        size: usize,
        /// Configured cap
        limit: usize,
    },

    /// An identifier does not match the strict key pattern.
    #[error("invalid {field} '{value}': {reason}")]
    InvalidIdentifier {
        /// Which identifier was rejected
        field: &'static str,
        /// Offending value (escaped for display)
        value: String,
        /// What is wrong with it
        reason: &'static str,
    },

    /// Legal holds are never open-ended.
    #[error("legal hold requires an expiry")]
    MissingExpiry,

    /// Hold expiry must lie in the future.
    #[error("legal hold expiry {0} is not in the future")]
    ExpiryInPast(String),

    /// The object is under retention or legal hold and cannot be removed.
    #[error("object '{key}' is locked: {reason}")]
    ObjectLocked {
        /// Object key
        key: String,
        /// Retention date or legal hold
        reason: String,
    },

    /// Operation does not apply in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Any other malformed request field.
    #[error("{0}")]
    Invalid(String),
}

/// Stable, serializable error class used in API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`Error::Validation`]
    Validation,
    /// See [`Error::NotFound`]
    NotFound,
    /// See [`Error::ConsistencyViolation`]
    ConsistencyViolation,
    /// See [`Error::TsaUnavailable`]
    TsaUnavailable,
    /// See [`Error::TsaRejected`]
    TsaRejected,
    /// See [`Error::Storage`]
    Storage,
    /// See [`Error::Signature`]
    Signature,
    /// See [`Error::Serialization`]
    Serialization,
}

impl ErrorKind {
    /// Machine-readable name, identical to the serde representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ConsistencyViolation => "consistency_violation",
            ErrorKind::TsaUnavailable => "tsa_unavailable",
            ErrorKind::TsaRejected => "tsa_rejected",
            ErrorKind::Storage => "storage",
            ErrorKind::Signature => "signature",
            ErrorKind::Serialization => "serialization",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Returns the error class.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::ConsistencyViolation(_) => ErrorKind::ConsistencyViolation,
            Error::TsaUnavailable(_) => ErrorKind::TsaUnavailable,
            Error::TsaRejected { .. } => ErrorKind::TsaRejected,
            Error::Storage { .. } => ErrorKind::Storage,
            Error::Signature(_) => ErrorKind::Signature,
            Error::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Returns true if the operation may succeed when repeated.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TsaUnavailable(_) | Error::Storage { transient: true, .. }
        )
    }

    /// Transient storage failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Error::Storage {
            transient: true,
            message: message.into(),
        }
    }

    /// Permanent storage failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Error::Storage {
            transient: false,
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// Builds a [`Error::ConsistencyViolation`] and records it at error level.
    pub fn consistency_violation(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(violation = %message, "consistency violation detected");
        Error::ConsistencyViolation(message)
    }

    /// Shorthand for [`ValidationError::Invalid`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::Validation(ValidationError::Invalid(message.into()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::permanent(format!("i/o: {e}"))
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        Error::Signature(e.to_string())
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(e: tokio_postgres::Error) -> Self {
        // Server-side errors (constraint, syntax) will fail again; anything
        // else is a connection problem.
        let transient = e.as_db_error().is_none();
        Error::Storage {
            transient,
            message: format!("postgres: {e}"),
        }
    }
}

impl From<deadpool_postgres::PoolError> for Error {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        Error::transient(format!("connection pool: {e}"))
    }
}

impl From<crate::tree::ProofError> for Error {
    fn from(e: crate::tree::ProofError) -> Self {
        match e {
            crate::tree::ProofError::OutOfRange { .. } => Error::NotFound(e.to_string()),
            crate::tree::ProofError::InvalidRange { .. } => Error::consistency_violation(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_classes_are_retryable() {
        assert!(Error::TsaUnavailable("timeout".into()).is_retryable());
        assert!(Error::transient("reset").is_retryable());
        assert!(!Error::permanent("denied").is_retryable());
        assert!(!Error::Validation(ValidationError::MissingExpiry).is_retryable());
        assert!(!Error::TsaRejected { status: 2, reason: "badAlg".into() }.is_retryable());
        assert!(!Error::ConsistencyViolation("root mismatch".into()).is_retryable());
    }

    #[test]
    fn write_path_kinds_are_distinguishable() {
        let kinds = [
            Error::Validation(ValidationError::EmptyPayload).kind(),
            Error::permanent("x").kind(),
            Error::TsaRejected { status: 2, reason: String::new() }.kind(),
            Error::ConsistencyViolation(String::new()).kind(),
        ];
        let unique: std::collections::HashSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
        assert_eq!(ErrorKind::TsaRejected.as_str(), "tsa_rejected");
        assert_eq!(
            serde_json::to_string(&ErrorKind::ConsistencyViolation).unwrap(),
            "\"consistency_violation\""
        );
    }

    #[test]
    fn proof_errors_map_to_taxonomy() {
        let e: Error = crate::tree::ProofError::OutOfRange { requested: 9, tree_size: 3 }.into();
        assert_eq!(e.kind(), ErrorKind::NotFound);
        let e: Error = crate::tree::ProofError::InvalidRange { old_size: 5, new_size: 3 }.into();
        assert_eq!(e.kind(), ErrorKind::ConsistencyViolation);
    }
}
