//! Query service error types.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::CAUGHT_PANIC_PREFIX;

/// Error kinds for categorizing call failures.
///
/// The kind is carried on the wire next to the message so callers can
/// branch on it without parsing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Unknown or stale session.
    InvalidSession,
    /// Transaction id is zero, unknown or already closed.
    NotInTransaction,
    /// Transaction id is valid but was issued under another session.
    SessionMismatch,
    /// Malformed request, e.g. a non-positive split count.
    InvalidArgument,
    /// The SQL engine reported a failure executing a statement.
    ExecutionFailed,
    /// The caller cancelled the call or its deadline expired.
    Cancelled,
    /// An unexpected fault was caught at the call boundary.
    Internal,
}

impl ErrorKind {
    /// Returns true if the error was detected before any engine work began.
    #[must_use]
    pub const fn is_local(self) -> bool {
        matches!(
            self,
            Self::InvalidSession
                | Self::NotInTransaction
                | Self::SessionMismatch
                | Self::InvalidArgument
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The error type returned by every query service call.
///
/// # Example
///
/// ```rust
/// use tablet_common::error::{ErrorKind, TabletError};
///
/// let err = TabletError::execution_failed("generic error");
/// assert_eq!(err.kind(), ErrorKind::ExecutionFailed);
/// assert_eq!(err.to_string(), "error: generic error");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TabletError {
    /// Unknown or stale session.
    #[error("error: {message}")]
    InvalidSession {
        /// Error message.
        message: String,
    },

    /// Transaction id is zero, unknown or closed.
    #[error("error: {message}")]
    NotInTransaction {
        /// Error message.
        message: String,
    },

    /// Transaction belongs to a different session.
    #[error("error: {message}")]
    SessionMismatch {
        /// Error message.
        message: String,
    },

    /// Invalid argument provided.
    #[error("error: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// Statement execution failed in the engine.
    #[error("error: {message}")]
    ExecutionFailed {
        /// Error message.
        message: String,
    },

    /// Call was cancelled or timed out.
    #[error("error: {message}")]
    Cancelled {
        /// Error message.
        message: String,
    },

    /// Unexpected fault caught by the panic guard.
    #[error("error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl TabletError {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::InvalidSession => Self::InvalidSession { message },
            ErrorKind::NotInTransaction => Self::NotInTransaction { message },
            ErrorKind::SessionMismatch => Self::SessionMismatch { message },
            ErrorKind::InvalidArgument => Self::InvalidArgument { message },
            ErrorKind::ExecutionFailed => Self::ExecutionFailed { message },
            ErrorKind::Cancelled => Self::Cancelled { message },
            ErrorKind::Internal => Self::Internal { message },
        }
    }

    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSession { .. } => ErrorKind::InvalidSession,
            Self::NotInTransaction { .. } => ErrorKind::NotInTransaction,
            Self::SessionMismatch { .. } => ErrorKind::SessionMismatch,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::ExecutionFailed { .. } => ErrorKind::ExecutionFailed,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns the message without the `error: ` prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidSession { message }
            | Self::NotInTransaction { message }
            | Self::SessionMismatch { message }
            | Self::InvalidArgument { message }
            | Self::ExecutionFailed { message }
            | Self::Cancelled { message }
            | Self::Internal { message } => message,
        }
    }

    /// Returns true if this error was produced by the panic guard.
    #[must_use]
    pub fn is_caught_panic(&self) -> bool {
        self.kind() == ErrorKind::Internal && self.message().starts_with(CAUGHT_PANIC_PREFIX)
    }

    /// Creates an invalid session error.
    #[must_use]
    pub fn invalid_session(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidSession, message)
    }

    /// Creates a not-in-transaction error.
    #[must_use]
    pub fn not_in_transaction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotInTransaction, message)
    }

    /// Creates a session mismatch error.
    #[must_use]
    pub fn session_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionMismatch, message)
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    /// Creates an execution failure.
    #[must_use]
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionFailed, message)
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Creates the internal error reported for a caught panic.
    #[must_use]
    pub fn caught_panic(detail: impl fmt::Display) -> Self {
        Self::internal(format!("{CAUGHT_PANIC_PREFIX}{detail}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_has_wire_prefix() {
        let err = TabletError::execution_failed("generic error");
        assert_eq!(err.to_string(), "error: generic error");
        assert_eq!(err.message(), "generic error");
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            ErrorKind::InvalidSession,
            ErrorKind::NotInTransaction,
            ErrorKind::SessionMismatch,
            ErrorKind::InvalidArgument,
            ErrorKind::ExecutionFailed,
            ErrorKind::Cancelled,
            ErrorKind::Internal,
        ] {
            assert_eq!(TabletError::new(kind, "x").kind(), kind);
        }
    }

    #[test]
    fn test_caught_panic() {
        let err = TabletError::caught_panic("test-triggered panic");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.is_caught_panic());
        assert_eq!(err.to_string(), "error: caught panic: test-triggered panic");

        let plain = TabletError::internal("something else");
        assert!(!plain.is_caught_panic());
        assert!(!TabletError::execution_failed("caught panic: no").is_caught_panic());
    }

    #[test]
    fn test_local_kinds() {
        assert!(ErrorKind::InvalidSession.is_local());
        assert!(ErrorKind::InvalidArgument.is_local());
        assert!(!ErrorKind::ExecutionFailed.is_local());
        assert!(!ErrorKind::Internal.is_local());
    }
}
