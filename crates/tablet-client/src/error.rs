//! Error types for the client library.

use tablet_common::error::{ErrorKind, TabletError};
use tablet_proto::frame::FrameError;
use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection timeout.
    #[error("connection timeout after {0}ms")]
    ConnectionTimeout(u64),

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server answered with a reply of the wrong type.
    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),

    /// Malformed frame.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The call failed on the tablet, whichever way the error was
    /// delivered.
    #[error(transparent)]
    Tablet(#[from] TabletError),
}

impl ClientError {
    /// Returns the tablet error, if the call reached the tablet.
    pub fn tablet_error(&self) -> Option<&TabletError> {
        match self {
            ClientError::Tablet(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the tablet error kind, if any.
    pub fn kind(&self) -> Option<ErrorKind> {
        self.tablet_error().map(TabletError::kind)
    }
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
