//! Error handling for the tablet query service.
//!
//! Every call on the query service either succeeds or fails with a
//! [`TabletError`]. The error renders as `error: <message>` on the wire.

mod tablet;

pub use tablet::{ErrorKind, TabletError};

/// Result type alias for query service operations.
pub type TabletResult<T> = std::result::Result<T, TabletError>;
