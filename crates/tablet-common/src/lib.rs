//! # tablet-common
//!
//! Common types and errors for the tablet query service.
//!
//! This crate provides the foundational types shared by every other crate
//! in the workspace:
//!
//! - **Types**: `SessionId`, `TransactionId` and `KeyRange`
//! - **Errors**: `TabletError` with its `ErrorKind` classification
//! - **Constants**: protocol-wide defaults and limits
//!
//! ## Example
//!
//! ```rust
//! use tablet_common::error::{ErrorKind, TabletError};
//! use tablet_common::types::TransactionId;
//!
//! let txn = TransactionId::NONE;
//! assert!(txn.is_none());
//!
//! let err = TabletError::not_in_transaction("transaction 9 is not open");
//! assert_eq!(err.kind(), ErrorKind::NotInTransaction);
//! assert_eq!(err.to_string(), "error: transaction 9 is not open");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use error::{ErrorKind, TabletError, TabletResult};
pub use types::{KeyRange, SessionId, TransactionId};
