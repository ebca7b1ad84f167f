//! # tablet-txn
//!
//! Session and transaction bookkeeping for a tablet.
//!
//! - **Sessions**: [`SessionRegistry`] hands out random nonzero session
//!   ids bound to a keyspace/shard.
//! - **Transactions**: [`TransactionManager`] owns the transaction id
//!   namespace. Ids come from a counter and are never reused.
//!
//! # Transaction States
//!
//! ```text
//! ┌───────┐   begin()   ┌──────┐   claim()   ┌─────────┐   finish/drop   ┌────────┐
//! │ Start │────────────▶│ Open │────────────▶│ Closing │───────────────▶│ Closed │
//! └───────┘             └──────┘             └─────────┘                 └────────┘
//! ```
//!
//! A claimed transaction is already invisible to every other call. Once
//! the claim is finished or dropped the id is gone for good, so a failed
//! commit never leaves the transaction half open.
//!
//! # Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use tablet_common::types::SessionId;
//! use tablet_txn::{TransactionManager, TxnOutcome};
//!
//! let tm = Arc::new(TransactionManager::new());
//! let session = SessionId::new(5678);
//!
//! let txn = tm.begin(session);
//! tm.check(session, txn).unwrap();
//!
//! let claim = tm.claim(session, txn).unwrap();
//! claim.finish(TxnOutcome::Committed);
//! assert!(tm.check(session, txn).is_err());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Transaction lifecycle management.
///
/// This module provides:
/// - [`manager::TransactionManager`]: owner of the id namespace
/// - [`manager::Claim`]: exclusive hold on a transaction being closed
/// - [`manager::TransactionStats`]: lifecycle counters
pub mod manager;

/// Session registry.
pub mod session;

pub use manager::{Claim, TransactionManager, TransactionState, TransactionStats, TxnOutcome};
pub use session::{Session, SessionRegistry};
