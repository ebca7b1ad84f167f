//! Identifier types for sessions and transactions.
//!
//! Both identifiers are plain 64-bit values on the wire. The newtypes keep
//! a session id from being passed where a transaction id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Session identifier - issued by the server for a keyspace/shard target.
///
/// Every data call carries the session id it was issued. Zero is never
/// handed out.
///
/// # Example
///
/// ```rust
/// use tablet_common::types::SessionId;
///
/// let session = SessionId::new(5678);
/// assert_eq!(session.as_u64(), 5678);
/// assert!(session.is_valid());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Sentinel for "no session".
    pub const INVALID: Self = Self(0);

    /// Creates a new `SessionId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Checks if this is a valid session ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "SessionId(INVALID)")
        } else {
            write!(f, "SessionId({})", self.0)
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SessionId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

impl From<SessionId> for u64 {
    #[inline]
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// Transaction identifier - names an open transaction within a session.
///
/// Zero means "not in a transaction". The server hands out nonzero ids
/// from a monotonically increasing counter and never reuses one.
///
/// # Example
///
/// ```rust
/// use tablet_common::types::TransactionId;
///
/// let txn = TransactionId::new(678);
/// assert!(!txn.is_none());
/// assert!(TransactionId::NONE.is_none());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[repr(transparent)]
pub struct TransactionId(u64);

impl TransactionId {
    /// The "no transaction" id.
    pub const NONE: Self = Self(0);

    /// Minimum id the server hands out.
    pub const MIN: Self = Self(1);

    /// Creates a new `TransactionId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true if this is the "no transaction" id.
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE.0
    }

    /// Returns the next transaction ID.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "TransactionId(NONE)")
        } else {
            write!(f, "TransactionId({})", self.0)
        }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TransactionId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

impl From<TransactionId> for u64 {
    #[inline]
    fn from(id: TransactionId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id() {
        let session = SessionId::new(5678);
        assert_eq!(session.as_u64(), 5678);
        assert!(session.is_valid());
        assert!(!SessionId::INVALID.is_valid());
        assert_eq!(format!("{:?}", SessionId::INVALID), "SessionId(INVALID)");
        assert_eq!(session.to_string(), "5678");
    }

    #[test]
    fn test_transaction_id() {
        let txn = TransactionId::new(9990);
        assert!(!txn.is_none());
        assert_eq!(txn.next().as_u64(), 9991);
        assert_eq!(TransactionId::default(), TransactionId::NONE);
        assert_eq!(format!("{:?}", TransactionId::NONE), "TransactionId(NONE)");
        assert_eq!(u64::from(txn), 9990);
    }
}
