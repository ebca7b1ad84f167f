//! Transaction manager for coordinating transaction lifecycle.
//!
//! Owns the transaction id namespace: allocation, validation, and the one
//! way `Open -> Closed` transition. Engine work happens elsewhere; this
//! module only decides which calls may touch which transaction.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tablet_common::error::{TabletError, TabletResult};
use tablet_common::types::{SessionId, TransactionId};
use tracing::{debug, warn};

/// The state of a tracked transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction accepts statements.
    Open,
    /// A commit, rollback or kill is in progress.
    Closing,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Open => write!(f, "Open"),
            TransactionState::Closing => write!(f, "Closing"),
        }
    }
}

/// How a claimed transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    /// Committed by the caller.
    Committed,
    /// Rolled back by the caller.
    RolledBack,
    /// Rolled back by the server (expiry, closed session).
    Killed,
}

struct Transaction {
    session_id: SessionId,
    state: TransactionState,
    started_at: Instant,
    last_used: Instant,
}

/// Statistics about the transaction manager.
#[derive(Debug, Default)]
pub struct TransactionStats {
    /// Total transactions started.
    pub begun: AtomicU64,
    /// Total transactions committed.
    pub committed: AtomicU64,
    /// Total transactions rolled back by callers.
    pub rolled_back: AtomicU64,
    /// Total transactions rolled back by the server.
    pub killed: AtomicU64,
    /// Currently open transactions.
    pub active: AtomicU64,
}

impl TransactionStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }
}

/// The transaction manager.
///
/// All methods are safe to call concurrently. Allocation and lookups go
/// through one lock so a transaction can never be claimed twice.
pub struct TransactionManager {
    /// Tracked transactions.
    transactions: RwLock<HashMap<TransactionId, Mutex<Transaction>>>,
    /// Next transaction ID.
    next_txn_id: AtomicU64,
    /// Statistics.
    stats: TransactionStats,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    /// Creates a new transaction manager.
    pub fn new() -> Self {
        Self {
            transactions: RwLock::new(HashMap::new()),
            next_txn_id: AtomicU64::new(TransactionId::MIN.as_u64()),
            stats: TransactionStats::new(),
        }
    }

    /// Allocates a fresh transaction for `session_id`.
    pub fn begin(&self, session_id: SessionId) -> TransactionId {
        let txn_id = TransactionId::new(self.next_txn_id.fetch_add(1, AtomicOrdering::SeqCst));
        let now = Instant::now();
        self.transactions.write().insert(
            txn_id,
            Mutex::new(Transaction {
                session_id,
                state: TransactionState::Open,
                started_at: now,
                last_used: now,
            }),
        );

        self.stats.begun.fetch_add(1, AtomicOrdering::Relaxed);
        self.stats.active.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(%session_id, %txn_id, "transaction begun");
        txn_id
    }

    /// Checks that `txn_id` is open and belongs to `session_id`, and marks
    /// it as used. A zero id is always accepted (autocommit).
    ///
    /// # Errors
    ///
    /// `NotInTransaction` if the id is unknown or closing,
    /// `SessionMismatch` if another session owns it.
    pub fn check(&self, session_id: SessionId, txn_id: TransactionId) -> TabletResult<()> {
        if txn_id.is_none() {
            return Ok(());
        }
        let txns = self.transactions.read();
        let mut txn = Self::lookup(&txns, session_id, txn_id)?;
        txn.last_used = Instant::now();
        Ok(())
    }

    /// Takes exclusive hold of a transaction in order to close it.
    ///
    /// From this point on every other call sees the id as closed. The
    /// transaction is forgotten when the claim is finished or dropped.
    ///
    /// # Errors
    ///
    /// `NotInTransaction` if the id is zero, unknown or already closing,
    /// `SessionMismatch` if another session owns it. A failed claim
    /// leaves the transaction untouched.
    pub fn claim(self: &Arc<Self>, session_id: SessionId, txn_id: TransactionId) -> TabletResult<Claim> {
        if txn_id.is_none() {
            return Err(TabletError::not_in_transaction("not in a transaction"));
        }
        let txns = self.transactions.read();
        let mut txn = Self::lookup(&txns, session_id, txn_id)?;
        txn.state = TransactionState::Closing;
        Ok(Claim::new(Arc::clone(self), txn_id, session_id))
    }

    /// Claims every open transaction of a session.
    pub fn claim_session(self: &Arc<Self>, session_id: SessionId) -> Vec<Claim> {
        self.claim_where(|txn| txn.session_id == session_id)
    }

    /// Claims every open transaction idle for longer than `timeout`.
    pub fn claim_expired(self: &Arc<Self>, timeout: Duration) -> Vec<Claim> {
        let claims = self.claim_where(|txn| txn.last_used.elapsed() > timeout);
        if !claims.is_empty() {
            warn!(count = claims.len(), ?timeout, "claimed expired transactions");
        }
        claims
    }

    /// Returns the number of open transactions.
    pub fn active_count(&self) -> usize {
        self.stats.active.load(AtomicOrdering::Relaxed) as usize
    }

    /// Returns statistics.
    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    /// Validates under the entry lock and hands the lock back, so the
    /// caller's update is atomic with the check.
    fn lookup<'a>(
        txns: &'a HashMap<TransactionId, Mutex<Transaction>>,
        session_id: SessionId,
        txn_id: TransactionId,
    ) -> TabletResult<MutexGuard<'a, Transaction>> {
        let not_open = || TabletError::not_in_transaction(format!("transaction {txn_id} not open"));
        let txn = txns.get(&txn_id).ok_or_else(not_open)?.lock();
        if txn.state != TransactionState::Open {
            return Err(not_open());
        }
        if txn.session_id != session_id {
            return Err(TabletError::session_mismatch(format!(
                "transaction {txn_id} belongs to session {}, not {session_id}",
                txn.session_id
            )));
        }
        Ok(txn)
    }

    fn claim_where(self: &Arc<Self>, pred: impl Fn(&Transaction) -> bool) -> Vec<Claim> {
        let txns = self.transactions.read();
        txns.iter()
            .filter_map(|(&txn_id, entry)| {
                let mut txn = entry.lock();
                if txn.state == TransactionState::Open && pred(&txn) {
                    txn.state = TransactionState::Closing;
                    Some(Claim::new(Arc::clone(self), txn_id, txn.session_id))
                } else {
                    None
                }
            })
            .collect()
    }

    fn release(&self, txn_id: TransactionId, outcome: TxnOutcome) {
        let Some(txn) = self.transactions.write().remove(&txn_id) else {
            return;
        };
        let age = txn.into_inner().started_at.elapsed();
        let counter = match outcome {
            TxnOutcome::Committed => &self.stats.committed,
            TxnOutcome::RolledBack => &self.stats.rolled_back,
            TxnOutcome::Killed => &self.stats.killed,
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
        self.stats.active.fetch_sub(1, AtomicOrdering::Relaxed);
        debug!(%txn_id, ?outcome, ?age, "transaction closed");
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active_count", &self.active_count())
            .field("next_txn_id", &self.next_txn_id.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

/// Exclusive hold on a transaction that is being closed.
///
/// Dropping a claim without [`Claim::finish`] still closes the
/// transaction, counted as killed.
#[derive(Debug)]
pub struct Claim {
    manager: Arc<TransactionManager>,
    txn_id: TransactionId,
    session_id: SessionId,
    done: bool,
}

impl Claim {
    fn new(manager: Arc<TransactionManager>, txn_id: TransactionId, session_id: SessionId) -> Self {
        Self {
            manager,
            txn_id,
            session_id,
            done: false,
        }
    }

    /// The claimed transaction.
    pub fn txn_id(&self) -> TransactionId {
        self.txn_id
    }

    /// The session that owned the transaction.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Closes the transaction, recording how it ended.
    pub fn finish(mut self, outcome: TxnOutcome) {
        self.done = true;
        self.manager.release(self.txn_id, outcome);
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.done {
            self.manager.release(self.txn_id, TxnOutcome::Killed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;
    use tablet_common::error::ErrorKind;

    const S1: SessionId = SessionId::new(1);
    const S2: SessionId = SessionId::new(2);

    fn create_manager() -> Arc<TransactionManager> {
        Arc::new(TransactionManager::new())
    }

    #[test]
    fn test_transaction_lifecycle() {
        let tm = create_manager();

        let txn = tm.begin(S1);
        assert_eq!(tm.active_count(), 1);
        tm.check(S1, txn).unwrap();

        tm.claim(S1, txn).unwrap().finish(TxnOutcome::Committed);
        assert_eq!(tm.active_count(), 0);
        assert_eq!(tm.stats().committed.load(AtomicOrdering::Relaxed), 1);
        assert_eq!(
            tm.check(S1, txn).unwrap_err().kind(),
            ErrorKind::NotInTransaction
        );
    }

    #[test]
    fn test_double_close() {
        let tm = create_manager();
        let txn = tm.begin(S1);
        tm.claim(S1, txn).unwrap().finish(TxnOutcome::RolledBack);

        let err = tm.claim(S1, txn).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInTransaction);
        let err = tm.check(S1, txn).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInTransaction);
    }

    #[test]
    fn test_zero_and_unknown_ids() {
        let tm = create_manager();
        tm.check(S1, TransactionId::NONE).unwrap();
        assert_eq!(
            tm.claim(S1, TransactionId::NONE).unwrap_err().kind(),
            ErrorKind::NotInTransaction
        );
        assert_eq!(
            tm.claim(S1, TransactionId::new(424_242)).unwrap_err().kind(),
            ErrorKind::NotInTransaction
        );
    }

    #[test]
    fn test_session_mismatch_leaves_transaction_open() {
        let tm = create_manager();
        let txn = tm.begin(S1);

        assert_eq!(tm.claim(S2, txn).unwrap_err().kind(), ErrorKind::SessionMismatch);
        assert_eq!(tm.check(S2, txn).unwrap_err().kind(), ErrorKind::SessionMismatch);

        // The owner can still use and close it.
        tm.check(S1, txn).unwrap();
        tm.claim(S1, txn).unwrap().finish(TxnOutcome::Committed);
    }

    #[test]
    fn test_claimed_transaction_is_closed_to_others() {
        let tm = create_manager();
        let txn = tm.begin(S1);
        let claim = tm.claim(S1, txn).unwrap();

        assert_eq!(tm.check(S1, txn).unwrap_err().kind(), ErrorKind::NotInTransaction);
        assert_eq!(tm.claim(S1, txn).unwrap_err().kind(), ErrorKind::NotInTransaction);
        drop(claim);

        assert_eq!(tm.active_count(), 0);
        assert_eq!(tm.stats().killed.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_claim_session() {
        let tm = create_manager();
        let a = tm.begin(S1);
        let b = tm.begin(S1);
        let c = tm.begin(S2);

        let claims = tm.claim_session(S1);
        let ids: HashSet<_> = claims.iter().map(Claim::txn_id).collect();
        assert_eq!(ids, HashSet::from([a, b]));
        claims.into_iter().for_each(|c| c.finish(TxnOutcome::Killed));

        tm.check(S2, c).unwrap();
        assert_eq!(tm.active_count(), 1);
    }

    #[test]
    fn test_claim_expired() {
        let tm = create_manager();
        let old = tm.begin(S1);
        thread::sleep(Duration::from_millis(30));
        let fresh = tm.begin(S1);

        let claims = tm.claim_expired(Duration::from_millis(20));
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].txn_id(), old);
        drop(claims);

        tm.check(S1, fresh).unwrap();
        assert_eq!(tm.check(S1, old).unwrap_err().kind(), ErrorKind::NotInTransaction);
    }

    #[test]
    fn test_ids_unique_under_concurrency() {
        let tm = create_manager();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tm = Arc::clone(&tm);
                thread::spawn(move || {
                    let session = SessionId::new(i + 1);
                    (0..200).map(|_| tm.begin(session)).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(!id.is_none());
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 1600);
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let tm = create_manager();
        let txn = tm.begin(S1);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tm = Arc::clone(&tm);
                thread::spawn(move || tm.claim(S1, txn).map(|c| c.finish(TxnOutcome::Committed)))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Result::is_ok)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(tm.stats().committed.load(AtomicOrdering::Relaxed), 1);
    }
}
