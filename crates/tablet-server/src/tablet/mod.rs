//! The tablet query server.
//!
//! [`TabletServer`] implements [`QueryService`] on top of a [`SqlEngine`]
//! and a [`Topology`]. It owns the session registry and the transaction
//! manager; all row work is delegated to the engine, which runs on the
//! blocking thread pool.
//!
//! Local checks (session, transaction, arguments) always run before any
//! engine work, so a rejected call never touches the engine.

pub mod split;
pub mod stream;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tablet_common::error::{TabletError, TabletResult};
use tablet_common::types::{SessionId, TransactionId};
use tablet_proto::guard::panic_message;
use tablet_proto::stream::spawn_blocking_stream;
use tablet_proto::{BoundQuery, CallContext, QueryResult, QueryService, QuerySplit, QueryStream};
use tablet_txn::{Claim, SessionRegistry, TransactionManager, TxnOutcome};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::engine::{EngineError, EngineResult, SqlEngine};
use crate::topology::Topology;

use self::stream::ChunkSink;

/// Query counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Single statements executed.
    pub executes: AtomicU64,
    /// Batches executed.
    pub batches: AtomicU64,
    /// Streams started.
    pub streams: AtomicU64,
    /// Split requests served.
    pub splits: AtomicU64,
    /// Statements the engine rejected.
    pub engine_failures: AtomicU64,
}

/// A tablet serving one keyspace.
pub struct TabletServer {
    config: ServerConfig,
    engine: Arc<dyn SqlEngine>,
    topology: Arc<dyn Topology>,
    sessions: SessionRegistry,
    txns: Arc<TransactionManager>,
    stats: ServerStats,
}

impl TabletServer {
    /// Creates a server.
    pub fn new(config: ServerConfig, engine: Arc<dyn SqlEngine>, topology: Arc<dyn Topology>) -> Self {
        Self {
            config,
            engine,
            topology,
            sessions: SessionRegistry::new(),
            txns: Arc::new(TransactionManager::new()),
            stats: ServerStats::default(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the session registry.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Returns the transaction manager.
    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.txns
    }

    /// Returns query counters.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Rolls back every transaction idle for longer than the configured
    /// timeout. Returns how many were rolled back.
    pub async fn reap_expired(&self) -> usize {
        let claims = self.txns.claim_expired(self.config.transaction_timeout());
        let count = claims.len();
        for claim in claims {
            self.kill(claim).await;
        }
        count
    }

    /// Runs [`TabletServer::reap_expired`] periodically until `shutdown`
    /// fires.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let server = Arc::clone(self);
        let period = self.config.reaper_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let killed = server.reap_expired().await;
                        if killed > 0 {
                            info!(killed, "rolled back expired transactions");
                        }
                    }
                }
            }
            debug!("transaction reaper stopped");
        })
    }

    /// Applies the configured default deadline.
    fn call_context(&self, ctx: &CallContext) -> TabletResult<CallContext> {
        let ctx = match self.config.query_timeout() {
            Some(timeout) => ctx.clone().timeout(timeout),
            None => ctx.clone(),
        };
        match ctx.err() {
            Some(err) => Err(err),
            None => Ok(ctx),
        }
    }

    /// Runs engine work, giving up as soon as `ctx` ends. The engine sees
    /// the cancellation through its own context and stops on its own.
    async fn run_engine<T, F>(&self, ctx: &CallContext, work: F) -> TabletResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SqlEngine, &CallContext) -> EngineResult<T> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let work_ctx = ctx.child();
        let task = {
            let work_ctx = work_ctx.clone();
            tokio::task::spawn_blocking(move || work(engine.as_ref(), &work_ctx))
        };
        tokio::select! {
            biased;
            joined = task => self.engine_outcome(joined),
            err = ctx.done() => {
                work_ctx.cancel();
                Err(err)
            }
        }
    }

    /// Runs engine work that must reach a definite outcome.
    async fn run_to_completion<T, F>(&self, work: F) -> TabletResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SqlEngine) -> EngineResult<T> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let joined = tokio::task::spawn_blocking(move || work(engine.as_ref())).await;
        self.engine_outcome(joined)
    }

    fn engine_outcome<T>(&self, joined: Result<EngineResult<T>, JoinError>) -> TabletResult<T> {
        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if matches!(e, EngineError::Failed(_)) {
                    self.stats.engine_failures.fetch_add(1, Ordering::Relaxed);
                }
                debug!(error = %e, "engine call failed");
                Err(e.into())
            }
            Err(e) if e.is_panic() => {
                let message = panic_message(&*e.into_panic());
                error!(%message, "engine panicked");
                Err(TabletError::caught_panic(message))
            }
            Err(_) => Err(TabletError::cancelled("engine call was aborted")),
        }
    }

    async fn close_transaction(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
        outcome: TxnOutcome,
    ) -> TabletResult<()> {
        self.call_context(ctx)?;
        let claim = self.txns.claim(session_id, transaction_id)?;

        let result = if outcome == TxnOutcome::Committed {
            self.run_to_completion(move |engine| engine.commit(transaction_id))
                .await
        } else {
            self.run_to_completion(move |engine| engine.rollback(transaction_id))
                .await
        };

        match &result {
            Ok(()) => claim.finish(outcome),
            Err(e) => {
                warn!(%session_id, %transaction_id, error = %e, ?outcome, "engine failed to close transaction");
                if outcome == TxnOutcome::Committed {
                    self.kill(claim).await;
                } else {
                    claim.finish(TxnOutcome::Killed);
                }
            }
        }
        result
    }

    async fn kill(&self, claim: Claim) {
        let txn_id = claim.txn_id();
        if let Err(e) = self.run_to_completion(move |engine| engine.rollback(txn_id)).await {
            warn!(%txn_id, error = %e, "rollback of killed transaction failed");
        }
        claim.finish(TxnOutcome::Killed);
    }

    fn check_target(&self, session_id: SessionId, transaction_id: TransactionId) -> TabletResult<()> {
        self.sessions.validate(session_id)?;
        self.txns.check(session_id, transaction_id)
    }
}

#[async_trait]
impl QueryService for TabletServer {
    async fn get_session_id(
        &self,
        _ctx: &CallContext,
        keyspace: &str,
        shard: &str,
    ) -> TabletResult<SessionId> {
        self.topology.key_range(keyspace, shard)?;
        Ok(self.sessions.open(keyspace, shard))
    }

    async fn close_session(&self, _ctx: &CallContext, session_id: SessionId) -> TabletResult<()> {
        self.sessions.close(session_id)?;
        let claims = self.txns.claim_session(session_id);
        if !claims.is_empty() {
            warn!(%session_id, count = claims.len(), "rolling back transactions of closed session");
        }
        for claim in claims {
            self.kill(claim).await;
        }
        Ok(())
    }

    async fn begin(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
    ) -> TabletResult<TransactionId> {
        self.sessions.validate(session_id)?;
        if !transaction_id.is_none() {
            return Err(TabletError::invalid_argument(format!(
                "begin called inside transaction {transaction_id}"
            )));
        }
        self.call_context(ctx)?;

        let txn_id = self.txns.begin(session_id);
        match self.run_to_completion(move |engine| engine.begin(txn_id)).await {
            Ok(()) => Ok(txn_id),
            Err(e) => {
                if let Ok(claim) = self.txns.claim(session_id, txn_id) {
                    claim.finish(TxnOutcome::Killed);
                }
                Err(e)
            }
        }
    }

    async fn commit(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
    ) -> TabletResult<()> {
        self.close_transaction(ctx, session_id, transaction_id, TxnOutcome::Committed)
            .await
    }

    async fn rollback(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
    ) -> TabletResult<()> {
        self.close_transaction(ctx, session_id, transaction_id, TxnOutcome::RolledBack)
            .await
    }

    async fn execute(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
        query: BoundQuery,
    ) -> TabletResult<QueryResult> {
        self.check_target(session_id, transaction_id)?;
        let ctx = self.call_context(ctx)?;
        self.stats.executes.fetch_add(1, Ordering::Relaxed);
        debug!(%session_id, %transaction_id, sql = %query.sql, "execute");

        self.run_engine(&ctx, move |engine, ctx| {
            engine.execute(ctx, transaction_id, &query)
        })
        .await
    }

    async fn execute_batch(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
        queries: Vec<BoundQuery>,
    ) -> TabletResult<Vec<QueryResult>> {
        self.check_target(session_id, transaction_id)?;
        let ctx = self.call_context(ctx)?;
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        debug!(%session_id, %transaction_id, count = queries.len(), "execute batch");

        self.run_engine(&ctx, move |engine, ctx| {
            queries
                .iter()
                .map(|query| engine.execute(ctx, transaction_id, query))
                .collect::<EngineResult<Vec<_>>>()
        })
        .await
    }

    async fn stream_execute(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
        query: BoundQuery,
    ) -> TabletResult<QueryStream> {
        self.check_target(session_id, transaction_id)?;
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        self.stats.streams.fetch_add(1, Ordering::Relaxed);
        debug!(%session_id, %transaction_id, sql = %query.sql, "stream execute");

        let engine = Arc::clone(&self.engine);
        let batch_rows = self.config.stream_batch_rows;
        let stream = spawn_blocking_stream(ctx, self.config.stream_buffer_size, move |sender| {
            let ctx = sender.context().clone();
            let mut sink = ChunkSink::new(sender, batch_rows);
            let outcome = engine.stream_execute(&ctx, transaction_id, &query, &mut sink);
            sink.finish(outcome)
        });
        stream.prime().await
    }

    async fn split_query(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        query: BoundQuery,
        split_count: i64,
    ) -> TabletResult<Vec<QuerySplit>> {
        if split_count <= 0 {
            return Err(TabletError::invalid_argument(format!(
                "split count must be positive, got {split_count}"
            )));
        }
        let session = self.sessions.get(session_id)?;
        let range = self.topology.key_range(&session.keyspace, &session.shard)?;
        let plan = split::analyze(&query.sql)?;
        let ctx = self.call_context(ctx)?;

        let table = plan.table.clone();
        let stats = self
            .run_engine(&ctx, move |engine, _| engine.table_stats(&table))
            .await?;
        self.stats.splits.fetch_add(1, Ordering::Relaxed);

        let splits = split::split(&query, &plan, &stats, range, split_count.unsigned_abs());
        debug!(%session_id, table = %plan.table, requested = split_count, produced = splits.len(), "split query");
        Ok(splits)
    }
}

impl std::fmt::Debug for TabletServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabletServer")
            .field("keyspace", &self.config.keyspace)
            .field("sessions", &self.sessions.len())
            .field("transactions", &self.txns.active_count())
            .finish()
    }
}
