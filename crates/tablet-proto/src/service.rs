//! The query service contract.
//!
//! Every tablet-side implementation (the real server, the panic guard
//! middleware, test fakes) implements [`QueryService`]. The RPC layer only
//! ever talks to this trait.

use async_trait::async_trait;
use tablet_common::error::TabletResult;
use tablet_common::types::{SessionId, TransactionId};

use crate::context::CallContext;
use crate::stream::QueryStream;
use crate::value::{BoundQuery, QueryResult, QuerySplit};

/// Server side of the tablet query protocol.
///
/// A `transaction_id` of zero means autocommit. Calls sharing one
/// transaction are issued one at a time by the caller; calls on different
/// transactions or sessions run concurrently.
///
/// # Example
///
/// ```rust,ignore
/// let session = service.get_session_id(&ctx, "test_keyspace", "0").await?;
/// let txn = service.begin(&ctx, session, TransactionId::NONE).await?;
/// service.execute(&ctx, session, txn, BoundQuery::new("insert ...")).await?;
/// service.commit(&ctx, session, txn).await?;
/// ```
#[async_trait]
pub trait QueryService: Send + Sync + 'static {
    /// Opens a session against a keyspace and shard.
    async fn get_session_id(
        &self,
        ctx: &CallContext,
        keyspace: &str,
        shard: &str,
    ) -> TabletResult<SessionId>;

    /// Invalidates a session, rolling back transactions it left open.
    async fn close_session(&self, ctx: &CallContext, session_id: SessionId) -> TabletResult<()>;

    /// Starts a transaction. `transaction_id` must be zero: begin never
    /// nests.
    async fn begin(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
    ) -> TabletResult<TransactionId>;

    /// Commits a transaction. The id is invalid afterwards, even on error.
    async fn commit(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
    ) -> TabletResult<()>;

    /// Rolls back a transaction. The id is invalid afterwards, even on error.
    async fn rollback(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
    ) -> TabletResult<()>;

    /// Executes one statement.
    async fn execute(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
        query: BoundQuery,
    ) -> TabletResult<QueryResult>;

    /// Executes statements in order. Fails as a whole if any statement
    /// fails.
    async fn execute_batch(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
        queries: Vec<BoundQuery>,
    ) -> TabletResult<Vec<QueryResult>>;

    /// Executes a statement and streams its result.
    ///
    /// A failure before the first chunk is returned as the call's error;
    /// a failure after it is reported by the stream's terminal result.
    async fn stream_execute(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
        query: BoundQuery,
    ) -> TabletResult<QueryStream>;

    /// Partitions a full-table query into about `split_count` key ranges.
    async fn split_query(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        query: BoundQuery,
        split_count: i64,
    ) -> TabletResult<Vec<QuerySplit>>;
}
