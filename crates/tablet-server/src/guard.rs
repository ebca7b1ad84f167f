//! Panic containment middleware.
//!
//! [`PanicGuard`] wraps any [`QueryService`] and runs every call on its own
//! task. A panic inside the call becomes an `Internal` error whose message
//! starts with `caught panic: `; the server keeps serving. For streaming
//! calls, a panic before the first chunk fails the call itself, and a panic
//! after it shows up in the stream's terminal error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tablet_common::error::TabletResult;
use tablet_common::types::{SessionId, TransactionId};
use tablet_proto::guard::contain;
use tablet_proto::{BoundQuery, CallContext, QueryResult, QueryService, QuerySplit, QueryStream};

/// Wraps a service so that panics never escape a call.
#[derive(Debug)]
pub struct PanicGuard<S: ?Sized> {
    inner: Arc<S>,
    caught: AtomicU64,
}

impl<S: QueryService + ?Sized> PanicGuard<S> {
    /// Wraps `inner`.
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            caught: AtomicU64::new(0),
        }
    }

    /// Returns the wrapped service.
    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    /// Number of panics caught so far.
    pub fn caught(&self) -> u64 {
        self.caught.load(Ordering::Relaxed)
    }

    fn observe<T>(&self, result: TabletResult<T>) -> TabletResult<T> {
        if let Err(e) = &result {
            if e.is_caught_panic() {
                self.caught.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }
}

#[async_trait]
impl<S: QueryService + ?Sized> QueryService for PanicGuard<S> {
    async fn get_session_id(
        &self,
        ctx: &CallContext,
        keyspace: &str,
        shard: &str,
    ) -> TabletResult<SessionId> {
        let (inner, ctx) = (Arc::clone(&self.inner), ctx.clone());
        let (keyspace, shard) = (keyspace.to_string(), shard.to_string());
        self.observe(contain(async move { inner.get_session_id(&ctx, &keyspace, &shard).await }).await)
    }

    async fn close_session(&self, ctx: &CallContext, session_id: SessionId) -> TabletResult<()> {
        let (inner, ctx) = (Arc::clone(&self.inner), ctx.clone());
        self.observe(contain(async move { inner.close_session(&ctx, session_id).await }).await)
    }

    async fn begin(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
    ) -> TabletResult<TransactionId> {
        let (inner, ctx) = (Arc::clone(&self.inner), ctx.clone());
        self.observe(
            contain(async move { inner.begin(&ctx, session_id, transaction_id).await }).await,
        )
    }

    async fn commit(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
    ) -> TabletResult<()> {
        let (inner, ctx) = (Arc::clone(&self.inner), ctx.clone());
        self.observe(
            contain(async move { inner.commit(&ctx, session_id, transaction_id).await }).await,
        )
    }

    async fn rollback(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
    ) -> TabletResult<()> {
        let (inner, ctx) = (Arc::clone(&self.inner), ctx.clone());
        self.observe(
            contain(async move { inner.rollback(&ctx, session_id, transaction_id).await }).await,
        )
    }

    async fn execute(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
        query: BoundQuery,
    ) -> TabletResult<QueryResult> {
        let (inner, ctx) = (Arc::clone(&self.inner), ctx.clone());
        self.observe(
            contain(async move { inner.execute(&ctx, session_id, transaction_id, query).await })
                .await,
        )
    }

    async fn execute_batch(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
        queries: Vec<BoundQuery>,
    ) -> TabletResult<Vec<QueryResult>> {
        let (inner, ctx) = (Arc::clone(&self.inner), ctx.clone());
        self.observe(
            contain(async move {
                inner
                    .execute_batch(&ctx, session_id, transaction_id, queries)
                    .await
            })
            .await,
        )
    }

    async fn stream_execute(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
        query: BoundQuery,
    ) -> TabletResult<QueryStream> {
        let (inner, ctx) = (Arc::clone(&self.inner), ctx.clone());
        self.observe(
            contain(async move {
                let stream = inner
                    .stream_execute(&ctx, session_id, transaction_id, query)
                    .await?;
                stream.prime().await
            })
            .await,
        )
    }

    async fn split_query(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        query: BoundQuery,
        split_count: i64,
    ) -> TabletResult<Vec<QuerySplit>> {
        let (inner, ctx) = (Arc::clone(&self.inner), ctx.clone());
        self.observe(
            contain(async move { inner.split_query(&ctx, session_id, query, split_count).await })
                .await,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_common::error::{ErrorKind, TabletError};
    use tablet_proto::stream::spawn_stream;
    use tablet_proto::{ChunkSender, Field, Value};

    /// Panics in every call except `get_session_id`.
    struct Exploding;

    async fn half_then_panic(mut sender: ChunkSender) -> TabletResult<()> {
        sender.send(QueryResult::header(vec![Field::new("a", 1)])).await?;
        sender.send(QueryResult::rows(vec![vec![Value::Int(1)]])).await?;
        panic!("stream blew up");
    }

    #[async_trait]
    impl QueryService for Exploding {
        async fn get_session_id(&self, _: &CallContext, _: &str, _: &str) -> TabletResult<SessionId> {
            Ok(SessionId::new(1))
        }
        async fn close_session(&self, _: &CallContext, _: SessionId) -> TabletResult<()> {
            panic!("close_session");
        }
        async fn begin(&self, _: &CallContext, _: SessionId, _: TransactionId) -> TabletResult<TransactionId> {
            panic!("begin");
        }
        async fn commit(&self, _: &CallContext, _: SessionId, _: TransactionId) -> TabletResult<()> {
            panic!("commit");
        }
        async fn rollback(&self, _: &CallContext, _: SessionId, _: TransactionId) -> TabletResult<()> {
            Err(TabletError::execution_failed("plain failure"))
        }
        async fn execute(
            &self,
            _: &CallContext,
            _: SessionId,
            _: TransactionId,
            _: BoundQuery,
        ) -> TabletResult<QueryResult> {
            panic!("execute");
        }
        async fn execute_batch(
            &self,
            _: &CallContext,
            _: SessionId,
            _: TransactionId,
            _: Vec<BoundQuery>,
        ) -> TabletResult<Vec<QueryResult>> {
            panic!("execute_batch");
        }
        async fn stream_execute(
            &self,
            ctx: &CallContext,
            _: SessionId,
            _: TransactionId,
            query: BoundQuery,
        ) -> TabletResult<QueryStream> {
            if query.sql == "early" {
                panic!("stream_execute");
            }
            Ok(spawn_stream(ctx, 4, half_then_panic))
        }
        async fn split_query(
            &self,
            _: &CallContext,
            _: SessionId,
            _: BoundQuery,
            _: i64,
        ) -> TabletResult<Vec<QuerySplit>> {
            panic!("split_query");
        }
    }

    #[tokio::test]
    async fn test_panics_become_internal() {
        let guard = PanicGuard::new(Arc::new(Exploding));
        let ctx = CallContext::background();
        let s = SessionId::new(1);
        let t = TransactionId::new(2);

        assert!(guard.get_session_id(&ctx, "ks", "0").await.is_ok());

        let err = guard.begin(&ctx, s, TransactionId::NONE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.to_string(), "error: caught panic: begin");

        assert!(guard.commit(&ctx, s, t).await.unwrap_err().is_caught_panic());
        assert!(guard.close_session(&ctx, s).await.unwrap_err().is_caught_panic());
        assert!(guard
            .execute(&ctx, s, t, BoundQuery::new("x"))
            .await
            .unwrap_err()
            .is_caught_panic());
        assert!(guard
            .execute_batch(&ctx, s, t, vec![])
            .await
            .unwrap_err()
            .is_caught_panic());
        assert!(guard
            .split_query(&ctx, s, BoundQuery::new("x"), 3)
            .await
            .unwrap_err()
            .is_caught_panic());
        assert_eq!(guard.caught(), 6);
    }

    #[tokio::test]
    async fn test_normal_errors_pass_through() {
        let guard = PanicGuard::new(Arc::new(Exploding));
        let ctx = CallContext::background();

        let err = guard
            .rollback(&ctx, SessionId::new(1), TransactionId::new(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutionFailed);
        assert!(!err.is_caught_panic());
        assert_eq!(guard.caught(), 0);
    }

    #[tokio::test]
    async fn test_stream_panics() {
        let guard = PanicGuard::new(Arc::new(Exploding));
        let ctx = CallContext::background();
        let (s, t) = (SessionId::new(1), TransactionId::NONE);

        let err = guard
            .stream_execute(&ctx, s, t, BoundQuery::new("early"))
            .await
            .unwrap_err();
        assert!(err.is_caught_panic());

        let mut stream = guard
            .stream_execute(&ctx, s, t, BoundQuery::new("late"))
            .await
            .unwrap();
        assert!(stream.next().await.unwrap().is_header());
        assert_eq!(stream.next().await.unwrap().rows.len(), 1);
        assert!(stream.next().await.is_none());
        let err = stream.err().unwrap();
        assert!(err.is_caught_panic());
        assert!(err.message().contains("stream blew up"));
    }
}
