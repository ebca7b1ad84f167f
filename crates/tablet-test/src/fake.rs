//! A scripted [`QueryService`].
//!
//! Every method checks its arguments against the canned request the suite
//! sends and records a mismatch instead of failing, so one bad field does
//! not hide the rest. Two switches change the outcome of every call:
//! `has_error` makes it return [`generic_error`], `panics` makes it panic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tablet_common::error::{TabletError, TabletResult};
use tablet_common::types::{SessionId, TransactionId};
use tablet_proto::stream::{spawn_stream, ChunkSender};
use tablet_proto::{
    BoundQuery, CallContext, Field, QueryResult, QuerySplit, QueryService, QueryStream, Row,
    Value,
};
use tokio::sync::watch;
use tracing::debug;

/// Keyspace the suite connects to.
pub const TEST_KEYSPACE: &str = "test_keyspace";
/// Shard the suite connects to.
pub const TEST_SHARD: &str = "test_shard";

pub(crate) const SESSION_ID: SessionId = SessionId::new(5678);
pub(crate) const BEGIN_TRANSACTION_ID: TransactionId = TransactionId::new(9990);
pub(crate) const COMMIT_TRANSACTION_ID: TransactionId = TransactionId::new(999_044);
pub(crate) const ROLLBACK_TRANSACTION_ID: TransactionId = TransactionId::new(999_044);
pub(crate) const EXECUTE_TRANSACTION_ID: TransactionId = TransactionId::new(678);
pub(crate) const STREAM_TRANSACTION_ID: TransactionId = TransactionId::new(6_789_992);
pub(crate) const BATCH_TRANSACTION_ID: TransactionId = TransactionId::new(678);
pub(crate) const SPLIT_COUNT: i64 = 372;

/// Message every scripted failure carries, as rendered to callers.
pub const EXPECTED_ERROR: &str = "error: generic error";

/// The error returned while `has_error` is set.
pub fn generic_error() -> TabletError {
    TabletError::execution_failed("generic error")
}

fn text_row(values: &[&str]) -> Row {
    values.iter().map(|v| Value::from(*v)).collect()
}

pub(crate) fn execute_query() -> BoundQuery {
    BoundQuery::new("executeQuery").bind("bind1", 1_114_444_i64)
}

pub(crate) fn execute_result() -> QueryResult {
    QueryResult {
        fields: vec![Field::new("field1", 42), Field::new("field2", 73)],
        rows: vec![
            text_row(&["row1 value1", "row1 value2"]),
            text_row(&["row2 value1", "row2 value2"]),
        ],
        rows_affected: 123,
        insert_id: 72,
    }
}

pub(crate) fn stream_query() -> BoundQuery {
    BoundQuery::new("streamExecuteQuery").bind("bind1", 93_848_000_i64)
}

pub(crate) fn stream_header() -> QueryResult {
    QueryResult::header(vec![Field::new("field1", 42), Field::new("field2", 73)])
}

pub(crate) fn stream_rows() -> QueryResult {
    QueryResult::rows(vec![
        text_row(&["row1 value1", "row1 value2"]),
        text_row(&["row2 value1", "row2 value2"]),
    ])
}

pub(crate) fn batch_queries() -> Vec<BoundQuery> {
    vec![
        BoundQuery::new("executeBatchQueries1").bind("bind1", 43_i64),
        BoundQuery::new("executeBatchQueries2").bind("bind2", 72_i64),
    ]
}

pub(crate) fn batch_results() -> Vec<QueryResult> {
    vec![
        QueryResult {
            fields: vec![Field::new("field1", 46)],
            rows: vec![text_row(&["row1 value1"]), text_row(&["row2 value1"])],
            rows_affected: 1232,
            insert_id: 712,
        },
        QueryResult {
            fields: vec![Field::new("field1", 42)],
            rows: vec![text_row(&["row1 value1", "row1 value2"])],
            rows_affected: 12333,
            insert_id: 74442,
        },
    ]
}

pub(crate) fn split_query() -> BoundQuery {
    BoundQuery::new("splitQuery").bind("bind1", 43_i64)
}

pub(crate) fn split_result() -> Vec<QuerySplit> {
    vec![QuerySplit {
        query: split_query().bind("keyspace_id", 3333_i64),
        row_count: 4456,
    }]
}

/// A latch a stream producer can park on until the test opens it.
#[derive(Debug)]
pub struct Gate {
    open: watch::Sender<bool>,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            open: watch::channel(false).0,
        }
    }
}

impl Gate {
    /// Lets current and future waiters through.
    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Closes the gate again.
    pub fn reset(&self) {
        self.open.send_replace(false);
    }

    /// Waits until the gate is open.
    pub async fn wait(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Scripted query service used by the conformance suite.
#[derive(Debug, Default)]
pub struct FakeQueryService {
    has_error: AtomicBool,
    panics: AtomicBool,
    stream_panics_early: AtomicBool,
    /// Released by the suite once it holds the first chunk of a failing
    /// stream.
    error_gate: Arc<Gate>,
    /// Same, for a stream that panics after its first chunk.
    panic_gate: Arc<Gate>,
    mismatches: Mutex<Vec<String>>,
}

impl FakeQueryService {
    /// Creates a fake answering every call successfully.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with [`generic_error`].
    pub fn set_has_error(&self, enabled: bool) {
        self.has_error.store(enabled, Ordering::SeqCst);
    }

    /// Makes every call panic.
    pub fn set_panics(&self, enabled: bool) {
        self.panics.store(enabled, Ordering::SeqCst);
    }

    /// With `panics` set, chooses whether streams panic before or after
    /// their first chunk.
    pub fn set_stream_panics_early(&self, enabled: bool) {
        self.stream_panics_early.store(enabled, Ordering::SeqCst);
    }

    /// Returns the gate a failing stream waits on.
    pub fn error_gate(&self) -> &Gate {
        &self.error_gate
    }

    /// Returns the gate a late-panicking stream waits on.
    pub fn panic_gate(&self) -> &Gate {
        &self.panic_gate
    }

    /// Returns every argument mismatch seen so far.
    pub fn mismatches(&self) -> Vec<String> {
        self.mismatches.lock().clone()
    }

    fn has_error(&self) -> bool {
        self.has_error.load(Ordering::SeqCst)
    }

    fn panics(&self) -> bool {
        self.panics.load(Ordering::SeqCst)
    }

    /// Applies the error and panic switches.
    fn scripted(&self) -> TabletResult<()> {
        if self.has_error() {
            return Err(generic_error());
        }
        if self.panics() {
            panic!("test-triggered panic");
        }
        Ok(())
    }

    fn check<T: PartialEq + std::fmt::Debug>(&self, method: &str, what: &str, got: &T, want: &T) {
        if got != want {
            let mismatch = format!("{method}: invalid {what}: got {got:?} expected {want:?}");
            debug!(%mismatch, "fake query service");
            self.mismatches.lock().push(mismatch);
        }
    }
}

#[async_trait]
impl QueryService for FakeQueryService {
    async fn get_session_id(&self, _ctx: &CallContext, keyspace: &str, shard: &str) -> TabletResult<SessionId> {
        self.check("GetSessionId", "keyspace", &keyspace, &TEST_KEYSPACE);
        self.check("GetSessionId", "shard", &shard, &TEST_SHARD);
        Ok(SESSION_ID)
    }

    async fn close_session(&self, _ctx: &CallContext, session_id: SessionId) -> TabletResult<()> {
        self.check("CloseSession", "session id", &session_id, &SESSION_ID);
        Ok(())
    }

    async fn begin(
        &self,
        _ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
    ) -> TabletResult<TransactionId> {
        self.scripted()?;
        self.check("Begin", "session id", &session_id, &SESSION_ID);
        self.check("Begin", "transaction id", &transaction_id, &TransactionId::NONE);
        Ok(BEGIN_TRANSACTION_ID)
    }

    async fn commit(
        &self,
        _ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
    ) -> TabletResult<()> {
        self.scripted()?;
        self.check("Commit", "session id", &session_id, &SESSION_ID);
        self.check("Commit", "transaction id", &transaction_id, &COMMIT_TRANSACTION_ID);
        Ok(())
    }

    async fn rollback(
        &self,
        _ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
    ) -> TabletResult<()> {
        self.scripted()?;
        self.check("Rollback", "session id", &session_id, &SESSION_ID);
        self.check("Rollback", "transaction id", &transaction_id, &ROLLBACK_TRANSACTION_ID);
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
        query: BoundQuery,
    ) -> TabletResult<QueryResult> {
        self.scripted()?;
        self.check("Execute", "query", &query, &execute_query());
        self.check("Execute", "session id", &session_id, &SESSION_ID);
        self.check("Execute", "transaction id", &transaction_id, &EXECUTE_TRANSACTION_ID);
        Ok(execute_result())
    }

    async fn execute_batch(
        &self,
        _ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
        queries: Vec<BoundQuery>,
    ) -> TabletResult<Vec<QueryResult>> {
        self.scripted()?;
        self.check("ExecuteBatch", "queries", &queries, &batch_queries());
        self.check("ExecuteBatch", "session id", &session_id, &SESSION_ID);
        self.check("ExecuteBatch", "transaction id", &transaction_id, &BATCH_TRANSACTION_ID);
        Ok(batch_results())
    }

    async fn stream_execute(
        &self,
        ctx: &CallContext,
        session_id: SessionId,
        transaction_id: TransactionId,
        query: BoundQuery,
    ) -> TabletResult<QueryStream> {
        let panics = self.panics();
        if panics && self.stream_panics_early.load(Ordering::SeqCst) {
            panic!("test-triggered panic early");
        }
        self.check("StreamExecute", "query", &query, &stream_query());
        self.check("StreamExecute", "session id", &session_id, &SESSION_ID);
        self.check("StreamExecute", "transaction id", &transaction_id, &STREAM_TRANSACTION_ID);

        let has_error = self.has_error();
        let error_gate = Arc::clone(&self.error_gate);
        let panic_gate = Arc::clone(&self.panic_gate);
        Ok(spawn_stream(ctx, 4, move |mut sender: ChunkSender| async move {
            sender.send(stream_header()).await?;
            if panics {
                panic_gate.wait().await;
                panic!("test-triggered panic late");
            }
            if has_error {
                error_gate.wait().await;
                return Err(generic_error());
            }
            sender.send(stream_rows()).await
        }))
    }

    async fn split_query(
        &self,
        _ctx: &CallContext,
        session_id: SessionId,
        query: BoundQuery,
        split_count: i64,
    ) -> TabletResult<Vec<QuerySplit>> {
        self.scripted()?;
        self.check("SplitQuery", "session id", &session_id, &SESSION_ID);
        self.check("SplitQuery", "query", &query, &split_query());
        self.check("SplitQuery", "split count", &split_count, &SPLIT_COUNT);
        Ok(split_result())
    }
}
