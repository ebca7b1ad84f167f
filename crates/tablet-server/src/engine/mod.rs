//! SQL engine collaborator.
//!
//! The tablet never touches row data itself. Statements, transaction
//! handles and table statistics all go through [`SqlEngine`]. Engine calls
//! are synchronous; the server runs them on the blocking thread pool.

mod memory;

pub use memory::{Fixture, FixtureSet, MemoryEngine};

use serde::{Deserialize, Serialize};
use tablet_common::error::TabletError;
use tablet_common::types::TransactionId;
use tablet_proto::{BoundQuery, CallContext, Field, QueryResult, Row};
use thiserror::Error;

/// Engine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine failed to execute a statement.
    #[error("{0}")]
    Failed(String),
    /// The engine observed a cancelled call context.
    #[error("query cancelled")]
    Cancelled,
    /// The consumer of a streamed result went away.
    #[error("stream abandoned by consumer")]
    Abandoned,
    /// The engine broke the result shape contract.
    #[error("engine contract violation: {0}")]
    Contract(String),
}

/// Engine result type.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<EngineError> for TabletError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Failed(message) => TabletError::execution_failed(message),
            EngineError::Cancelled | EngineError::Abandoned => TabletError::cancelled(e.to_string()),
            EngineError::Contract(_) => TabletError::internal(e.to_string()),
        }
    }
}

/// Receives a streamed result from the engine.
///
/// The engine calls [`RowSink::fields`] once, then [`RowSink::row`] per
/// row. An error from either method means the consumer is gone or the
/// contract was broken; the engine must stop and release its cursor.
pub trait RowSink: Send {
    /// Delivers the result columns.
    fn fields(&mut self, fields: Vec<Field>) -> EngineResult<()>;

    /// Delivers one row.
    fn row(&mut self, row: Row) -> EngineResult<()>;
}

/// Key statistics of a table, used to plan splits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    /// Sharding key column.
    pub key_column: String,
    /// Smallest key value in the table.
    pub min_key: u64,
    /// Largest key value in the table.
    pub max_key: u64,
    /// Estimated row count.
    pub row_count: u64,
}

/// The SQL engine a tablet serves.
pub trait SqlEngine: Send + Sync + 'static {
    /// Opens a transaction handle.
    fn begin(&self, txn_id: TransactionId) -> EngineResult<()>;

    /// Commits a transaction handle.
    fn commit(&self, txn_id: TransactionId) -> EngineResult<()>;

    /// Rolls back a transaction handle.
    fn rollback(&self, txn_id: TransactionId) -> EngineResult<()>;

    /// Executes one statement. A zero `txn_id` means autocommit.
    fn execute(
        &self,
        ctx: &CallContext,
        txn_id: TransactionId,
        query: &BoundQuery,
    ) -> EngineResult<QueryResult>;

    /// Executes a statement and pushes its result into `sink` as it is
    /// produced.
    fn stream_execute(
        &self,
        ctx: &CallContext,
        txn_id: TransactionId,
        query: &BoundQuery,
        sink: &mut dyn RowSink,
    ) -> EngineResult<()>;

    /// Returns key statistics for `table`.
    fn table_stats(&self, table: &str) -> EngineResult<TableStats>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_common::error::ErrorKind;

    #[test]
    fn test_engine_error_conversion() {
        let err: TabletError = EngineError::Failed("duplicate key".into()).into();
        assert_eq!(err.kind(), ErrorKind::ExecutionFailed);
        assert_eq!(err.to_string(), "error: duplicate key");

        let err: TabletError = EngineError::Abandoned.into();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        let err: TabletError = EngineError::Contract("rows before fields".into()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.is_caught_panic());
    }
}
