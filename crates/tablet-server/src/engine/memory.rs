//! Fixture-driven in-memory engine.
//!
//! Serves canned results keyed by SQL text. Fixtures can inject engine
//! failures, panics and mid-stream failures, which makes the engine the
//! workhorse of the integration tests and of `tabletd` demos.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tablet_common::types::TransactionId;
use tablet_proto::{BoundQuery, CallContext, Field, QueryResult, Row};
use tracing::{debug, info};

use super::{EngineError, EngineResult, RowSink, SqlEngine, TableStats};

/// Canned behavior for one SQL statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    /// Statement text the fixture answers.
    pub sql: String,
    /// Result columns.
    #[serde(default)]
    pub fields: Vec<Field>,
    /// Result rows.
    #[serde(default)]
    pub rows: Vec<Row>,
    /// Reported affected row count.
    #[serde(default)]
    pub rows_affected: u64,
    /// Reported insert id.
    #[serde(default)]
    pub insert_id: u64,
    /// Fail with this message. When streaming, the failure happens after
    /// `fail_after` rows if set, else before any output.
    #[serde(default)]
    pub error: Option<String>,
    /// Panic with this message.
    #[serde(default)]
    pub panic: Option<String>,
    /// Rows to stream before failing.
    #[serde(default)]
    pub fail_after: Option<usize>,
    /// Pause before `execute` answers and before each streamed row.
    #[serde(default)]
    pub delay_ms: u64,
}

impl Fixture {
    /// A fixture answering `sql` with `fields` and `rows`.
    pub fn result(sql: impl Into<String>, fields: Vec<Field>, rows: Vec<Row>) -> Self {
        Self {
            sql: sql.into(),
            fields,
            rows,
            ..Self::default()
        }
    }

    /// A DML fixture reporting affected rows and an insert id.
    pub fn dml(sql: impl Into<String>, rows_affected: u64, insert_id: u64) -> Self {
        Self {
            sql: sql.into(),
            rows_affected,
            insert_id,
            ..Self::default()
        }
    }

    /// A fixture whose statement fails.
    pub fn failing(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// A fixture whose statement panics inside the engine.
    pub fn panicking(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            panic: Some(message.into()),
            ..Self::default()
        }
    }

    /// Makes streaming fail with `message` after `rows` rows.
    #[must_use]
    pub fn fail_after(mut self, rows: usize, message: impl Into<String>) -> Self {
        self.fail_after = Some(rows);
        self.error = Some(message.into());
        self
    }

    /// Slows the statement down by `delay`, per row when streaming.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    fn pause(&self) {
        if self.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.delay_ms));
        }
    }

    fn to_result(&self) -> QueryResult {
        QueryResult {
            fields: self.fields.clone(),
            rows: self.rows.clone(),
            rows_affected: self.rows_affected,
            insert_id: self.insert_id,
        }
    }

    fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("injected failure in {}", self.sql))
    }
}

/// Fixture file contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureSet {
    /// Statement fixtures.
    #[serde(default)]
    pub queries: Vec<Fixture>,
    /// Table statistics by table name.
    #[serde(default)]
    pub tables: HashMap<String, TableStats>,
}

impl FixtureSet {
    /// Loads a fixture set from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fixtures {}", path.display()))?;
        let set: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse fixtures {}", path.display()))?;
        Ok(set)
    }

    /// Converts the set to a TOML string.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Engine counters, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryEngineStats {
    /// Engine entry points invoked.
    pub calls: AtomicU64,
    /// Streaming cursors opened.
    pub cursors_opened: AtomicU64,
    /// Streaming cursors released.
    pub cursors_released: AtomicU64,
    /// Rows handed to stream sinks.
    pub rows_streamed: AtomicU64,
    /// Transactions committed.
    pub commits: AtomicU64,
    /// Transactions rolled back.
    pub rollbacks: AtomicU64,
}

/// An engine answering from fixtures.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    fixtures: RwLock<HashMap<String, Fixture>>,
    tables: RwLock<HashMap<String, TableStats>>,
    open_txns: Mutex<HashSet<TransactionId>>,
    /// Statements executed per transaction, zero for autocommit.
    journal: Mutex<Vec<(TransactionId, String)>>,
    /// Fault injected into every commit: a delay, then an optional failure
    /// that leaves the handle open.
    commit_delay_ms: AtomicU64,
    commit_error: Mutex<Option<String>>,
    stats: MemoryEngineStats,
}

impl MemoryEngine {
    /// Creates an engine without fixtures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine serving a fixture set.
    pub fn with_fixtures(set: FixtureSet) -> Self {
        let engine = Self::new();
        for fixture in set.queries {
            engine.add_fixture(fixture);
        }
        for (name, stats) in set.tables {
            engine.add_table(name, stats);
        }
        engine
    }

    /// Loads fixtures from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let set = FixtureSet::from_file(path)?;
        info!(
            path = %path.display(),
            queries = set.queries.len(),
            tables = set.tables.len(),
            "loaded engine fixtures"
        );
        Ok(Self::with_fixtures(set))
    }

    /// Registers or replaces a fixture.
    pub fn add_fixture(&self, fixture: Fixture) {
        self.fixtures.write().insert(fixture.sql.clone(), fixture);
    }

    /// Registers or replaces table statistics.
    pub fn add_table(&self, name: impl Into<String>, stats: TableStats) {
        self.tables.write().insert(name.into(), stats);
    }

    /// Makes every commit take at least `delay`.
    pub fn set_commit_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.commit_delay_ms.store(ms, Ordering::Relaxed);
    }

    /// Makes every commit fail with `message`, keeping the handle open.
    pub fn fail_commits(&self, message: impl Into<String>) {
        *self.commit_error.lock() = Some(message.into());
    }

    /// Returns engine counters.
    pub fn stats(&self) -> &MemoryEngineStats {
        &self.stats
    }

    /// Returns true while the engine holds a handle for `txn_id`.
    pub fn is_open(&self, txn_id: TransactionId) -> bool {
        self.open_txns.lock().contains(&txn_id)
    }

    /// Returns the statements executed so far, in order.
    pub fn journal(&self) -> Vec<(TransactionId, String)> {
        self.journal.lock().clone()
    }

    /// Returns the number of streaming cursors not yet released.
    pub fn open_cursors(&self) -> u64 {
        let opened = self.stats.cursors_opened.load(Ordering::SeqCst);
        opened - self.stats.cursors_released.load(Ordering::SeqCst).min(opened)
    }

    fn enter(&self, ctx: &CallContext, txn_id: TransactionId, query: &BoundQuery) -> EngineResult<Fixture> {
        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if !txn_id.is_none() && !self.is_open(txn_id) {
            return Err(EngineError::Failed(format!("unknown transaction handle {txn_id}")));
        }
        let fixture = self
            .fixtures
            .read()
            .get(&query.sql)
            .cloned()
            .ok_or_else(|| EngineError::Failed(format!("no fixture for query: {}", query.sql)))?;
        if let Some(message) = &fixture.panic {
            panic!("{message}");
        }
        self.journal.lock().push((txn_id, query.sql.clone()));
        Ok(fixture)
    }

    fn close_txn(&self, txn_id: TransactionId) -> EngineResult<()> {
        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        if self.open_txns.lock().remove(&txn_id) {
            Ok(())
        } else {
            Err(EngineError::Failed(format!("unknown transaction handle {txn_id}")))
        }
    }
}

/// Counts a cursor as released when dropped, however the stream ended.
struct Cursor<'a> {
    stats: &'a MemoryEngineStats,
}

impl<'a> Cursor<'a> {
    fn open(stats: &'a MemoryEngineStats) -> Self {
        stats.cursors_opened.fetch_add(1, Ordering::SeqCst);
        Self { stats }
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        self.stats.cursors_released.fetch_add(1, Ordering::SeqCst);
    }
}

impl SqlEngine for MemoryEngine {
    fn begin(&self, txn_id: TransactionId) -> EngineResult<()> {
        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        if !self.open_txns.lock().insert(txn_id) {
            return Err(EngineError::Failed(format!("transaction handle {txn_id} already open")));
        }
        Ok(())
    }

    fn commit(&self, txn_id: TransactionId) -> EngineResult<()> {
        let delay = self.commit_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if let Some(message) = self.commit_error.lock().clone() {
            self.stats.calls.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::Failed(message));
        }
        self.close_txn(txn_id)?;
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(&self, txn_id: TransactionId) -> EngineResult<()> {
        self.close_txn(txn_id)?;
        self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn execute(
        &self,
        ctx: &CallContext,
        txn_id: TransactionId,
        query: &BoundQuery,
    ) -> EngineResult<QueryResult> {
        let fixture = self.enter(ctx, txn_id, query)?;
        fixture.pause();
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if fixture.error.is_some() {
            return Err(EngineError::Failed(fixture.error_message()));
        }
        Ok(fixture.to_result())
    }

    fn stream_execute(
        &self,
        ctx: &CallContext,
        txn_id: TransactionId,
        query: &BoundQuery,
        sink: &mut dyn RowSink,
    ) -> EngineResult<()> {
        let fixture = self.enter(ctx, txn_id, query)?;
        let _cursor = Cursor::open(&self.stats);

        if fixture.error.is_some() && fixture.fail_after.is_none() {
            return Err(EngineError::Failed(fixture.error_message()));
        }
        sink.fields(fixture.fields.clone())?;

        for (i, row) in fixture.rows.iter().enumerate() {
            if fixture.fail_after == Some(i) {
                return Err(EngineError::Failed(fixture.error_message()));
            }
            if ctx.is_cancelled() {
                debug!(sql = %query.sql, rows = i, "stream cancelled in engine");
                return Err(EngineError::Cancelled);
            }
            fixture.pause();
            sink.row(row.clone())?;
            self.stats.rows_streamed.fetch_add(1, Ordering::Relaxed);
        }

        if fixture.fail_after.is_some() {
            return Err(EngineError::Failed(fixture.error_message()));
        }
        Ok(())
    }

    fn table_stats(&self, table: &str) -> EngineResult<TableStats> {
        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        self.tables
            .read()
            .get(table)
            .cloned()
            .ok_or_else(|| EngineError::Failed(format!("table {table} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_proto::Value;
    use tempfile::TempDir;

    #[derive(Default)]
    struct VecSink {
        fields: Option<Vec<Field>>,
        rows: Vec<Row>,
        stop_after: Option<usize>,
    }

    impl RowSink for VecSink {
        fn fields(&mut self, fields: Vec<Field>) -> EngineResult<()> {
            self.fields = Some(fields);
            Ok(())
        }

        fn row(&mut self, row: Row) -> EngineResult<()> {
            if self.stop_after == Some(self.rows.len()) {
                return Err(EngineError::Abandoned);
            }
            self.rows.push(row);
            Ok(())
        }
    }

    fn users() -> Fixture {
        Fixture::result(
            "select id from users",
            vec![Field::new("id", 265)],
            (1..=5).map(|i| vec![Value::Int(i)]).collect(),
        )
    }

    #[test]
    fn test_execute_fixture() {
        let engine = MemoryEngine::new();
        engine.add_fixture(users());

        let ctx = CallContext::background();
        let result = engine
            .execute(&ctx, TransactionId::NONE, &BoundQuery::new("select id from users"))
            .unwrap();
        assert_eq!(result.fields.len(), 1);
        assert_eq!(result.rows.len(), 5);

        let err = engine
            .execute(&ctx, TransactionId::NONE, &BoundQuery::new("select 1"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Failed(_)));
    }

    #[test]
    fn test_transaction_handles() {
        let engine = MemoryEngine::new();
        engine.add_fixture(Fixture::dml("insert into t values (1)", 1, 1));
        let txn = TransactionId::new(7);
        let ctx = CallContext::background();
        let insert = BoundQuery::new("insert into t values (1)");

        assert!(engine.execute(&ctx, txn, &insert).is_err());
        engine.begin(txn).unwrap();
        assert!(engine.begin(txn).is_err());
        assert_eq!(engine.execute(&ctx, txn, &insert).unwrap().rows_affected, 1);
        engine.commit(txn).unwrap();
        assert!(engine.rollback(txn).is_err());
        assert!(!engine.is_open(txn));
        assert_eq!(engine.journal(), vec![(txn, "insert into t values (1)".to_string())]);
    }

    #[test]
    fn test_failed_commit_keeps_handle() {
        let engine = MemoryEngine::new();
        let txn = TransactionId::new(3);
        engine.begin(txn).unwrap();
        engine.fail_commits("disk full");

        let err = engine.commit(txn).unwrap_err();
        assert!(matches!(err, EngineError::Failed(ref m) if m == "disk full"));
        assert!(engine.is_open(txn));
        engine.rollback(txn).unwrap();
        assert!(!engine.is_open(txn));
    }

    #[test]
    fn test_stream_releases_cursor_when_abandoned() {
        let engine = MemoryEngine::new();
        engine.add_fixture(users());
        let mut sink = VecSink {
            stop_after: Some(2),
            ..VecSink::default()
        };

        let err = engine
            .stream_execute(
                &CallContext::background(),
                TransactionId::NONE,
                &BoundQuery::new("select id from users"),
                &mut sink,
            )
            .unwrap_err();
        assert_eq!(err, EngineError::Abandoned);
        assert_eq!(sink.rows.len(), 2);
        assert_eq!(engine.open_cursors(), 0);
        assert_eq!(engine.stats().cursors_released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stream_fail_after() {
        let engine = MemoryEngine::new();
        engine.add_fixture(users().fail_after(3, "disk on fire"));
        let mut sink = VecSink::default();

        let err = engine
            .stream_execute(
                &CallContext::background(),
                TransactionId::NONE,
                &BoundQuery::new("select id from users"),
                &mut sink,
            )
            .unwrap_err();
        assert_eq!(err, EngineError::Failed("disk on fire".into()));
        assert!(sink.fields.is_some());
        assert_eq!(sink.rows.len(), 3);
    }

    #[test]
    fn test_stream_early_failure_sends_nothing() {
        let engine = MemoryEngine::new();
        engine.add_fixture(Fixture::failing("select broken", "syntax error"));
        let mut sink = VecSink::default();

        let err = engine
            .stream_execute(
                &CallContext::background(),
                TransactionId::NONE,
                &BoundQuery::new("select broken"),
                &mut sink,
            )
            .unwrap_err();
        assert_eq!(err, EngineError::Failed("syntax error".into()));
        assert!(sink.fields.is_none());
    }

    #[test]
    fn test_cancelled_context() {
        let engine = MemoryEngine::new();
        engine.add_fixture(users());
        let ctx = CallContext::background();
        ctx.cancel();

        let err = engine
            .execute(&ctx, TransactionId::NONE, &BoundQuery::new("select id from users"))
            .unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
    }

    #[test]
    fn test_fixture_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fixtures.toml");

        let mut set = FixtureSet::default();
        set.queries.push(users());
        set.queries.push(Fixture::failing("select broken", "syntax error"));
        set.tables.insert(
            "users".to_string(),
            TableStats {
                key_column: "id".to_string(),
                min_key: 1,
                max_key: 5,
                row_count: 5,
            },
        );
        std::fs::write(&path, set.to_toml().unwrap()).unwrap();

        let engine = MemoryEngine::from_file(&path).unwrap();
        assert_eq!(engine.table_stats("users").unwrap().row_count, 5);
        assert!(engine.table_stats("orders").is_err());
        let result = engine
            .execute(
                &CallContext::background(),
                TransactionId::NONE,
                &BoundQuery::new("select id from users"),
            )
            .unwrap();
        assert_eq!(result.rows[4], vec![Value::Int(5)]);
    }

    #[test]
    fn test_fixture_file_hand_written() {
        let set: FixtureSet = toml::from_str(
            r#"
            [[queries]]
            sql = "select name from t"
            fields = [{ name = "name", field_type = 6165 }]
            rows = [[{ String = "a" }], [{ String = "b" }]]

            [tables.t]
            key_column = "id"
            min_key = 0
            max_key = 1000
            row_count = 2
            "#,
        )
        .unwrap();
        assert_eq!(set.queries[0].rows.len(), 2);
        assert_eq!(set.tables["t"].max_key, 1000);
    }
}
