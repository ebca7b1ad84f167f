//! End-to-end tests: client, TCP transport, tablet server and the memory
//! engine loaded from a fixture file.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tablet_client::{ClientConfig, TabletConn};
use tablet_common::constants::{SPLIT_END_BIND_VAR, SPLIT_START_BIND_VAR};
use tablet_common::error::ErrorKind;
use tablet_common::types::TransactionId;
use tablet_proto::{BoundQuery, CallContext, Field, Value};
use tablet_server::{
    Fixture, FixtureSet, MemoryEngine, RpcServer, ServerConfig, SqlEngine, StaticTopology,
    TableStats, TabletServer,
};
use tempfile::TempDir;

struct Harness {
    server: RpcServer,
    tablet: Arc<TabletServer>,
    engine: Arc<MemoryEngine>,
    _fixtures: TempDir,
}

impl Harness {
    async fn start(legacy_errors_in_reply: bool) -> Self {
        let fixtures = TempDir::new().unwrap();
        let path = fixtures.path().join("fixtures.toml");
        std::fs::write(&path, fixture_set().to_toml().unwrap()).unwrap();

        let config = ServerConfig::builder()
            .legacy_errors_in_reply(legacy_errors_in_reply)
            .stream_batch_rows(2)
            .fixtures(&path)
            .build();
        let engine = Arc::new(MemoryEngine::from_file(&path).unwrap());
        let topology = Arc::new(StaticTopology::from_config(&config).unwrap());
        let engine_dyn: Arc<dyn SqlEngine> = engine.clone();
        let tablet = Arc::new(TabletServer::new(config, engine_dyn, topology));
        let server = RpcServer::bind("127.0.0.1:0", tablet.clone(), legacy_errors_in_reply)
            .await
            .unwrap();
        Self {
            server,
            tablet,
            engine,
            _fixtures: fixtures,
        }
    }

    async fn connect(&self) -> TabletConn {
        let config = ClientConfig::new()
            .host("127.0.0.1")
            .port(self.server.local_addr().port());
        TabletConn::connect(config, "test_keyspace", "0").await.unwrap()
    }
}

fn fixture_set() -> FixtureSet {
    let mut set = FixtureSet::default();
    set.queries.push(Fixture::dml("insert into users values (:id)", 1, 42));
    set.queries.push(Fixture::result(
        "select id, name from users",
        vec![Field::new("id", 265), Field::new("name", 6165)],
        (1..=5)
            .map(|i| vec![Value::Int(i), Value::from(format!("user{i}"))])
            .collect(),
    ));
    set.queries.push(
        Fixture::result(
            "select id from events",
            vec![Field::new("id", 265)],
            (0..4).map(|i| vec![Value::Int(i)]).collect(),
        )
        .fail_after(1, "lost connection to storage"),
    );
    set.queries.push(Fixture::failing("select broken", "no such table"));
    set.queries.push(Fixture::panicking("select crash", "index out of bounds"));
    set.queries.push(
        Fixture::result(
            "select id from big",
            vec![Field::new("id", 265)],
            (0..1000).map(|i| vec![Value::Int(i)]).collect(),
        )
        .delay(Duration::from_millis(2)),
    );
    set.tables.insert(
        "users".to_string(),
        TableStats {
            key_column: "id".to_string(),
            min_key: 0,
            max_key: 999,
            row_count: 1000,
        },
    );
    set
}

#[tokio::test]
async fn test_transaction_ids_are_unique_across_sessions() {
    let harness = Harness::start(false).await;
    let a = harness.connect().await;
    let b = harness.connect().await;
    assert_ne!(a.session_id(), b.session_id());
    let ctx = CallContext::background();

    let mut seen = HashSet::new();
    for _ in 0..10 {
        for conn in [&a, &b] {
            let txn = conn.begin2(&ctx).await.unwrap();
            assert!(!txn.is_none());
            assert!(seen.insert(txn), "transaction id {txn} handed out twice");
            conn.rollback2(&ctx, txn).await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_transaction_belongs_to_its_session() {
    let harness = Harness::start(false).await;
    let owner = harness.connect().await;
    let other = harness.connect().await;
    let ctx = CallContext::background();

    let txn = owner.begin2(&ctx).await.unwrap();
    let err = other.commit2(&ctx, txn).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::SessionMismatch));
    let err = other.rollback2(&ctx, txn).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::SessionMismatch));

    owner.commit2(&ctx, txn).await.unwrap();
    let err = owner.commit2(&ctx, txn).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NotInTransaction));
}

#[tokio::test]
async fn test_autocommit_execute() {
    let harness = Harness::start(false).await;
    let conn = harness.connect().await;
    let ctx = CallContext::background();

    let query = BoundQuery::new("select id, name from users").bind("min", 1_i64);
    let result = conn.execute(&ctx, query, TransactionId::NONE).await.unwrap();
    assert_eq!(result.fields.len(), 2);
    assert_eq!(result.rows.len(), 5);
    assert_eq!(result.rows[2], vec![Value::Int(3), Value::from("user3")]);
    assert_eq!(
        harness.engine.journal(),
        vec![(TransactionId::NONE, "select id, name from users".to_string())]
    );
}

#[tokio::test]
async fn test_stream_chunk_shape() {
    let harness = Harness::start(false).await;
    let conn = harness.connect().await;
    let ctx = CallContext::background();

    let mut stream = conn
        .stream_execute2(&ctx, BoundQuery::new("select id, name from users"), TransactionId::NONE)
        .await
        .unwrap();
    let header = stream.next().await.unwrap();
    assert!(header.is_header());
    assert_eq!(header.fields.len(), 2);

    let mut rows = 0;
    while let Some(chunk) = stream.next().await {
        assert!(chunk.is_rows_only());
        assert!(chunk.rows.len() <= 2);
        rows += chunk.rows.len();
    }
    assert!(stream.is_closed());
    assert!(stream.err().is_none());
    assert_eq!(rows, 5);
}

#[tokio::test]
async fn test_abandoned_stream_releases_cursor() {
    let harness = Harness::start(false).await;
    let conn = harness.connect().await;
    let ctx = CallContext::background();

    let mut stream = conn
        .stream_execute2(&ctx, BoundQuery::new("select id from big"), TransactionId::NONE)
        .await
        .unwrap();
    assert!(stream.next().await.unwrap().is_header());
    stream.next().await.unwrap();
    drop(stream);

    for _ in 0..200 {
        if harness.engine.open_cursors() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.engine.open_cursors(), 0);
    let streamed = harness.engine.stats().rows_streamed.load(Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        harness.engine.stats().rows_streamed.load(Ordering::Relaxed),
        streamed
    );
    assert!(streamed < 1000);
    assert_eq!(harness.server.stats().cancelled.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_engine_panic_is_internal_and_server_keeps_serving() {
    let harness = Harness::start(false).await;
    let conn = harness.connect().await;
    let ctx = CallContext::background();

    let err = conn
        .execute(&ctx, BoundQuery::new("select crash"), TransactionId::NONE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Internal));
    assert!(err.to_string().contains("caught panic"), "{err}");
    assert!(err.to_string().contains("index out of bounds"), "{err}");

    let failed = conn
        .execute(&ctx, BoundQuery::new("select broken"), TransactionId::NONE)
        .await
        .unwrap_err();
    assert_eq!(failed.kind(), Some(ErrorKind::ExecutionFailed));
    assert_ne!(failed.to_string(), err.to_string());

    conn.execute(&ctx, BoundQuery::new("select id, name from users"), TransactionId::NONE)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_split_query_covers_shard() {
    let harness = Harness::start(false).await;
    let conn = harness.connect().await;
    let ctx = CallContext::background();
    let query = BoundQuery::new("select id, name from users where name != 'x'");

    let calls = harness.engine.stats().calls.load(Ordering::Relaxed);
    for count in [0, -3] {
        let err = conn.split_query(&ctx, query.clone(), count).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::InvalidArgument));
    }
    assert_eq!(harness.engine.stats().calls.load(Ordering::Relaxed), calls);

    let splits = conn.split_query(&ctx, query, 4).await.unwrap();
    assert_eq!(splits.len(), 4);
    assert_eq!(splits.iter().map(|s| s.row_count).sum::<i64>(), 1000);

    let bound = |i: usize, name: &str| splits[i].query.bind_variables.get(name).cloned();
    assert_eq!(bound(0, SPLIT_START_BIND_VAR), None);
    assert_eq!(bound(3, SPLIT_END_BIND_VAR), None);
    for i in 0..3 {
        let end = bound(i, SPLIT_END_BIND_VAR).unwrap();
        assert_eq!(bound(i + 1, SPLIT_START_BIND_VAR), Some(end));
    }
    for split in &splits {
        assert!(split.query.sql.contains("(name <> 'x')"), "{}", split.query.sql);
    }

    let err = conn
        .split_query(&ctx, BoundQuery::new("select id from users order by id"), 2)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::InvalidArgument));
}

#[tokio::test]
async fn test_insert_commit_then_reuse_fails() {
    let harness = Harness::start(false).await;
    let conn = harness.connect().await;
    let ctx = CallContext::background();

    let txn = conn.begin2(&ctx).await.unwrap();
    let insert = BoundQuery::new("insert into users values (:id)").bind("id", 7_i64);
    let result = conn.execute(&ctx, insert.clone(), txn).await.unwrap();
    assert_eq!(result.rows_affected, 1);
    assert_eq!(result.insert_id, 42);
    conn.commit2(&ctx, txn).await.unwrap();
    assert_eq!(harness.engine.stats().commits.load(Ordering::Relaxed), 1);

    let err = conn.execute(&ctx, insert, txn).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NotInTransaction));
    assert_eq!(harness.tablet.transactions().active_count(), 0);
}

#[tokio::test]
async fn test_stream_fails_after_first_row_chunk() {
    for legacy in [true, false] {
        let harness = Harness::start(legacy).await;
        let conn = harness.connect().await;
        let ctx = CallContext::background();

        for v2 in [false, true] {
            let query = BoundQuery::new("select id from events");
            let mut stream = if v2 {
                conn.stream_execute2(&ctx, query, TransactionId::NONE).await
            } else {
                conn.stream_execute(&ctx, query, TransactionId::NONE).await
            }
            .unwrap();

            assert!(stream.next().await.unwrap().is_header());
            let rows = stream.next().await.unwrap();
            assert_eq!(rows.rows, vec![vec![Value::Int(0)]]);
            assert!(stream.next().await.is_none());

            let err = stream.err().unwrap();
            assert_eq!(err.kind(), ErrorKind::ExecutionFailed);
            assert_eq!(err.to_string(), "error: lost connection to storage");
        }
    }
}

#[tokio::test]
async fn test_delivery_modes_agree() {
    let mut seen = Vec::new();
    for legacy in [true, false] {
        let harness = Harness::start(legacy).await;
        let conn = harness.connect().await;
        let ctx = CallContext::background();
        let unknown = TransactionId::new(31_337);

        let early = conn
            .stream_execute(&ctx, BoundQuery::new("select broken"), TransactionId::NONE)
            .await
            .unwrap_err();
        let early2 = conn
            .stream_execute2(&ctx, BoundQuery::new("select broken"), TransactionId::NONE)
            .await
            .unwrap_err();
        assert_eq!(early.to_string(), early2.to_string());

        let commit = conn.commit(&ctx, unknown).await.unwrap_err();
        let commit2 = conn.commit2(&ctx, unknown).await.unwrap_err();
        assert_eq!(commit.to_string(), commit2.to_string());

        seen.push((early.to_string(), commit.to_string()));
    }
    assert_eq!(seen[0], seen[1]);
    assert_eq!(seen[0].0, "error: no such table");
}
