//! Drives a client through every method of a [`FakeQueryService`].
//!
//! The suite runs in three passes over the same connection: every call
//! succeeding, every call failing with the scripted error, every call
//! panicking. A transport passes when each pass sees exactly what the fake
//! produced, whichever way errors travel on the wire.

use tablet_client::{ClientResult, TabletConn};
use tablet_proto::{CallContext, QueryStream};
use tracing::info;

use crate::fake::{
    batch_queries, batch_results, execute_query, execute_result, split_query, split_result,
    stream_header, stream_query, stream_rows, FakeQueryService, BEGIN_TRANSACTION_ID,
    BATCH_TRANSACTION_ID, COMMIT_TRANSACTION_ID, EXECUTE_TRANSACTION_ID, EXPECTED_ERROR,
    ROLLBACK_TRANSACTION_ID, SPLIT_COUNT, STREAM_TRANSACTION_ID,
};

/// Fragment every contained panic carries.
const PANIC_MATCH: &str = "caught panic";

/// Runs the whole suite. Panics on the first failed expectation.
pub async fn run_suite(conn: &TabletConn, fake: &FakeQueryService) {
    info!(session_id = %conn.session_id(), "conformance suite: success pass");
    test_begin(conn).await;
    test_commit(conn).await;
    test_rollback(conn).await;
    test_execute(conn).await;
    test_stream_execute(conn, Version::V1).await;
    test_stream_execute(conn, Version::V2).await;
    test_execute_batch(conn).await;
    test_split_query(conn).await;

    info!("conformance suite: error pass");
    fake.set_has_error(true);
    test_begin_error(conn).await;
    test_commit_error(conn).await;
    test_rollback_error(conn).await;
    test_execute_error(conn).await;
    test_stream_execute_error(conn, fake, Version::V1).await;
    test_stream_execute_error(conn, fake, Version::V2).await;
    test_execute_batch_error(conn).await;
    test_split_query_error(conn).await;
    fake.set_has_error(false);

    info!("conformance suite: panic pass");
    fake.set_panics(true);
    test_begin_panics(conn).await;
    test_commit_panics(conn).await;
    test_rollback_panics(conn).await;
    test_execute_panics(conn).await;
    test_stream_execute_panics(conn, fake, Version::V1).await;
    test_stream_execute_panics(conn, fake, Version::V2).await;
    test_execute_batch_panics(conn).await;
    test_split_query_panics(conn).await;
    fake.set_panics(false);

    let mismatches = fake.mismatches();
    assert!(mismatches.is_empty(), "fake saw bad arguments: {mismatches:#?}");
}

#[derive(Debug, Clone, Copy)]
enum Version {
    V1,
    V2,
}

fn expect_err<T: std::fmt::Debug>(method: &str, result: ClientResult<T>, fragment: &str) {
    match result {
        Ok(value) => panic!("{method} was expecting an error, got {value:?}"),
        Err(e) => assert!(
            e.to_string().contains(fragment),
            "unexpected error from {method}: got {e}, wanted one containing {fragment:?}"
        ),
    }
}

async fn open_stream(conn: &TabletConn, version: Version) -> ClientResult<QueryStream> {
    let ctx = CallContext::background();
    match version {
        Version::V1 => conn.stream_execute(&ctx, stream_query(), STREAM_TRANSACTION_ID).await,
        Version::V2 => conn.stream_execute2(&ctx, stream_query(), STREAM_TRANSACTION_ID).await,
    }
}

// =============================================================================
// Success pass
// =============================================================================

async fn test_begin(conn: &TabletConn) {
    let ctx = CallContext::background();
    assert_eq!(conn.begin(&ctx).await.expect("Begin failed"), BEGIN_TRANSACTION_ID);
    assert_eq!(conn.begin2(&ctx).await.expect("Begin2 failed"), BEGIN_TRANSACTION_ID);
}

async fn test_commit(conn: &TabletConn) {
    let ctx = CallContext::background();
    conn.commit(&ctx, COMMIT_TRANSACTION_ID).await.expect("Commit failed");
    conn.commit2(&ctx, COMMIT_TRANSACTION_ID).await.expect("Commit2 failed");
}

async fn test_rollback(conn: &TabletConn) {
    let ctx = CallContext::background();
    conn.rollback(&ctx, ROLLBACK_TRANSACTION_ID).await.expect("Rollback failed");
    conn.rollback2(&ctx, ROLLBACK_TRANSACTION_ID).await.expect("Rollback2 failed");
}

async fn test_execute(conn: &TabletConn) {
    let ctx = CallContext::background();
    let result = conn
        .execute(&ctx, execute_query(), EXECUTE_TRANSACTION_ID)
        .await
        .expect("Execute failed");
    assert_eq!(result, execute_result());
}

async fn test_stream_execute(conn: &TabletConn, version: Version) {
    let mut stream = open_stream(conn, version)
        .await
        .unwrap_or_else(|e| panic!("StreamExecute {version:?} failed: {e}"));
    assert_eq!(stream.next().await, Some(stream_header()));
    assert_eq!(stream.next().await, Some(stream_rows()));
    assert_eq!(stream.next().await, None, "stream wasn't closed");
    assert!(stream.err().is_none(), "stream failed: {:?}", stream.err());
}

async fn test_execute_batch(conn: &TabletConn) {
    let ctx = CallContext::background();
    let results = conn
        .execute_batch(&ctx, batch_queries(), BATCH_TRANSACTION_ID)
        .await
        .expect("ExecuteBatch failed");
    assert_eq!(results, batch_results());
}

async fn test_split_query(conn: &TabletConn) {
    let ctx = CallContext::background();
    let splits = conn
        .split_query(&ctx, split_query(), SPLIT_COUNT)
        .await
        .expect("SplitQuery failed");
    assert_eq!(splits, split_result());
}

// =============================================================================
// Error pass
// =============================================================================

async fn test_begin_error(conn: &TabletConn) {
    let ctx = CallContext::background();
    expect_err("Begin", conn.begin(&ctx).await, EXPECTED_ERROR);
    expect_err("Begin2", conn.begin2(&ctx).await, EXPECTED_ERROR);
}

async fn test_commit_error(conn: &TabletConn) {
    let ctx = CallContext::background();
    expect_err("Commit", conn.commit(&ctx, COMMIT_TRANSACTION_ID).await, EXPECTED_ERROR);
    expect_err("Commit2", conn.commit2(&ctx, COMMIT_TRANSACTION_ID).await, EXPECTED_ERROR);
}

async fn test_rollback_error(conn: &TabletConn) {
    let ctx = CallContext::background();
    expect_err("Rollback", conn.rollback(&ctx, ROLLBACK_TRANSACTION_ID).await, EXPECTED_ERROR);
    expect_err("Rollback2", conn.rollback2(&ctx, ROLLBACK_TRANSACTION_ID).await, EXPECTED_ERROR);
}

async fn test_execute_error(conn: &TabletConn) {
    let ctx = CallContext::background();
    let result = conn.execute(&ctx, execute_query(), EXECUTE_TRANSACTION_ID).await;
    expect_err("Execute", result, EXPECTED_ERROR);
}

async fn test_stream_execute_error(conn: &TabletConn, fake: &FakeQueryService, version: Version) {
    let mut stream = open_stream(conn, version)
        .await
        .unwrap_or_else(|e| panic!("StreamExecute {version:?} failed: {e}"));
    assert_eq!(stream.next().await, Some(stream_header()));
    fake.error_gate().open();

    assert_eq!(stream.next().await, None, "stream wasn't closed");
    let err = stream.err().expect("stream was expecting an error");
    assert!(err.to_string().contains(EXPECTED_ERROR), "unexpected stream error: {err}");
    fake.error_gate().reset();
}

async fn test_execute_batch_error(conn: &TabletConn) {
    let ctx = CallContext::background();
    let result = conn.execute_batch(&ctx, batch_queries(), BATCH_TRANSACTION_ID).await;
    expect_err("ExecuteBatch", result, EXPECTED_ERROR);
}

async fn test_split_query_error(conn: &TabletConn) {
    let ctx = CallContext::background();
    let result = conn.split_query(&ctx, split_query(), SPLIT_COUNT).await;
    expect_err("SplitQuery", result, EXPECTED_ERROR);
}

// =============================================================================
// Panic pass
// =============================================================================

async fn test_begin_panics(conn: &TabletConn) {
    let ctx = CallContext::background();
    expect_err("Begin", conn.begin(&ctx).await, PANIC_MATCH);
    expect_err("Begin2", conn.begin2(&ctx).await, PANIC_MATCH);
}

async fn test_commit_panics(conn: &TabletConn) {
    let ctx = CallContext::background();
    expect_err("Commit", conn.commit(&ctx, COMMIT_TRANSACTION_ID).await, PANIC_MATCH);
    expect_err("Commit2", conn.commit2(&ctx, COMMIT_TRANSACTION_ID).await, PANIC_MATCH);
}

async fn test_rollback_panics(conn: &TabletConn) {
    let ctx = CallContext::background();
    expect_err("Rollback", conn.rollback(&ctx, ROLLBACK_TRANSACTION_ID).await, PANIC_MATCH);
    expect_err("Rollback2", conn.rollback2(&ctx, ROLLBACK_TRANSACTION_ID).await, PANIC_MATCH);
}

async fn test_execute_panics(conn: &TabletConn) {
    let ctx = CallContext::background();
    let result = conn.execute(&ctx, execute_query(), EXECUTE_TRANSACTION_ID).await;
    expect_err("Execute", result, PANIC_MATCH);
}

async fn test_stream_execute_panics(conn: &TabletConn, fake: &FakeQueryService, version: Version) {
    // Before the first chunk the panic fails the call itself, or at the
    // latest closes the stream empty.
    fake.set_stream_panics_early(true);
    match open_stream(conn, version).await {
        Err(e) => assert!(e.to_string().contains(PANIC_MATCH), "unexpected panic error: {e}"),
        Ok(mut stream) => {
            assert_eq!(stream.next().await, None, "early panic should not return anything");
            let err = stream.err().expect("stream was expecting an error");
            assert!(err.to_string().contains(PANIC_MATCH), "unexpected panic error: {err}");
        }
    }

    // After the first chunk it shows up as the terminal error.
    fake.set_stream_panics_early(false);
    let mut stream = open_stream(conn, version)
        .await
        .unwrap_or_else(|e| panic!("StreamExecute {version:?} failed: {e}"));
    assert_eq!(stream.next().await, Some(stream_header()));
    fake.panic_gate().open();
    assert_eq!(stream.next().await, None, "stream returned more results");
    let err = stream.err().expect("stream was expecting an error");
    assert!(err.to_string().contains(PANIC_MATCH), "unexpected panic error: {err}");
    fake.panic_gate().reset();
}

async fn test_execute_batch_panics(conn: &TabletConn) {
    let ctx = CallContext::background();
    let result = conn.execute_batch(&ctx, batch_queries(), BATCH_TRANSACTION_ID).await;
    expect_err("ExecuteBatch", result, PANIC_MATCH);
}

async fn test_split_query_panics(conn: &TabletConn) {
    let ctx = CallContext::background();
    let result = conn.split_query(&ctx, split_query(), SPLIT_COUNT).await;
    expect_err("SplitQuery", result, PANIC_MATCH);
}
