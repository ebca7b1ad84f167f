//! Runs the conformance suite over the TCP transport.

use std::sync::Arc;

use tablet_client::{ClientConfig, TabletConn};
use tablet_proto::CallContext;
use tablet_server::RpcServer;
use tablet_test::{run_suite, FakeQueryService, TEST_KEYSPACE, TEST_SHARD};

async fn run_over_tcp(legacy_errors_in_reply: bool) {
    let fake = Arc::new(FakeQueryService::new());
    let server = RpcServer::bind("127.0.0.1:0", fake.clone(), legacy_errors_in_reply)
        .await
        .unwrap();
    let config = ClientConfig::new()
        .host("127.0.0.1")
        .port(server.local_addr().port());
    let conn = TabletConn::connect(config, TEST_KEYSPACE, TEST_SHARD)
        .await
        .unwrap();

    run_suite(&conn, &fake).await;

    conn.close(&CallContext::background()).await.unwrap();
    server.shutdown().await;
    assert!(fake.mismatches().is_empty());
}

#[tokio::test]
async fn test_tcp_errors_in_reply() {
    run_over_tcp(true).await;
}

#[tokio::test]
async fn test_tcp_errors_as_call_failures() {
    run_over_tcp(false).await;
}

#[tokio::test]
async fn test_server_survives_panics() {
    let fake = Arc::new(FakeQueryService::new());
    let server = RpcServer::bind("127.0.0.1:0", fake.clone(), false)
        .await
        .unwrap();
    let config = ClientConfig::new()
        .host("127.0.0.1")
        .port(server.local_addr().port());
    let conn = TabletConn::connect(config, TEST_KEYSPACE, TEST_SHARD)
        .await
        .unwrap();
    let ctx = CallContext::background();

    fake.set_panics(true);
    for _ in 0..3 {
        let err = conn.begin2(&ctx).await.unwrap_err();
        assert!(err.tablet_error().is_some_and(|e| e.is_caught_panic()), "{err}");
    }
    fake.set_panics(false);

    // The server survived and the connection is still usable.
    conn.begin2(&ctx).await.unwrap();
}
