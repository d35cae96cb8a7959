use anyhow::Result;
use memnet::Behavior;
use memnet::KvResponse;
use raft_client::ClientError;
use raft_client::Lifecycle;

use fixtures::get;
use fixtures::harness;
use fixtures::put;

mod fixtures;

/// Lifecycle state error test.
///
/// What does this test do?
///
/// - asserts a submission against a client that was never opened is rejected with the
///   not-open error, and one against a closed client with the closed error.
///
/// RUST_LOG=raft_client,memnet,session_lifecycle=trace cargo test -p raft-client --test session_lifecycle
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn submissions_require_an_open_session() -> Result<()> {
    fixtures::init_tracing();

    let h = harness().build();
    let res = h.client.submit(put("x", "1")).await;
    assert!(matches!(res, Err(ClientError::NotOpen)), "unexpected result: {:?}", res);

    h.client.open().await?;
    h.client.close().await?;
    let res = h.client.submit(put("x", "1")).await;
    assert!(matches!(res, Err(ClientError::Closed)), "unexpected result: {:?}", res);

    h.client.shutdown().await?;
    Ok(())
}

/// Open coalescing test.
///
/// What does this test do?
///
/// - fires two opens concurrently and asserts both succeed while only one session is
///   registered with the cluster.
/// - asserts a repeated open on the already open client is a no-op.
///
/// RUST_LOG=raft_client,memnet,session_lifecycle=trace cargo test -p raft-client --test session_lifecycle
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn concurrent_opens_share_one_registration() -> Result<()> {
    fixtures::init_tracing();

    let h = harness().build();
    let first = {
        let client = h.client.clone();
        tokio::spawn(async move { client.open().await })
    };
    let second = {
        let client = h.client.clone();
        tokio::spawn(async move { client.open().await })
    };
    first.await.expect("open task panicked")?;
    second.await.expect("open task panicked")?;

    assert_eq!(h.net.session_count(), 1);
    assert!(h.client.is_open());

    h.client.open().await?;
    assert_eq!(h.net.session_count(), 1);

    h.client.shutdown().await?;
    Ok(())
}

/// Graceful close test.
///
/// What does this test do?
///
/// - opens a client, submits a command, then closes.
/// - asserts the close unregistered the session with the cluster, released the
///   connection, and is idempotent.
/// - asserts a subsequent open starts a fresh session that works.
///
/// RUST_LOG=raft_client,memnet,session_lifecycle=trace cargo test -p raft-client --test session_lifecycle
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn close_unregisters_and_reopen_starts_fresh() -> Result<()> {
    fixtures::init_tracing();

    let h = harness().build();
    h.client.open().await?;
    let first_session = h.client.session().expect("session must be open");
    h.client.submit(put("x", "1")).await?;

    h.client.close().await?;
    assert!(h.client.is_closed());
    assert_eq!(h.net.session_count(), 0);

    // The connection release is asynchronous; give it a beat before asserting.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(h.net.live_connections(), 0);

    h.client.close().await?;

    h.client.open().await?;
    let second_session = h.client.session().expect("session must be open");
    assert_ne!(first_session.session_id, second_session.session_id);

    let res = h.client.submit(put("x", "2")).await?;
    assert_eq!(res, KvResponse(Some("1".to_string())));
    let res = h.client.submit(get("x")).await?;
    assert_eq!(res, KvResponse(Some("2".to_string())));

    h.client.shutdown().await?;
    Ok(())
}

/// Open failure test.
///
/// What does this test do?
///
/// - attempts to open against a cluster where every member refuses connections.
/// - asserts the open fails with connect-failed after one full sweep and leaves the
///   client reusable: once the cluster recovers, open succeeds.
///
/// RUST_LOG=raft_client,memnet,session_lifecycle=trace cargo test -p raft-client --test session_lifecycle
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn open_fails_cleanly_when_no_server_is_reachable() -> Result<()> {
    fixtures::init_tracing();

    let h = harness().build();
    h.net.set_all_behaviors(Behavior::Refuse);

    let res = h.client.open().await;
    assert!(matches!(res, Err(ClientError::ConnectFailed)), "unexpected result: {:?}", res);
    assert!(!h.client.is_open());
    assert_eq!(h.net.live_connections(), 0);

    h.net.set_all_behaviors(Behavior::Normal);
    h.client.open().await?;
    assert!(h.client.is_open());
    assert_eq!(h.client.lifecycle(), Lifecycle::Open);

    h.client.shutdown().await?;
    Ok(())
}
