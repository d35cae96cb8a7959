use std::time::Duration;

use anyhow::Result;
use memnet::Behavior;
use raft_client::ClientError;
use raft_client::Lifecycle;

use fixtures::harness;
use fixtures::put;

mod fixtures;

/// Session expiration test.
///
/// What does this test do?
///
/// - opens a client against a cluster granting a 500ms session timeout, so keep-alives
///   fire every 250ms.
/// - black-holes the whole cluster: in-flight requests hang and reconnects never finish.
/// - asserts the session expires once keep-alives have failed for longer than the granted
///   timeout: three pending submissions all fail with the session-expired error, the
///   event subscription ends, and a subsequent submission is rejected as not open.
///
/// RUST_LOG=raft_client,memnet,session_expiration=trace cargo test -p raft-client --test session_expiration
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn blackholed_cluster_expires_the_session() -> Result<()> {
    fixtures::init_tracing();

    let h = harness().grant_timeout(500).build();
    h.client.open().await?;
    let mut events = h.client.on_event("change").await?;

    h.net.set_all_behaviors(Behavior::BlackHole);

    let mut handles = Vec::new();
    for i in 0..3 {
        let client = h.client.clone();
        let key = format!("k{}", i);
        handles.push(tokio::spawn(async move { client.submit(put(&key, "v")).await }));
    }

    h.client
        .wait(Some(Duration::from_secs(3)))
        .lifecycle(Lifecycle::Expired, "session expired")
        .await?;

    for handle in handles {
        let res = handle.await.expect("submit task panicked");
        assert!(
            matches!(res, Err(ClientError::SessionExpired)),
            "pending submission must fail with session-expired: {:?}",
            res
        );
    }

    // The subscription ended exactly once, with the expiration.
    assert_eq!(events.recv().await, None);

    let res = h.client.submit(put("late", "v")).await;
    assert!(matches!(res, Err(ClientError::NotOpen)), "unexpected result: {:?}", res);

    h.client.shutdown().await?;
    Ok(())
}

/// Unknown session test.
///
/// What does this test do?
///
/// - opens a client, then makes the cluster forget the session, as it would after
///   expiring it server-side.
/// - asserts the next submission observes the unknown-session error and the client
///   transitions to expired rather than retrying.
///
/// RUST_LOG=raft_client,memnet,session_expiration=trace cargo test -p raft-client --test session_expiration
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn unknown_session_expires_the_session() -> Result<()> {
    fixtures::init_tracing();

    let h = harness().build();
    h.client.open().await?;
    let session = h.client.session().expect("session must be open");
    h.net.forget_session(session.session_id);

    let res = h.client.submit(put("x", "1")).await;
    assert!(matches!(res, Err(ClientError::SessionExpired)), "unexpected result: {:?}", res);
    assert_eq!(h.client.lifecycle(), Lifecycle::Expired);

    h.client.shutdown().await?;
    Ok(())
}
