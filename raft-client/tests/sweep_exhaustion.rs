use anyhow::Result;
use memnet::Behavior;
use memnet::KvResponse;
use raft_client::ClientError;

use fixtures::harness;
use fixtures::put;

mod fixtures;

/// Sweep exhaustion test.
///
/// What does this test do?
///
/// - opens a client against a healthy three node cluster, then makes every node refuse
///   connections and drops the live connection.
/// - submits one command and asserts it fails with the connect-failed error after exactly
///   one attempt per member, holding no connection open afterwards.
/// - restores the cluster and asserts the next submission starts a fresh sweep and
///   succeeds.
///
/// RUST_LOG=raft_client,memnet,sweep_exhaustion=trace cargo test -p raft-client --test sweep_exhaustion
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn submission_fails_after_exhausted_sweep() -> Result<()> {
    fixtures::init_tracing();

    let h = harness().build();
    h.client.open().await?;

    h.net.set_all_behaviors(Behavior::Refuse);
    h.net.kill_connections();
    let before = h.net.connect_attempts();

    let err = h.client.submit(put("x", "1")).await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectFailed), "unexpected error: {:?}", err);

    // One bounded sweep: each member attempted at most once, nothing left open.
    assert_eq!(h.net.connect_attempts() - before, 3);
    assert_eq!(h.net.live_connections(), 0);

    // The failure did not touch the session; a new sweep finds the recovered cluster.
    h.net.set_all_behaviors(Behavior::Normal);
    let res = h.client.submit(put("x", "2")).await?;
    assert_eq!(res, KvResponse(None));
    assert_eq!(h.net.value("x"), Some("2".to_string()));

    h.client.shutdown().await?;
    Ok(())
}
