use std::time::Duration;

use anyhow::Result;
use memnet::KvResponse;
use tokio::time::sleep;
use tokio::time::timeout;

use fixtures::harness;
use fixtures::put;

mod fixtures;

/// Coalesced connect test.
///
/// What does this test do?
///
/// - opens a client, then drops its connection.
/// - fires five submissions concurrently and asserts that exactly one transport connect
///   is issued: the first submission starts the sweep, the other four piggyback on it.
/// - asserts all five commands were served and completed successfully.
///
/// RUST_LOG=raft_client,memnet,concurrent_submits=trace cargo test -p raft-client --test concurrent_submits
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_piggyback_one_connect() -> Result<()> {
    fixtures::init_tracing();

    let h = harness().grant_timeout(60_000).build();
    h.client.open().await?;
    h.net.kill_connections();
    let before = h.net.connect_attempts();

    let mut handles = Vec::new();
    for i in 0..5 {
        let client = h.client.clone();
        let key = format!("k{}", i);
        handles.push(tokio::spawn(async move { client.submit(put(&key, "v")).await }));
    }
    for handle in handles {
        let res = handle.await.expect("submit task panicked").expect("submission failed");
        assert_eq!(res, KvResponse(None));
    }

    assert_eq!(h.net.connect_attempts() - before, 1);

    // Five distinct sequences reached the cluster, one per submission.
    let mut seqs: Vec<u64> = h.net.command_log().iter().map(|(_, seq)| *seq).collect();
    seqs.sort_unstable();
    seqs.dedup();
    assert_eq!(seqs.len(), 5);

    h.client.shutdown().await?;
    Ok(())
}

/// Submission order completion test.
///
/// What does this test do?
///
/// - slows the cluster's handling of one key so the first submission's response arrives
///   long after the second submission's response.
/// - asserts the second submission's completion is held back until the first completes:
///   submission order equals completion order even when the cluster reorders responses.
///
/// RUST_LOG=raft_client,memnet,concurrent_submits=trace cargo test -p raft-client --test concurrent_submits
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completions_fire_in_submission_order() -> Result<()> {
    fixtures::init_tracing();

    let h = harness().grant_timeout(60_000).build();
    h.client.open().await?;
    h.net.delay_key("slow", Duration::from_millis(400));

    let first = {
        let client = h.client.clone();
        tokio::spawn(async move { client.submit(put("slow", "1")).await })
    };
    sleep(Duration::from_millis(50)).await;
    let mut second = {
        let client = h.client.clone();
        tokio::spawn(async move { client.submit(put("fast", "2")).await })
    };

    // The fast response is in, but its completion must wait for the slow predecessor.
    sleep(Duration::from_millis(150)).await;
    assert_eq!(h.net.value("fast"), Some("2".to_string()));
    assert!(!second.is_finished(), "completion overtook an earlier submission");

    first.await.expect("submit task panicked").expect("first submission failed");
    let res = timeout(Duration::from_millis(500), &mut second).await;
    res.expect("second completion never fired")
        .expect("submit task panicked")
        .expect("second submission failed");

    h.client.shutdown().await?;
    Ok(())
}
