use anyhow::Result;
use memnet::Behavior;
use memnet::KvResponse;
use raft_client::Lifecycle;

use fixtures::addr;
use fixtures::harness;
use fixtures::put;

mod fixtures;

/// Leader discovery test.
///
/// What does this test do?
///
/// - brings up a three node cluster whose leader is the second member.
/// - opens a client seeded in configuration order, so its first handshake lands on a
///   non-leader which reports the real leader.
/// - asserts that the submission is served by the leader: the selector adopted the
///   handshake's view and the client reconnected before dispatching.
///
/// RUST_LOG=raft_client,memnet,leader_failover=trace cargo test -p raft-client --test leader_failover
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn submission_follows_the_learned_leader() -> Result<()> {
    fixtures::init_tracing();

    let h = harness().leader(addr(5002)).build();
    h.client.open().await?;
    h.client
        .wait(None)
        .lifecycle(Lifecycle::Open, "client open")
        .await?;

    let res = h.client.submit(put("x", "1")).await?;
    assert_eq!(res, KvResponse(None));

    let log = h.net.command_log();
    let (served_at, _) = log.last().cloned().expect("no command was served");
    assert_eq!(served_at, addr(5002));

    h.client.shutdown().await?;
    Ok(())
}

/// Mid-flight leader loss test.
///
/// What does this test do?
///
/// - opens a client against a cluster led by the second member.
/// - moves leadership to the third member while the old leader stops answering.
/// - submits one command and asserts it completes exactly once with the OK result:
///   the client failed over, learned the new leader from a handshake, and resubmitted
///   the request under its original sequence.
///
/// RUST_LOG=raft_client,memnet,leader_failover=trace cargo test -p raft-client --test leader_failover
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn command_survives_leader_loss() -> Result<()> {
    fixtures::init_tracing();

    let h = harness().leader(addr(5002)).build();
    h.client.open().await?;

    h.net.set_leader(Some(addr(5003)));
    h.net.set_behavior(&addr(5002), Behavior::Refuse);

    let res = h.client.submit(put("x", "1")).await?;
    assert_eq!(res, KvResponse(None));
    assert_eq!(h.net.value("x"), Some("1".to_string()));

    // Every retry carried the original sequence, and the new leader served the last one.
    let log = h.net.command_log();
    assert!(!log.is_empty());
    let seqs: Vec<u64> = log.iter().map(|(_, seq)| *seq).collect();
    assert!(seqs.iter().all(|seq| *seq == seqs[0]), "sequence changed across retries: {:?}", seqs);
    let (served_at, _) = log.last().cloned().expect("no command was served");
    assert_eq!(served_at, addr(5003));

    h.client.shutdown().await?;
    Ok(())
}
