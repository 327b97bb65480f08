use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use helmsman::error::RaftError;
use helmsman::Config;
use maplit::btreeset;

use fixtures::parse_kv_state;
use fixtures::RaftRouter;

mod fixtures;

/// Client write replication across a three-node cluster.
///
/// What does this test do?
///
/// - brings a three-node cluster online and writes a batch of commands to the leader.
/// - asserts that every node applies the same entries in the same order, and that logs and
///   state machines are byte-identical across the cluster.
/// - asserts that followers reject writes and reads with a leader hint.
///
/// RUST_LOG=helmsman,memstore,client_writes=trace cargo test -p helmsman --test client_writes
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_writes_replicate_to_all_nodes() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    for id in 1..=3u64 {
        router.new_raft_node(id, btreeset![1, 2, 3]).await;
    }

    let leader = router.wait_for_leader(Duration::from_millis(config.election_timeout_max * 4)).await?;

    let count = 10usize;
    router.client_request_many(leader, "key", count).await;

    // Initial config entry + the writes.
    let want_applied = 1 + count as u64;
    router
        .wait_for_applied(&btreeset![1, 2, 3], want_applied, Some(Duration::from_secs(5)), "writes applied")
        .await?;

    router.assert_stable_cluster(None, Some(want_applied)).await;
    router.assert_logs_converged(&btreeset![1, 2, 3]).await;
    router.assert_state_machines_converged(&btreeset![1, 2, 3]).await;

    // A linearizable read from the leader observes all writes.
    let state = router.read_state(leader, Duration::from_secs(5)).await.expect("read_state failed");
    let map = parse_kv_state(&state);
    assert_eq!(map.len(), count);
    assert_eq!(map.get("key-0").map(String::as_str), Some("0"));

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn followers_reject_writes_and_reads_with_leader_hint() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    for id in 1..=3u64 {
        router.new_raft_node(id, btreeset![1, 2, 3]).await;
    }

    let leader = router.wait_for_leader(Duration::from_millis(config.election_timeout_max * 4)).await?;
    router.wait_for_applied(&btreeset![1, 2, 3], 1, Some(Duration::from_secs(5)), "initial entry").await?;

    let follower = (1..=3u64).find(|id| *id != leader).unwrap();

    let write_err = router
        .client_request(follower, "x", "1", Duration::from_secs(1))
        .await
        .expect_err("follower accepted a write");
    match write_err {
        RaftError::NotLeader { leader_hint } => assert_eq!(leader_hint, Some(leader)),
        other => panic!("expected NotLeader, got {:?}", other),
    }

    let read_err = router
        .read_state(follower, Duration::from_secs(1))
        .await
        .expect_err("follower served a linearizable read");
    assert!(matches!(read_err, RaftError::NotLeader { .. }), "expected NotLeader, got {:?}", read_err);

    Ok(())
}
