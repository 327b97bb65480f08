use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use helmsman::Config;
use maplit::btreeset;

use fixtures::RaftRouter;

mod fixtures;

/// Log convergence after a network partition heals.
///
/// What does this test do?
///
/// - commits a first batch of entries on a three-node cluster.
/// - partitions one follower away, then commits a second batch on the remaining majority.
/// - heals the partition and asserts that the lagging node converges to the majority's log
///   and state machine.
///
/// RUST_LOG=helmsman,memstore,partition_recovery=trace cargo test -p helmsman --test partition_recovery
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partitioned_follower_converges_after_heal() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    for id in 1..=3u64 {
        router.new_raft_node(id, btreeset![1, 2, 3]).await;
    }

    let leader = router.wait_for_leader(Duration::from_millis(config.election_timeout_max * 4)).await?;

    // First batch, committed cluster-wide.
    router.client_request_many(leader, "before", 5).await;
    let applied_before = 1 + 5;
    router
        .wait_for_applied(&btreeset![1, 2, 3], applied_before, Some(Duration::from_secs(5)), "first batch")
        .await?;

    // Partition one follower away from the majority.
    let victim = (1..=3u64).find(|id| *id != leader).unwrap();
    router.isolate_node(victim).await;

    // Second batch still commits on the remaining majority.
    router.client_request_many(leader, "during", 5).await;
    let majority: std::collections::BTreeSet<u64> = (1..=3).filter(|id| *id != victim).collect();
    let applied_during = applied_before + 5;
    router
        .wait_for_applied(&majority, applied_during, Some(Duration::from_secs(5)), "second batch on majority")
        .await?;

    // The victim has seen none of it.
    let victim_metrics = router.wait(&victim, None).await?.rx.borrow().clone();
    assert!(
        victim_metrics.last_applied < applied_during,
        "partitioned node must not observe majority-only commits"
    );

    // Heal. The victim may have driven its term up while campaigning alone; the cluster
    // re-stabilizes and replication brings it up to date.
    router.restore_node(victim).await;
    let leader = router.wait_for_leader(Duration::from_secs(10)).await?;
    router
        .wait_for_applied(&btreeset![1, 2, 3], applied_during, Some(Duration::from_secs(10)), "victim caught up")
        .await?;

    router.assert_logs_converged(&btreeset![1, 2, 3]).await;
    router.assert_state_machines_converged(&btreeset![1, 2, 3]).await;

    // And the cluster is still writable end-to-end.
    router.client_request(leader, "after", "1", Duration::from_secs(5)).await.expect("write after heal failed");
    router
        .wait_for_applied(&btreeset![1, 2, 3], applied_during + 1, Some(Duration::from_secs(10)), "write after heal")
        .await?;

    Ok(())
}
