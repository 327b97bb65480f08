use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use helmsman::Config;
use helmsman::SnapshotPolicy;
use maplit::btreeset;

use fixtures::RaftRouter;

mod fixtures;

/// Snapshot creation and chunked installation on a lagging follower.
///
/// What does this test do?
///
/// - isolates one follower, then writes enough entries that the leader compacts its log
///   behind a snapshot, purging the prefix the follower would need.
/// - heals the partition and asserts the follower is brought current through InstallSnapshot
///   chunks (32 bytes each) followed by normal replication.
///
/// RUST_LOG=helmsman,memstore,snapshot_install=trace cargo test -p helmsman --test snapshot_install
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_follower_is_restored_via_snapshot_chunks() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(
        Config::build("test".into())
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(50))
            .snapshot_max_chunk_size(32)
            .validate()
            .expect("failed to build Raft config"),
    );
    let router = Arc::new(RaftRouter::new(config.clone()));

    for id in 1..=3u64 {
        router.new_raft_node(id, btreeset![1, 2, 3]).await;
    }

    let leader = router.wait_for_leader(Duration::from_millis(config.election_timeout_max * 4)).await?;
    router.wait_for_applied(&btreeset![1, 2, 3], 1, Some(Duration::from_secs(5)), "initial entry").await?;

    // Cut one follower off before the log grows.
    let victim = (1..=3u64).find(|id| *id != leader).unwrap();
    router.isolate_node(victim).await;

    // Blow past the compaction threshold on the live majority.
    let count = 60usize;
    router.client_request_many(leader, "bulk", count).await;
    let want_applied = 1 + count as u64;
    let majority: std::collections::BTreeSet<u64> = (1..=3).filter(|id| *id != victim).collect();
    router.wait_for_applied(&majority, want_applied, Some(Duration::from_secs(10)), "bulk writes").await?;

    // The leader must have compacted: its snapshot covers at least the threshold.
    router
        .wait_for_metrics(
            &leader,
            |m| m.snapshot.index >= 50,
            Some(Duration::from_secs(10)),
            "leader snapshot taken",
        )
        .await?;

    // Heal. The follower's needed prefix is gone from the leader's log, so it must be
    // restored through chunked snapshot installation, then catch up the remaining suffix.
    router.restore_node(victim).await;
    router
        .wait_for_metrics(
            &victim,
            |m| m.snapshot.index >= 50,
            Some(Duration::from_secs(15)),
            "victim received snapshot",
        )
        .await?;
    router
        .wait_for_applied(&btreeset![victim], want_applied, Some(Duration::from_secs(15)), "victim caught up")
        .await?;

    // The follower's state machine equals the leader's.
    router.assert_state_machines_converged(&btreeset![1, 2, 3]).await;

    let victim_kv = router.get_kv_handle(&victim).await?;
    assert_eq!(victim_kv.get("bulk-0").await.as_deref(), Some("0"));
    assert_eq!(victim_kv.get(&format!("bulk-{}", count - 1)).await.as_deref(), Some(&*(count - 1).to_string()));

    Ok(())
}
