use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use helmsman::error::RaftError;
use helmsman::Config;
use maplit::btreeset;

use fixtures::RaftRouter;

mod fixtures;

/// Joint-consensus membership change from {1,2,3} to {3,4,5}.
///
/// What does this test do?
///
/// - adds nodes 4 and 5 as passive members-to-be, but keeps them partitioned away.
/// - proposes the membership change and asserts that nothing commits while only the old
///   majority is reachable: the joint phase requires majorities of both member sets.
/// - heals the partition and asserts the change completes, the cluster converges on the new
///   member set, and a leader from the new set serves writes.
///
/// RUST_LOG=helmsman,memstore,joint_membership=trace cargo test -p helmsman --test joint_membership
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn joint_phase_requires_majorities_of_both_configs() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    for id in 1..=3u64 {
        router.new_raft_node(id, btreeset![1, 2, 3]).await;
    }
    let leader = router.wait_for_leader(Duration::from_millis(config.election_timeout_max * 4)).await?;
    router.wait_for_applied(&btreeset![1, 2, 3], 1, Some(Duration::from_secs(5)), "initial entry").await?;

    // Nodes 4 and 5 come up outside the active config (passive), and are immediately cut off.
    for id in 4..=5u64 {
        router.new_raft_node(id, btreeset![1, 2, 3]).await;
        router.isolate_node(id).await;
    }

    let applied_before = router.wait(&leader, None).await?.rx.borrow().last_applied;

    // Propose the change. With 4 and 5 unreachable the new set {3,4,5} can muster only one
    // of three members, so neither the joint entry nor anything after it may commit.
    let change_err = router
        .change_membership(leader, btreeset![3, 4, 5], Duration::from_secs(1))
        .await
        .expect_err("membership change must not commit without a majority of the new set");
    assert_eq!(change_err, RaftError::Timeout);

    let write_err = router
        .client_request(leader, "joint", "blocked", Duration::from_secs(1))
        .await
        .expect_err("a write must not commit under joint rules with the new set unreachable");
    assert_eq!(write_err, RaftError::Timeout);

    // Nothing moved: a majority of the old set alone does not decide during the joint phase.
    let applied_now = router.wait(&leader, None).await?.rx.borrow().last_applied;
    assert_eq!(applied_now, applied_before, "no entry may commit during the blocked joint phase");

    // Heal the new members. The in-flight change now completes: the joint entry, the final
    // config entry, and the buffered write all commit under joint rules.
    for id in 4..=5u64 {
        router.restore_node(id).await;
    }

    let new_members: BTreeSet<u64> = btreeset![3, 4, 5];
    for id in new_members.iter() {
        router
            .wait_for_metrics(
                id,
                |m| m.membership_config.members == btreeset![3, 4, 5] && !m.membership_config.is_in_joint_consensus(),
                Some(Duration::from_secs(15)),
                &format!("n{} adopted final config", id),
            )
            .await?;
    }

    // A leader from the new member set eventually serves writes; the old leader (1 or 2)
    // steps down once the final config commits.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    let new_leader = loop {
        if let Some(leader) = router.leader().await {
            if new_members.contains(&leader) {
                break leader;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("no leader from the new member set emerged");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    router
        .client_request(new_leader, "after-change", "ok", Duration::from_secs(5))
        .await
        .expect("write to the reconfigured cluster failed");
    router.assert_state_machines_converged(&new_members).await;

    Ok(())
}
