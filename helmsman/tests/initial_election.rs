use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use helmsman::Config;
use helmsman::State;
use maplit::btreeset;

use fixtures::parse_kv_state;
use fixtures::RaftRouter;

mod fixtures;

/// Single-node cluster initial election.
///
/// What does this test do?
///
/// - brings one node online as the only member of its cluster.
/// - asserts that it elects itself leader of term 1 within one election timeout window.
/// - writes a command and performs a linearizable read of the resulting state.
///
/// RUST_LOG=helmsman,memstore,initial_election=trace cargo test -p helmsman --test initial_election
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initial_election_single_node() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_raft_node(1, btreeset![1]).await;

    // The node must take leadership within roughly one election timeout.
    let election_window = Duration::from_millis(config.election_timeout_max * 2);
    let metrics = router
        .wait_for_metrics(&1, |m| m.state == State::Leader, Some(election_window), "n1.state -> Leader")
        .await?;
    assert_eq!(metrics.current_term, 1, "single node cluster should elect itself in term 1");

    // The initial config entry committed on leadership acquisition.
    router.wait_for_applied(&btreeset![1], 1, None, "initial entry applied").await?;

    // Submit a command and read it back linearizably.
    let response = router.client_request(1, "x", "1", Duration::from_secs(5)).await.expect("client write failed");
    assert_eq!(response, b"1".to_vec());

    let state = router.read_state(1, Duration::from_secs(5)).await.expect("linearizable read failed");
    let map = parse_kv_state(&state);
    assert_eq!(map.get("x").map(String::as_str), Some("1"));

    // The self-vote of term 1 must have been persisted (never re-grantable after restart).
    router.assert_hard_state(1, 1, Some(1)).await;

    Ok(())
}

/// Three-node cluster initial election.
///
/// What does this test do?
///
/// - brings three voters online with a common cluster config.
/// - asserts exactly one leader emerges within two election timeout windows and the cluster
///   stabilizes with every node in the same term.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initial_election_three_nodes() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    for id in 1..=3u64 {
        router.new_raft_node(id, btreeset![1, 2, 3]).await;
    }

    let election_window = Duration::from_millis(config.election_timeout_max * 4);
    let leader = router.wait_for_leader(election_window).await?;
    assert!((1..=3).contains(&leader));

    // The leader's initial entry must reach every member.
    router.wait_for_applied(&btreeset![1, 2, 3], 1, Some(Duration::from_secs(5)), "initial entry").await?;
    router.assert_stable_cluster(None, None).await;

    // At most one leader per term: every node agrees on the leader and the term.
    let metrics = router.latest_metrics().await;
    let leaders: Vec<_> = metrics.iter().filter(|m| m.state == State::Leader).collect();
    assert_eq!(leaders.len(), 1, "expected exactly one leader, got {:?}", leaders);

    Ok(())
}
