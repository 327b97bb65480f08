//! Raft metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The `Wait` utility is a handy
//! way for tests and integration code to await a specific cluster condition instead of
//! sleeping for arbitrary durations.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::core::State;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::membership::MembershipConfig;
use crate::replication::ReplicationMetrics;
use crate::LogId;
use crate::NodeId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index to be appended to this Raft node's log.
    pub last_log_index: u64,
    /// The last log index to be applied to this Raft node's state machine.
    pub last_applied: u64,
    /// The current cluster leader.
    pub current_leader: Option<NodeId>,
    /// The current membership config of the cluster.
    pub membership_config: MembershipConfig,
    /// The id of the last entry covered by the node's snapshot, `0-0` if none exists.
    pub snapshot: LogId,
    /// The metrics about the leader. It is Some() only when this node is leader.
    pub leader_metrics: Option<LeaderMetrics>,
}

/// The metrics about the leader. It is Some() only when this node is leader.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderMetrics {
    /// Replication metrics of all known replication target. Leaving a Leader removes it.
    pub replication: BTreeMap<NodeId, ReplicationMetrics>,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config: MembershipConfig::new_initial(id),
            snapshot: LogId::default(),
            leader_metrics: None,
        }
    }
}

// Error variants related to metrics are folded into the crate taxonomy: an expired wait is
// `RaftError::Timeout`, a closed metrics channel is `RaftError::ShuttingDown`.

/// Wait for metrics to satisfy some condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for metrics to satisfy some condition or timeout.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg))]
    pub async fn metrics<T>(&self, func: T, msg: &str) -> RaftResult<RaftMetrics>
    where T: Fn(&RaftMetrics) -> bool + Send {
        let timeout_at = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            tracing::debug!("id={} wait metrics: {}", latest.id, msg);
            if func(&latest) {
                return Ok(latest);
            }

            tokio::select! {
                _ = sleep_until(timeout_at) => {
                    tracing::debug!("id={} timeout waiting for metrics: {}", latest.id, msg);
                    return Err(RaftError::Timeout);
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(RaftError::ShuttingDown);
                    }
                }
            }
        }
    }

    /// Wait for `last_log_index` and `last_applied` to reach exactly `want_log`.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg))]
    pub async fn log(&self, want_log: u64, msg: &str) -> RaftResult<RaftMetrics> {
        self.metrics(
            |x| x.last_log_index == want_log,
            &format!("{} .last_log_index -> {}", msg, want_log),
        )
        .await?;
        self.metrics(
            |x| x.last_applied == want_log,
            &format!("{} .last_applied -> {}", msg, want_log),
        )
        .await
    }

    /// Wait for `last_applied` to reach at least `want_log`.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg))]
    pub async fn applied_at_least(&self, want_log: u64, msg: &str) -> RaftResult<RaftMetrics> {
        self.metrics(
            |x| x.last_applied >= want_log,
            &format!("{} .last_applied >= {}", msg, want_log),
        )
        .await
    }

    /// Wait for the node to reach the given state.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg))]
    pub async fn state(&self, want_state: State, msg: &str) -> RaftResult<RaftMetrics> {
        self.metrics(
            |x| x.state == want_state,
            &format!("{} .state -> {:?}", msg, want_state),
        )
        .await
    }

    /// Wait for `current_leader` to become `Some(leader_id)`.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg))]
    pub async fn current_leader(&self, leader_id: NodeId, msg: &str) -> RaftResult<RaftMetrics> {
        self.metrics(
            |x| x.current_leader == Some(leader_id),
            &format!("{} .current_leader -> {}", msg, leader_id),
        )
        .await
    }

    /// Wait for the node's snapshot to cover the given log id.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg))]
    pub async fn snapshot(&self, want: LogId, msg: &str) -> RaftResult<RaftMetrics> {
        self.metrics(|x| x.snapshot == want, &format!("{} .snapshot -> {}", msg, want)).await
    }
}
