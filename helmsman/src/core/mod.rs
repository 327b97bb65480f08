//! The core logic of a Raft node.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::AbortHandle;
use futures::future::Abortable;
use futures::stream::FuturesOrdered;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::collect;
use crate::completion::Completion;
use crate::completion::Resolver;
use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::core::client::ClientRequestEntry;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::executor::Executor;
use crate::membership::MembershipConfig;
use crate::metrics::LeaderMetrics;
use crate::metrics::RaftMetrics;
use crate::raft::EntryPayload;
use crate::raft::RaftMsg;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::state_machine::FatalStateMachineError;
use crate::state_machine::StateMachine;
use crate::storage::HardState;
use crate::storage::Persistence;
use crate::storage::Snapshot;
use crate::store::LogStore;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftTransport;
use crate::Update;

/// The core type implementing the Raft protocol.
///
/// All volatile protocol state lives here and is mutated only by the single spawned core
/// task; I/O and continuations happen outside of it on the executor and on helper tasks.
pub struct RaftCore<N: RaftTransport, P: Persistence, M: StateMachine> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster's current membership configuration.
    membership: MembershipConfig,
    /// The `RaftTransport` implementation.
    network: Arc<N>,
    /// The `Persistence` implementation.
    storage: Arc<P>,
    /// The application `StateMachine` implementation.
    state_machine: Arc<M>,
    /// The executor for user-facing completion continuations and collectors.
    executor: Executor,
    /// The in-memory index over the persisted log suffix and snapshot boundary.
    log: LogStore<P>,

    /// The target state of the system.
    target_state: State,

    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// A log is committed once the leader which created it has replicated it to a majority of
    /// the cluster (joint-aware). Followers learn the value through the AppendEntries
    /// protocol. Initialized to 0 on startup; a restarted node re-learns it from the leader,
    /// as it is unsafe to assume any other value.
    commit_index: u64,
    /// The log id of the highest log entry which has been applied to the local state machine.
    last_applied: LogId,

    /// The current term.
    ///
    /// Is initialized to 0 on first boot, and increases monotonically. This is normally based
    /// on the leader's term which is communicated to other members via the AppendEntries
    /// protocol, but this may also be incremented when a follower becomes a candidate.
    current_term: u64,
    /// The ID of the current leader of the Raft cluster.
    current_leader: Option<NodeId>,
    /// The ID of the candidate which received this node's vote for the current term.
    ///
    /// Each server will vote for at most one candidate in a given term, on a
    /// first-come-first-served basis. See §5.4.1 for additional restriction on votes.
    voted_for: Option<NodeId>,

    /// The node's current snapshot state.
    snapshot_state: Option<SnapshotState>,
    /// Response channels of replication streams waiting for a snapshot to be generated.
    pending_snapshot_waiters: Vec<oneshot::Sender<Snapshot>>,

    /// The stream of join handles from state machine replication tasks. There will only ever
    /// be a maximum of 1 element at a time.
    ///
    /// This abstraction is needed to ensure that replicating to the state machine does not
    /// block the AppendEntries RPC flow.
    replicate_to_sm_handle: FuturesOrdered<JoinHandle<anyhow::Result<Option<LogId>>>>,

    /// The last time a heartbeat was received.
    last_heartbeat: Option<Instant>,
    /// The duration until the next election timeout.
    next_election_timeout: Option<Instant>,

    tx_compaction: mpsc::Sender<SnapshotUpdate>,
    rx_compaction: mpsc::Receiver<SnapshotUpdate>,

    rx_api: mpsc::UnboundedReceiver<(RaftMsg, Span)>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<N: RaftTransport, P: Persistence, M: StateMachine> RaftCore<N, P, M> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<P>,
        state_machine: Arc<M>,
        executor: Executor,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        tokio::spawn(
            async move {
                let log = match LogStore::load(storage.clone()).await {
                    Ok(log) => log,
                    Err(err) => {
                        tracing::error!(error=%err, id, "failed to rebuild log store from storage");
                        return Err(RaftError::corrupt(err.to_string()));
                    }
                };
                let (tx_compaction, rx_compaction) = mpsc::channel(1);
                let this = Self {
                    id,
                    config,
                    membership: MembershipConfig::new_initial(id),
                    network,
                    storage,
                    state_machine,
                    executor,
                    log,
                    target_state: State::Follower,
                    commit_index: 0,
                    last_applied: LogId { term: 0, index: 0 },
                    current_term: 0,
                    current_leader: None,
                    voted_for: None,
                    snapshot_state: None,
                    pending_snapshot_waiters: Vec::new(),
                    replicate_to_sm_handle: FuturesOrdered::new(),
                    last_heartbeat: None,
                    next_election_timeout: None,
                    tx_compaction,
                    rx_compaction,
                    rx_api,
                    tx_metrics,
                    rx_shutdown,
                };
                this.main().await
            }
            .instrument(tracing::debug_span!("spawn")),
        )
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");

        let state = self.storage.get_initial_state().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.membership = state.membership;
        self.last_applied = state.last_applied_log;
        // NOTE: it is unsafe to initialize the node's commit index to any persisted value; the
        // commit index must be re-learned from a leader after it commits a new log.
        self.commit_index = 0;

        // Voters wait out an election timeout before campaigning; everyone else stays passive.
        self.target_state = if self.membership.contains(&self.id) {
            State::Follower
        } else {
            State::NonVoter
        };
        if self.target_state == State::Follower {
            self.update_next_election_timeout(false);
        }

        tracing::debug!("id={} target_state: {:?}", self.id, self.target_state);

        // This is the central loop of the system. The Raft core assumes a few different roles
        // based on cluster state. The Raft core will delegate control to the different state
        // controllers and simply awaits the delegated loop to return, which will only take
        // place if some error has been encountered, or if a state change is required.
        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::NonVoter => NonVoterState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!("node has shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Report a metrics payload on the current state of the Raft node.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self, leader_metrics: Update<Option<&LeaderMetrics>>) {
        let leader_metrics = match leader_metrics {
            Update::Update(v) => v.cloned(),
            Update::Ignore => self.tx_metrics.borrow().leader_metrics.clone(),
        };

        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.log.last_log_id().index,
            last_applied: self.last_applied.index,
            current_leader: self.current_leader,
            membership_config: self.membership.clone(),
            snapshot: self.log.snapshot_last_log_id(),
            leader_metrics,
        });

        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Save the Raft node's current hard state to disk.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update core's target state, ensuring all invariants are upheld.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, target_state: State) {
        if target_state == State::Follower && !self.membership.contains(&self.id) {
            self.target_state = State::NonVoter;
        } else {
            self.target_state = target_state;
        }
    }

    /// Get the next election timeout, generating a new value if not set.
    #[tracing::instrument(level = "trace", skip(self))]
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                tracing::debug!("create election timeout after: {:?}", t);
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a value for the next election timeout.
    ///
    /// If `heartbeat=true`, then also update the value of `last_heartbeat`.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();

        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        tracing::debug!("update election timeout after: {:?}", t);

        self.next_election_timeout = Some(now + t);
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Force the election timer to read as expired. Test hook.
    #[tracing::instrument(level = "trace", skip(self))]
    fn force_election_timeout(&mut self) {
        self.next_election_timeout = Some(Instant::now());
    }

    /// Update the value of the `current_leader` property.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => {
                self.current_leader = Some(self.id);
            }
            UpdateCurrentLeader::OtherNode(target) => {
                self.current_leader = Some(target);
            }
            UpdateCurrentLeader::Unknown => {
                self.current_leader = None;
            }
        }
    }

    /// Encapsulate the process of updating the current term, as updating the `voted_for` state must also be updated.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable error from the storage layer.
    ///
    /// A storage error observed here is non-recoverable: the node cannot uphold its
    /// durability promises, so it stops rather than risk divergence.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!({error=?err, id=self.id}, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::ShuttingDown
    }

    /// Update the node's current membership config.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_membership(&mut self, cfg: MembershipConfig) -> RaftResult<()> {
        // If the given config does not contain this node's ID, it means one of the following:
        //
        // - the node is currently a non-voter and is replicating an old config to which it has
        // not yet been added.
        // - the node has been removed from the cluster. The parent application can observe the
        // transition to the non-voter state as a signal for when it is safe to shutdown a node
        // being removed.
        self.membership = cfg;
        if !self.membership.contains(&self.id) {
            self.set_target_state(State::NonVoter);
        } else if self.target_state == State::NonVoter && self.membership.contains(&self.id) {
            // The node was a NonVoter and the new config counts it as a member. Transition to
            // follower.
            self.set_target_state(State::Follower);
        }
        Ok(())
    }

    /// Apply a single committed entry to the state machine, returning its response bytes.
    ///
    /// A `BadCommand` rejection still consumes the entry: the commit stands and `last_applied`
    /// advances. A fatal state machine error shuts the node down.
    #[tracing::instrument(level = "trace", skip(self, entry), fields(entry=%entry.summary()))]
    async fn apply_entry_to_state_machine(&mut self, entry: &crate::raft::Entry) -> RaftResult<Vec<u8>> {
        let res = match &entry.payload {
            EntryPayload::Normal(data) => match self.state_machine.apply(entry.log_id, data).await {
                Ok(bytes) => Ok(bytes),
                Err(err) => {
                    if err.downcast_ref::<FatalStateMachineError>().is_some() {
                        self.set_target_state(State::Shutdown);
                        Err(RaftError::ShuttingDown)
                    } else {
                        Err(RaftError::BadCommand {
                            message: err.to_string(),
                        })
                    }
                }
            },
            EntryPayload::Blank | EntryPayload::ConfigChange(_) => Ok(Vec::new()),
        };
        if !matches!(res, Err(RaftError::ShuttingDown)) {
            self.last_applied = entry.log_id;
        }
        res
    }

    /// Await the in-flight background apply task, if any, folding its progress in.
    ///
    /// Inline applies must not overlap with the background task, or entries would reach the
    /// state machine twice. This is an edge case which only comes up in the first moments of
    /// a new leader's term.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn drain_replicate_to_sm(&mut self) -> RaftResult<()> {
        while let Some(res) = self.replicate_to_sm_handle.next().await {
            match res {
                Ok(task_res) => {
                    let last_applied = task_res.map_err(|err| self.map_fatal_storage_error(err))?;
                    if let Some(last_applied) = last_applied {
                        if last_applied > self.last_applied {
                            self.last_applied = last_applied;
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(error=%err, "background apply task failed to join");
                }
            }
        }
        Ok(())
    }

    /// Apply all committed-but-unapplied entries up through `upto`, inline on the core task.
    ///
    /// Per-entry rejections are logged and skipped; only fatal errors propagate.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn apply_outstanding_upto(&mut self, upto: u64) -> RaftResult<()> {
        self.drain_replicate_to_sm().await?;
        while self.last_applied.index < upto {
            let lo = self.last_applied.index + 1;
            let entries = self.log.entries(lo, upto + 1);
            if entries.is_empty() {
                break;
            }
            for entry in entries.iter() {
                if let Err(err) = self.apply_entry_to_state_machine(entry).await {
                    if matches!(err, RaftError::ShuttingDown) {
                        return Err(err);
                    }
                    tracing::error!(error=%err, index=entry.log_id.index, "state machine rejected committed entry");
                }
            }
        }
        Ok(())
    }

    /// Spawn a background task replicating committed entries to the state machine.
    ///
    /// At most one such task runs at a time; when it finishes, its result flows back through
    /// `replicate_to_sm_handle` and a follow-up task is spawned if the node is still behind.
    #[tracing::instrument(level = "trace", skip(self))]
    fn replicate_to_state_machine_if_needed(&mut self) {
        if !self.replicate_to_sm_handle.is_empty() {
            return;
        }
        if self.last_applied.index >= self.commit_index {
            return;
        }
        let storage = self.storage.clone();
        let state_machine = self.state_machine.clone();
        let start = self.last_applied.index + 1;
        let stop = self.commit_index + 1;
        let handle = tokio::spawn(
            async move {
                let entries = storage.get_log_entries(start..stop).await?;
                let mut last_applied = None;
                for entry in entries {
                    if let EntryPayload::Normal(data) = &entry.payload {
                        if let Err(err) = state_machine.apply(entry.log_id, data).await {
                            if err.downcast_ref::<FatalStateMachineError>().is_some() {
                                return Err(err);
                            }
                            tracing::error!(error=%err, index=entry.log_id.index, "state machine rejected committed entry");
                        }
                    }
                    last_applied = Some(entry.log_id);
                }
                Ok(last_applied)
            }
            .instrument(tracing::debug_span!("replicate-to-sm")),
        );
        self.replicate_to_sm_handle.push(handle);
    }

    /// Handle the output of an async task replicating entries to the state machine.
    #[tracing::instrument(level = "trace", skip(self, res))]
    async fn handle_replicate_to_sm_result(&mut self, res: anyhow::Result<Option<LogId>>) -> RaftResult<()> {
        let last_applied_opt = res.map_err(|err| self.map_fatal_storage_error(err))?;

        tracing::debug!("last_applied: {:?}", last_applied_opt);

        if let Some(last_applied) = last_applied_opt {
            if last_applied > self.last_applied {
                self.last_applied = last_applied;
            }
        }

        self.report_metrics(Update::Ignore);
        self.trigger_log_compaction_if_needed(false).await;
        self.replicate_to_state_machine_if_needed();
        Ok(())
    }

    /// Trigger a log compaction (snapshot) job if needed.
    /// If force is True, it will skip the threshold check and start creating snapshot as demanded.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn trigger_log_compaction_if_needed(&mut self, force: bool) {
        if self.snapshot_state.is_some() {
            return;
        }
        // The state is captured on the core task, so it must be quiescent with respect to the
        // background apply task to describe a single log position.
        if !self.replicate_to_sm_handle.is_empty() {
            return;
        }
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        if self.last_applied.index == 0 || self.last_applied.index < self.log.snapshot_last_log_id().index {
            return;
        }
        if !force && self.last_applied.index < self.log.snapshot_last_log_id().index + *threshold {
            return;
        }

        let state = match self.state_machine.get_state().await {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(error=%err, "error capturing state machine for snapshot");
                return;
            }
        };
        let snapshot = Snapshot {
            meta: crate::storage::SnapshotMeta {
                last_log_id: self.last_applied,
                membership: self.membership.clone(),
            },
            data: state,
        };

        let storage = self.storage.clone();
        let (handle, reg) = AbortHandle::new_pair();
        let tx_compaction = self.tx_compaction.clone();
        self.snapshot_state = Some(SnapshotState::Snapshotting { handle });
        tokio::spawn(
            async move {
                let boundary = snapshot.meta.last_log_id;
                let res = Abortable::new(async { storage.save_snapshot(&snapshot).await }, reg).await;
                match res {
                    Ok(Ok(())) => {
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotComplete(boundary));
                    }
                    Ok(Err(err)) => {
                        tracing::error!({error=%err}, "error while generating snapshot");
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                    }
                    Err(_aborted) => {
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                    }
                }
            }
            .instrument(tracing::debug_span!("log-compaction")),
        );
    }

    /// Update the system's snapshot state based on the given data.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn update_snapshot_state(&mut self, update: SnapshotUpdate) {
        if let SnapshotUpdate::SnapshotComplete(log_id) = update {
            if let Err(err) = self.log.compact(log_id).await {
                let _ = self.map_fatal_storage_error(err);
                return;
            }
            if !self.pending_snapshot_waiters.is_empty() {
                match self.storage.load_snapshot().await {
                    Ok(Some(snapshot)) => {
                        for tx in self.pending_snapshot_waiters.drain(..) {
                            let _ = tx.send(snapshot.clone());
                        }
                    }
                    Ok(None) => tracing::error!("snapshot reported complete but none found in storage"),
                    Err(err) => {
                        let _ = self.map_fatal_storage_error(err);
                        return;
                    }
                }
            }
            self.report_metrics(Update::Ignore);
        }
        // If snapshot state is anything other than streaming, then drop it.
        if let Some(state @ SnapshotState::Streaming { .. }) = self.snapshot_state.take() {
            self.snapshot_state = Some(state);
        }
    }

    /// Hand the current snapshot to a replication stream, generating one first if needed.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    async fn respond_with_snapshot(&mut self, tx: oneshot::Sender<Snapshot>) {
        match self.storage.load_snapshot().await {
            Ok(Some(snapshot)) => {
                let _ = tx.send(snapshot);
            }
            Ok(None) => {
                self.pending_snapshot_waiters.push(tx);
                self.trigger_log_compaction_if_needed(true).await;
            }
            Err(err) => {
                let _ = self.map_fatal_storage_error(err);
            }
        }
    }

    /// Reject a request due to the Raft node being in a state which prohibits the request.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn reject_config_change_not_leader(&self, tx: Resolver<u64>) {
        let _ = tx.fail(RaftError::NotLeader {
            leader_hint: self.current_leader,
        });
    }

    /// Forward the given client write request to the leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn forward_client_write_request(&self, tx: Resolver<Vec<u8>>) {
        let _ = tx.fail(RaftError::NotLeader {
            leader_hint: self.current_leader,
        });
    }

    /// Forward the given client read request to the leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn forward_client_read_request(&self, tx: Resolver<Vec<u8>>) {
        let _ = tx.fail(RaftError::NotLeader {
            leader_hint: self.current_leader,
        });
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

/// The current snapshot state of the Raft node.
pub(self) enum SnapshotState {
    /// The Raft node is compacting itself.
    Snapshotting {
        /// A handle to abort the compaction process early if needed.
        handle: AbortHandle,
    },
    /// The Raft node is streaming in a snapshot from the leader.
    Streaming {
        /// The number of snapshot bytes received so far.
        offset: u64,
        /// The log id the incoming snapshot covers through.
        last_included: LogId,
        /// The membership carried by the incoming snapshot.
        membership: MembershipConfig,
        /// The scratch buffer accumulating the snapshot bytes.
        buf: Vec<u8>,
    },
}

/// An update on a snapshot creation process.
#[derive(Debug)]
pub(self) enum SnapshotUpdate {
    /// Snapshot creation has finished successfully and covers the given index.
    SnapshotComplete(LogId),
    /// Snapshot creation failed.
    SnapshotFailed,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is completely passive; replicating entries, but neither voting nor timing out.
    NonVoter,
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The Raft node is shutting down.
    Shutdown,
}

impl State {
    /// Check if currently in non-voter state.
    pub fn is_non_voter(&self) -> bool {
        matches!(self, Self::NonVoter)
    }

    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the Raft leader.
pub(self) struct LeaderState<'a, N: RaftTransport, P: Persistence, M: StateMachine> {
    pub(super) core: &'a mut RaftCore<N, P, M>,
    /// A mapping of node IDs to the replication state of the target node.
    pub(super) nodes: BTreeMap<NodeId, ReplicationState>,
    /// A bool indicating if this node will be stepping down after committing the current config change.
    pub(super) is_stepping_down: bool,

    /// The metrics about a leader.
    pub leader_metrics: LeaderMetrics,

    /// The stream of events coming from replication streams.
    pub(super) replication_rx: mpsc::UnboundedReceiver<(ReplicaEvent, Span)>,
    /// The cloneable sender channel for replication stream events.
    pub(super) replication_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,

    /// A buffer of client requests which have been appended locally and are awaiting to be committed to the cluster.
    pub(super) awaiting_committed: Vec<ClientRequestEntry>,

    /// A field tracking the cluster's current consensus state, which is used for dynamic membership.
    pub(super) consensus_state: ConsensusState,
}

impl<'a, N: RaftTransport, P: Persistence, M: StateMachine> LeaderState<'a, N, P, M> {
    /// Create a new instance.
    pub(self) fn new(core: &'a mut RaftCore<N, P, M>) -> Self {
        let consensus_state = if core.membership.is_in_joint_consensus() {
            ConsensusState::Joint { is_committed: false }
        } else {
            ConsensusState::Uniform
        };
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            is_stepping_down: false,
            leader_metrics: LeaderMetrics::default(),
            replication_tx,
            replication_rx,
            awaiting_committed: Vec::new(),
            consensus_state,
        }
    }

    /// Transition to the Raft leader state.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Spawn replication streams.
        let targets = self
            .core
            .membership
            .all_nodes()
            .into_iter()
            .filter(|elem| elem != &self.core.id)
            .collect::<Vec<_>>();

        for target in targets {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }

        // Setup state as leader.
        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.leader_report_metrics();

        // Per §8, commit an initial entry as part of becoming the cluster leader.
        self.commit_initial_leader_entry().await?;

        loop {
            if !self.core.target_state.is_leader() {
                tracing::info!("id={} state becomes: {:?}", self.core.id, self.core.target_state);

                for node in self.nodes.values() {
                    let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                }
                // Fail any requests still awaiting commitment; a later leader may still commit
                // the underlying entries, but this node can no longer answer for them.
                for req in self.awaiting_committed.drain(..) {
                    req.tx.reject(RaftError::LeadershipLost {
                        term: self.core.current_term,
                    });
                }
                return Ok(());
            }

            let span = tracing::debug_span!("CHrx:LeaderState");
            let _ent = span.enter();

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.resolve(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.resolve(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot{rpc, tx} => {
                            let _ = tx.resolve(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::ClientRead{tx} => {
                            self.handle_client_read_request(tx).await;
                        }
                        RaftMsg::ClientWrite{command, tx} => {
                            self.handle_client_write_request(command, tx).await;
                        }
                        RaftMsg::ChangeMembership{members, tx} => {
                            self.change_membership(members, tx).await;
                        }
                        RaftMsg::CheckElectionTimeout => {
                            // Leaders have no election timer.
                        }
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => {
                    self.core.update_snapshot_state(update).await;
                }
                Some((event, span)) = self.replication_rx.recv() => {
                    let _ent = span.enter();
                    tracing::debug!("leader recv from replication_rx: {}", event.summary());
                    self.handle_replica_event(event).await?;
                }
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    // Errors herein will trigger shutdown, so no need to process error.
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result).await;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    tracing::info!("leader recv from rx_shutdown");
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }

    /// Report metrics with leader specific states.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn leader_report_metrics(&mut self) {
        self.core.report_metrics(Update::Update(Some(&self.leader_metrics)));
    }

    /// Spawn a replication stream for the target peer.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_replication_stream(&self, target: NodeId) -> ReplicationState {
        let replstream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.log.last_log_id(),
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: self.core.log.last_log_id(),
            remove_after_commit: None,
            replstream,
        }
    }

    /// Handle an event coming from a replication stream.
    #[tracing::instrument(level = "trace", skip(self, event), fields(event=%event.summary()))]
    async fn handle_replica_event(&mut self, event: ReplicaEvent) -> RaftResult<()> {
        match event {
            ReplicaEvent::UpdateMatchIndex { target, matched } => {
                self.handle_update_match_index(target, matched).await;
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                if term > self.core.current_term {
                    tracing::debug!(target, term, "reverting to follower due to greater term observed in replication");
                    self.core.update_current_term(term, None);
                    self.core.save_hard_state().await?;
                    self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                    self.core.set_target_state(State::Follower);
                }
            }
            ReplicaEvent::NeedsSnapshot { target: _, tx } => {
                self.core.respond_with_snapshot(tx).await;
            }
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
            }
        }
        Ok(())
    }

    /// Handle a matched-index update from a replication stream, advancing the commit index
    /// when a quorum of the cluster (joint-aware) holds the entry and it belongs to the
    /// current term.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_update_match_index(&mut self, target: NodeId, matched: LogId) {
        if let Some(state) = self.nodes.get_mut(&target) {
            state.matched = matched;
            self.leader_metrics.replication.insert(target, crate::replication::ReplicationMetrics { matched });
        }

        // Drop replication streams for removed nodes which have caught up far enough.
        if let Some(state) = self.nodes.get(&target) {
            if let Some(threshold) = state.remove_after_commit {
                if matched.index >= threshold {
                    if let Some(node) = self.nodes.remove(&target) {
                        let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                        self.leader_metrics.replication.remove(&target);
                    }
                }
            }
        }

        let new_commit = self.calc_commit_index();
        if new_commit > self.core.commit_index {
            self.core.commit_index = new_commit;
            for node in self.nodes.values() {
                let _ = node.replstream.repl_tx.send((
                    RaftEvent::UpdateCommitIndex {
                        commit_index: new_commit,
                    },
                    tracing::debug_span!("CH"),
                ));
            }
            self.process_committed_entries().await;
        }
        self.leader_report_metrics();
    }

    /// The highest index which a cluster quorum holds in the current term, per §5.4.2.
    ///
    /// Entries from earlier terms are never counted directly; they ride along once the first
    /// current-term entry (at minimum the leader's no-op) reaches quorum.
    fn calc_commit_index(&self) -> u64 {
        let mut candidates: Vec<u64> = self.nodes.values().map(|node| node.matched.index).collect();
        candidates.push(self.core.log.last_log_id().index);
        candidates.sort_unstable();
        candidates.dedup();

        for idx in candidates.into_iter().rev() {
            if idx <= self.core.commit_index {
                break;
            }
            if self.core.log.term_of(idx) != Some(self.core.current_term) {
                continue;
            }
            let mut agreed: BTreeSet<NodeId> = self
                .nodes
                .iter()
                .filter(|(_, state)| state.matched.index >= idx)
                .map(|(id, _)| *id)
                .collect();
            agreed.insert(self.core.id);
            if self.core.membership.majority_satisfied(&agreed) {
                return idx;
            }
        }
        self.core.commit_index
    }

    /// Complete all awaiting client requests whose entries are now committed.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn process_committed_entries(&mut self) {
        while let Some(first) = self.awaiting_committed.first() {
            if first.entry.log_id.index > self.core.commit_index {
                break;
            }
            let req = self.awaiting_committed.remove(0);
            self.client_request_post_commit(req).await;
        }
    }
}

/// A struct tracking the state of a replication stream from the perspective of the Raft actor.
pub(self) struct ReplicationState {
    pub matched: LogId,
    pub remove_after_commit: Option<u64>,
    pub replstream: ReplicationStream,
}

/// A state enum used by Raft leaders to navigate the joint consensus protocol.
pub(self) enum ConsensusState {
    /// The cluster is in a joint consensus state.
    Joint {
        /// A bool indicating if the associated joint config has been committed yet.
        is_committed: bool,
    },
    /// The cluster consensus is uniform; not in a joint consensus state.
    Uniform,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
pub(self) struct CandidateState<'a, N: RaftTransport, P: Persistence, M: StateMachine> {
    core: &'a mut RaftCore<N, P, M>,
}

impl<'a, N: RaftTransport, P: Persistence, M: StateMachine> CandidateState<'a, N, P, M> {
    pub(self) fn new(core: &'a mut RaftCore<N, P, M>) -> Self {
        Self { core }
    }

    /// Run the candidate loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Each iteration of the outer loop represents a new term.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // Setup new term.
            self.core.update_next_election_timeout(false); // Generates a new rand value within range.
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.report_metrics(Update::Update(None));

            // Send RPCs to all members and gather the grants through the joint-majority
            // collector; our own vote is the seed.
            let mut pending_votes = Some(self.spawn_parallel_vote_requests());

            // Inner processing loop for this Raft state.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                let span = tracing::debug_span!("CHrx:CandidateState");
                let _ent = span.enter();

                tokio::select! {
                    // This election has timed-out. Break to outer loop, which starts a new term.
                    _ = timeout_fut => break,
                    res = async { pending_votes.as_mut().unwrap().await }, if pending_votes.is_some() => {
                        pending_votes = None;
                        self.handle_vote_results(res).await?;
                    }
                    Some((msg, span)) = self.core.rx_api.recv() => {
                        let _ent = span.enter();
                        match msg {
                            RaftMsg::AppendEntries{rpc, tx} => {
                                let _ = tx.resolve(self.core.handle_append_entries_request(rpc).await);
                            }
                            RaftMsg::RequestVote{rpc, tx} => {
                                let _ = tx.resolve(self.core.handle_vote_request(rpc).await);
                            }
                            RaftMsg::InstallSnapshot{rpc, tx} => {
                                let _ = tx.resolve(self.core.handle_install_snapshot_request(rpc).await);
                            }
                            RaftMsg::ClientRead{tx} => {
                                self.core.forward_client_read_request(tx);
                            }
                            RaftMsg::ClientWrite{tx, ..} => {
                                self.core.forward_client_write_request(tx);
                            }
                            RaftMsg::ChangeMembership{tx, ..} => {
                                self.core.reject_config_change_not_leader(tx);
                            }
                            RaftMsg::CheckElectionTimeout => {
                                self.core.force_election_timeout();
                            }
                        }
                    },
                    Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update).await,
                    Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                        // Errors herein will trigger shutdown, so no need to process error.
                        let _ = self.core.handle_replicate_to_sm_result(repl_sm_result).await;
                    }
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }

    /// Broadcast RequestVote RPCs, returning a collector over the tallied grants.
    ///
    /// Denied votes are mapped to `ElectionFailed` failures carrying the responder's term so
    /// that only grants count toward the quorums.
    #[tracing::instrument(level = "trace", skip(self))]
    fn spawn_parallel_vote_requests(
        &self,
    ) -> Completion<Vec<(NodeId, RaftResult<VoteResponse>)>> {
        let last_log_id = self.core.log.last_log_id();
        let rpc_timeout = Duration::from_millis(self.core.config.election_timeout_min);

        let mut inputs = Vec::new();
        for target in self.core.membership.all_nodes().into_iter().filter(|id| id != &self.core.id) {
            let rpc = VoteRequest::new(self.core.current_term, self.core.id, last_log_id.index, last_log_id.term);
            let vote = self.core.network.vote(target, rpc, rpc_timeout).then_try(
                |res: RaftResult<VoteResponse>| -> RaftResult<VoteResponse> {
                    match res {
                        Ok(resp) if resp.vote_granted => Ok(resp),
                        Ok(resp) => Err(RaftError::ElectionFailed { term: resp.term }),
                        Err(err) => Err(err),
                    }
                },
            );
            inputs.push((target, vote));
        }

        collect::joint_majority(
            &self.core.membership.members,
            self.core.membership.members_after_consensus.as_ref(),
            inputs,
            &[self.core.id],
            None,
            &self.core.executor,
        )
    }

    /// Tally the collector's verdict: step down on a higher term, take leadership on a joint
    /// quorum of grants, otherwise wait out the election timer.
    #[tracing::instrument(level = "trace", skip(self, res))]
    async fn handle_vote_results(
        &mut self,
        res: RaftResult<Vec<(NodeId, RaftResult<VoteResponse>)>>,
    ) -> RaftResult<()> {
        let results = match res {
            Ok(results) => results,
            Err(err) => {
                tracing::debug!(error=%err, "vote collection failed");
                return Ok(());
            }
        };

        let mut max_seen_term = self.core.current_term;
        let mut granted: BTreeSet<NodeId> = [self.core.id].iter().copied().collect();
        for (peer, res) in results {
            match res {
                Ok(_resp) => {
                    granted.insert(peer);
                }
                Err(RaftError::ElectionFailed { term }) => {
                    max_seen_term = max_seen_term.max(term);
                }
                Err(err) => {
                    tracing::debug!(peer, error=%err, "error from vote request");
                }
            }
        }

        if max_seen_term > self.core.current_term {
            tracing::debug!({ candidate = self.core.id }, "revert to follower due to greater term observed in RequestVote RPC response");
            self.core.update_current_term(max_seen_term, None);
            self.core.update_next_election_timeout(false);
            self.core.save_hard_state().await?;
            self.core.set_target_state(State::Follower);
            return Ok(());
        }

        if self.core.membership.majority_satisfied(&granted) {
            tracing::debug!("transitioning to leader state as minimum number of votes have been received");
            self.core.set_target_state(State::Leader);
        }
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
pub(self) struct FollowerState<'a, N: RaftTransport, P: Persistence, M: StateMachine> {
    core: &'a mut RaftCore<N, P, M>,
}

impl<'a, N: RaftTransport, P: Persistence, M: StateMachine> FollowerState<'a, N, P, M> {
    pub(self) fn new(core: &'a mut RaftCore<N, P, M>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics(Update::Update(None));
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            // Value is updated as heartbeats are received.
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            let span = tracing::debug_span!("CHrx:FollowerState");
            let _ent = span.enter();

            tokio::select! {
                // If an election timeout is hit, then we need to transition to candidate.
                _ = election_timeout => self.core.set_target_state(State::Candidate),
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.resolve(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.resolve(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot{rpc, tx} => {
                            let _ = tx.resolve(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::ClientRead{tx} => {
                            self.core.forward_client_read_request(tx);
                        }
                        RaftMsg::ClientWrite{tx, ..} => {
                            self.core.forward_client_write_request(tx);
                        }
                        RaftMsg::ChangeMembership{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::CheckElectionTimeout => {
                            self.core.force_election_timeout();
                        }
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update).await,
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    // Errors herein will trigger shutdown, so no need to process error.
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result).await;
                }
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in non-voter state.
pub(self) struct NonVoterState<'a, N: RaftTransport, P: Persistence, M: StateMachine> {
    core: &'a mut RaftCore<N, P, M>,
}

impl<'a, N: RaftTransport, P: Persistence, M: StateMachine> NonVoterState<'a, N, P, M> {
    pub(self) fn new(core: &'a mut RaftCore<N, P, M>) -> Self {
        Self { core }
    }

    /// Run the non-voter loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="non-voter"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics(Update::Update(None));
        loop {
            if !self.core.target_state.is_non_voter() {
                return Ok(());
            }

            let span = tracing::debug_span!("CHrx:NonVoterState");
            let _ent = span.enter();

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.resolve(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.resolve(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot{rpc, tx} => {
                            let _ = tx.resolve(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::ClientRead{tx} => {
                            self.core.forward_client_read_request(tx);
                        }
                        RaftMsg::ClientWrite{tx, ..} => {
                            self.core.forward_client_write_request(tx);
                        }
                        RaftMsg::ChangeMembership{tx, ..} => {
                            self.core.reject_config_change_not_leader(tx);
                        }
                        RaftMsg::CheckElectionTimeout => {
                            // Non-voters never campaign.
                        }
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update).await,
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    // Errors herein will trigger shutdown, so no need to process error.
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result).await;
                }
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}
