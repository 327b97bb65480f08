//! Public Raft interface and data types.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::completion::Completion;
use crate::completion::Resolver;
use crate::config::Config;
use crate::core::RaftCore;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::executor::Executor;
use crate::membership::MembershipConfig;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::state_machine::StateMachine;
use crate::storage::Persistence;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftTransport;
use crate::State;

/// The startup dependencies of the core task, held until `start` is called.
struct CoreSeed<N: RaftTransport, P: Persistence, M: StateMachine> {
    id: NodeId,
    config: Arc<Config>,
    network: Arc<N>,
    storage: Arc<P>,
    state_machine: Arc<M>,
    rx_api: mpsc::UnboundedReceiver<(RaftMsg, Span)>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

struct RaftInner<N: RaftTransport, P: Persistence, M: StateMachine> {
    tx_api: mpsc::UnboundedSender<(RaftMsg, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    executor: Executor,
    seed: Mutex<Option<CoreSeed<N, P, M>>>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    running: AtomicBool,
}

/// The Raft node facade.
///
/// This type wires the transport, persistence, state machine and executor together, owns the
/// spawned core task, and is the interface through which applications submit commands and
/// linearizable reads. The clone itself is cheap and this type should be cloned liberally.
///
/// All asynchronous results are delivered through [`Completion`]s; none of the methods below
/// block the caller.
pub struct Raft<N: RaftTransport, P: Persistence, M: StateMachine> {
    inner: Arc<RaftInner<N, P, M>>,
}

impl<N: RaftTransport, P: Persistence, M: StateMachine> Raft<N, P, M> {
    /// Create a new Raft node facade.
    ///
    /// ### `id`
    /// The ID which the Raft node will use to identify itself within the cluster. Applications
    /// must guarantee that the ID is stable across restarts.
    ///
    /// ### `executor`
    /// The executor onto which user-facing completion continuations are posted. There is no
    /// process-wide default.
    ///
    /// The core task is not spawned until [`Raft::start`] is called.
    pub fn new(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<P>,
        state_machine: Arc<M>,
        executor: Executor,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let seed = CoreSeed {
            id,
            config,
            network,
            storage,
            state_machine,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            executor,
            seed: Mutex::new(Some(seed)),
            raft_handle: Mutex::new(None),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            running: AtomicBool::new(false),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Spawn the core task and begin participating in the cluster.
    ///
    /// Fails with `ShuttingDown` if the node has already been started or stopped; a facade is
    /// started at most once.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn start(&self) -> RaftResult<()> {
        let seed = self.inner.seed.lock().unwrap().take().ok_or(RaftError::ShuttingDown)?;
        let handle = RaftCore::spawn(
            seed.id,
            seed.config,
            seed.network,
            seed.storage,
            seed.state_machine,
            self.inner.executor.clone(),
            seed.rx_api,
            seed.tx_metrics,
            seed.rx_shutdown,
        );
        *self.inner.raft_handle.lock().unwrap() = Some(handle);
        self.inner.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Shutdown this Raft node and await the termination of its core task.
    pub async fn stop(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        let handle = self.inner.raft_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await?;
        }
        self.inner.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Check whether the core task has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Submit an AppendEntries RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader to replicate log entries (§5.3), and are also
    /// used as heartbeats (§5.2).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub fn append_entries(&self, rpc: AppendEntriesRequest) -> Completion<AppendEntriesResponse> {
        let (tx, rx) = Completion::pair_on(&self.inner.executor);
        self.send_msg(RaftMsg::AppendEntries { rpc, tx });
        rx
    }

    /// Submit a RequestVote RPC to this Raft node.
    ///
    /// These RPCs are sent by cluster peers which are in candidate state attempting to gather
    /// votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn vote(&self, rpc: VoteRequest) -> Completion<VoteResponse> {
        let (tx, rx) = Completion::pair_on(&self.inner.executor);
        self.send_msg(RaftMsg::RequestVote { rpc, tx });
        rx
    }

    /// Submit an InstallSnapshot RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader in order to bring a new node or a slow node
    /// up-to-speed with the leader (§7).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Completion<InstallSnapshotResponse> {
        let (tx, rx) = Completion::pair_on(&self.inner.executor);
        self.send_msg(RaftMsg::InstallSnapshot { rpc, tx });
        rx
    }

    /// Submit a command to be appended to the replicated log and applied to the state machine.
    ///
    /// The returned completion fulfils with the state machine's response bytes once the entry
    /// has been committed by a cluster quorum and applied locally. On a non-leader the
    /// completion fails fast with `NotLeader`, carrying a leader hint when one is known.
    #[tracing::instrument(level = "debug", skip(self, command, timeout))]
    pub fn submit_command(&self, command: Vec<u8>, timeout: Duration) -> Completion<Vec<u8>> {
        let (tx, rx) = Completion::pair_on(&self.inner.executor);
        self.send_msg(RaftMsg::ClientWrite { command, tx });
        rx.within(timeout)
    }

    /// Perform a linearizable read of the state machine.
    ///
    /// Leadership is confirmed with a heartbeat quorum round before the state is captured, so
    /// the returned bytes are never stale (§8).
    #[tracing::instrument(level = "debug", skip(self, timeout))]
    pub fn read_state(&self, timeout: Duration) -> Completion<Vec<u8>> {
        let (tx, rx) = Completion::pair_on(&self.inner.executor);
        self.send_msg(RaftMsg::ClientRead { tx });
        rx.within(timeout)
    }

    /// Propose a cluster membership change (§6).
    ///
    /// The cluster moves through joint consensus: decisions made while the change is in
    /// flight require majorities of both the old and the new member sets. The returned
    /// completion fulfils with the log index of the final configuration entry once it has
    /// been committed.
    #[tracing::instrument(level = "debug", skip(self, timeout))]
    pub fn change_membership(&self, members: BTreeSet<NodeId>, timeout: Duration) -> Completion<u64> {
        let (tx, rx) = Completion::pair_on(&self.inner.executor);
        self.send_msg(RaftMsg::ChangeMembership { members, tx });
        rx.within(timeout)
    }

    /// Force the node's election timer to expire. Test hook.
    pub fn check_election_timeout(&self) {
        let span = tracing::debug_span!("CH");
        let _ = self.inner.tx_api.send((RaftMsg::CheckElectionTimeout, span));
    }

    /// Check whether this node currently believes itself to be the cluster leader.
    ///
    /// This is based on the metrics channel and is suitable for request routing; use
    /// [`Raft::read_state`] to guard against stale reads.
    pub fn is_leader(&self) -> bool {
        self.inner.rx_metrics.borrow().state == State::Leader
    }

    /// The node's current term, from the metrics channel.
    pub fn current_term(&self) -> u64 {
        self.inner.rx_metrics.borrow().current_term
    }

    /// Get the ID of the current leader from this Raft node, if known.
    pub fn current_leader(&self) -> Option<NodeId> {
        self.inner.rx_metrics.borrow().current_leader
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// # use helmsman::{State, Raft};
    ///
    /// let timeout = Duration::from_millis(200);
    ///
    /// // wait for raft log-3 to be received and applied:
    /// r.wait(Some(timeout)).log(3, "log").await?;
    ///
    /// // wait for ever for raft node's current leader to become 3:
    /// r.wait(None).current_leader(3, "leader").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = timeout.unwrap_or_else(|| Duration::from_millis(500));
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Route a message into the core task, failing its resolver if the core is gone.
    fn send_msg(&self, msg: RaftMsg) {
        let span = tracing::debug_span!("CH");
        if let Err(mpsc::error::SendError((msg, _span))) = self.inner.tx_api.send((msg, span)) {
            msg.reject(RaftError::ShuttingDown);
        }
    }
}

impl<N: RaftTransport, P: Persistence, M: StateMachine> Clone for Raft<N, P, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A message coming from the Raft API.
pub(crate) enum RaftMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: Resolver<AppendEntriesResponse>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: Resolver<VoteResponse>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: Resolver<InstallSnapshotResponse>,
    },
    ClientWrite {
        command: Vec<u8>,
        tx: Resolver<Vec<u8>>,
    },
    ClientRead {
        tx: Resolver<Vec<u8>>,
    },
    ChangeMembership {
        members: BTreeSet<NodeId>,
        tx: Resolver<u64>,
    },
    CheckElectionTimeout,
}

impl RaftMsg {
    /// Fail the message's response channel with the given error.
    fn reject(self, err: RaftError) {
        match self {
            RaftMsg::AppendEntries { tx, .. } => {
                let _ = tx.fail(err);
            }
            RaftMsg::RequestVote { tx, .. } => {
                let _ = tx.fail(err);
            }
            RaftMsg::InstallSnapshot { tx, .. } => {
                let _ = tx.fail(err);
            }
            RaftMsg::ClientWrite { tx, .. } => {
                let _ = tx.fail(err);
            }
            RaftMsg::ClientRead { tx } => {
                let _ = tx.fail(err);
            }
            RaftMsg::ChangeMembership { tx, .. } => {
                let _ = tx.fail(err);
            }
            RaftMsg::CheckElectionTimeout => {}
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,
    /// The index of the log entry immediately preceding the new entries.
    pub prev_log_index: u64,
    /// The term of the entry at `prev_log_index`.
    pub prev_log_term: u64,
    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries
    /// are batched for efficiency.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log={}-{}, leader_commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_term,
            self.prev_log_index,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for leader to update itself.
    pub term: u64,
    /// Will be true if follower contained entry matching `prev_log_index` and `prev_log_term`.
    pub success: bool,
    /// The index of the last entry known replicated on the follower, when `success` is true.
    pub match_index: Option<u64>,
    /// The first index held by the follower for the conflicting term, when `success` is false.
    ///
    /// Together with `conflict_term` this implements the conflicting-term fast-backtrack
    /// outlined in §5.3, letting the leader skip over a whole term of mismatched entries per
    /// round trip instead of decrementing `next_index` one entry at a time.
    pub conflict_index: Option<u64>,
    /// The term of the follower's entry at `prev_log_index`, when `success` is false and such
    /// an entry exists.
    pub conflict_term: Option<u64>,
}

impl AppendEntriesResponse {
    /// A successful response at the given match index.
    pub fn matched(term: u64, match_index: u64) -> Self {
        Self {
            term,
            success: true,
            match_index: Some(match_index),
            conflict_index: None,
            conflict_term: None,
        }
    }

    /// A consistency-check rejection carrying conflict hints.
    pub fn conflict(term: u64, conflict_index: u64, conflict_term: Option<u64>) -> Self {
        Self {
            term,
            success: false,
            match_index: None,
            conflict_index: Some(conflict_index),
            conflict_term,
        }
    }
}

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub log_id: LogId,
    /// This entry's payload.
    pub payload: EntryPayload,
}

impl MessageSummary for Entry {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl MessageSummary for &[Entry] {
    fn summary(&self) -> String {
        let res: Vec<String> = self.iter().map(|x| x.summary()).collect();
        res.join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An empty payload committed by a new cluster leader.
    Blank,
    /// A normal application command, opaque to the protocol.
    Normal(Vec<u8>),
    /// A config change log entry.
    ConfigChange(MembershipConfig),
}

impl MessageSummary for EntryPayload {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Normal(data) => format!("normal({}B)", data.len()),
            EntryPayload::ConfigChange(membership) => {
                format!("config-change: {:?}", membership)
            }
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: u64,
    /// The index of the candidate’s last log entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate’s last log entry (§5.4).
    pub last_log_term: u64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl VoteRequest {
    /// Create a new instance.
    pub fn new(term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the Raft leader to send chunks of a snapshot to a follower (§7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,
    /// The snapshot replaces all log entries up through and including this index.
    pub last_included_index: u64,
    /// The term of `last_included_index`.
    pub last_included_term: u64,
    /// The latest membership configuration covered by the snapshot.
    pub membership: MembershipConfig,
    /// The byte offset where this chunk of data is positioned in the snapshot file.
    pub offset: u64,
    /// The raw bytes of the snapshot chunk, starting at `offset`.
    pub data: Vec<u8>,
    /// Will be `true` if this is the last chunk in the snapshot.
    pub done: bool,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, last_included={}-{}, offset={}, len={}, done={}",
            self.term,
            self.leader_id,
            self.last_included_term,
            self.last_included_index,
            self.offset,
            self.data.len(),
            self.done
        )
    }
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiving node's current term, for leader to update itself.
    pub term: u64,
}
