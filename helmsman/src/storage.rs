//! The durable persistence contract and its data types.

use std::fmt::Debug;
use std::ops::RangeBounds;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::membership::MembershipConfig;
use crate::raft::Entry;
use crate::LogId;
use crate::NodeId;

/// Metadata of a snapshot: the log prefix it replaces and the membership it captures.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotMeta {
    /// Log entries up through which this snapshot includes, inclusive.
    pub last_log_id: LogId,
    /// The latest membership configuration covered by the snapshot.
    pub membership: MembershipConfig,
}

/// A snapshot of the state machine plus its metadata.
///
/// The `data` bytes are opaque to the protocol; they are whatever the state machine's
/// `get_state` produced and are handed back verbatim on restore.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

/// A record holding the hard state of a Raft node.
///
/// This model derives serde's traits for easily (de)serializing this
/// model for storage & retrieval.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// A struct used to represent the initial state which a Raft node needs when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The last entry.
    pub last_log_id: LogId,
    /// The LogId of the last log applied to the state machine.
    pub last_applied_log: LogId,
    /// The saved hard state of the node.
    pub hard_state: HardState,
    /// The latest cluster membership configuration found in the log or snapshot, else a new
    /// initial membership config consisting only of this node's ID.
    pub membership: MembershipConfig,
}

impl InitialState {
    /// Create a new instance for a pristine Raft node.
    ///
    /// ### `id`
    /// The ID of the Raft node.
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            last_log_id: LogId { term: 0, index: 0 },
            last_applied_log: LogId { term: 0, index: 0 },
            hard_state: HardState {
                current_term: 0,
                voted_for: None,
            },
            membership: MembershipConfig::new_initial(id),
        }
    }
}

/// The durable storage contract of a Raft node.
///
/// Term updates, vote grants and log appends are flushed through this trait before the engine
/// produces the responses they fence; an implementation must make each call durable before
/// returning. Every operation either succeeds completely or leaves the prior state
/// observable — a crash between any two calls must be recoverable.
///
/// Unreadable state detected at startup should be reported through
/// [`RaftError::PersistenceCorrupt`](crate::RaftError::PersistenceCorrupt); any other error
/// returned from these methods will cause Raft to go into shutdown, as the node cannot
/// guarantee its promises without durable state.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Get the latest membership config found in the log or snapshot.
    ///
    /// This must be implemented as a reverse search through the log for the most recent
    /// config-change entry, falling back to the config embedded in the current snapshot. If
    /// the system is pristine, it should return the value of calling
    /// `MembershipConfig::new_initial(node_id)`.
    async fn get_membership_config(&self) -> Result<MembershipConfig>;

    /// Get Raft's state information from storage.
    ///
    /// When the Raft node is first started, it will call this interface on the storage system
    /// to fetch the last known state from stable storage. If no such state exists due to this
    /// being the first time the node has come online, then `InitialState::new_initial` should
    /// be used.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Save Raft's hard-state (current term and vote).
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Get a series of log entries from storage.
    ///
    /// The start value is inclusive in the search and the stop value is non-inclusive:
    /// `[start, stop)`.
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry>>;

    /// Try to get a single log entry.
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry>>;

    /// Returns the id of the last entry in the log, or of the snapshot boundary if the log is
    /// empty, or `(0, 0)` on a pristine node.
    async fn last_log_id(&self) -> Result<LogId>;

    /// Append a payload of entries to the log.
    ///
    /// Though the entries will always be presented in order, each entry's index should be
    /// used to determine its location to be written in the log.
    async fn append_to_log(&self, entries: &[&Entry]) -> Result<()>;

    /// Delete all log entries with `index >= from`.
    ///
    /// This is only ever invoked on followers repairing an uncommitted suffix which conflicts
    /// with the leader's log; a leader never truncates its own log.
    async fn truncate_log(&self, from: u64) -> Result<()>;

    /// Delete all log entries with `index <= upto`, compacting the prefix behind a snapshot.
    async fn purge_log_upto(&self, upto: u64) -> Result<()>;

    /// Atomically persist the given snapshot as the node's current snapshot.
    ///
    /// After this call succeeds, log entries at or below `snap.meta.last_log_id.index` may be
    /// deleted via `purge_log_upto`.
    async fn save_snapshot(&self, snap: &Snapshot) -> Result<()>;

    /// Load the node's current snapshot, if one exists.
    async fn load_snapshot(&self) -> Result<Option<Snapshot>>;
}

/// APIs for debugging a store.
#[async_trait]
pub trait PersistenceDebug {
    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> Option<HardState>;
}
