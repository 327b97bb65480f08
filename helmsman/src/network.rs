//! The RPC boundary: the client and server contracts through which Raft peers talk.
//!
//! The engine consumes both halves through these traits only. The in-process network
//! simulator provides one implementation pair for tests; wire transports provide others.

use std::sync::Arc;
use std::time::Duration;

use crate::completion::Completion;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::NodeId;

/// The client half of the RPC boundary: sending RPCs to peer nodes.
///
/// Each call returns immediately with a [`Completion`] for the typed response. Transports are
/// responsible for honoring `timeout`; the engine never retries an individual RPC, it simply
/// observes the failure and lets its own timer logic (the next heartbeat or election round)
/// drive the retry.
pub trait RaftTransport: Send + Sync + 'static {
    /// Send an AppendEntries RPC to the target Raft node (§5).
    fn append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest,
        timeout: Duration,
    ) -> Completion<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target Raft node (§5).
    fn vote(&self, target: NodeId, rpc: VoteRequest, timeout: Duration) -> Completion<VoteResponse>;

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    fn install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
        timeout: Duration,
    ) -> Completion<InstallSnapshotResponse>;
}

/// A registered handler for inbound AppendEntries RPCs.
pub type AppendEntriesHandler = Arc<dyn Fn(AppendEntriesRequest) -> Completion<AppendEntriesResponse> + Send + Sync>;
/// A registered handler for inbound RequestVote RPCs.
pub type VoteHandler = Arc<dyn Fn(VoteRequest) -> Completion<VoteResponse> + Send + Sync>;
/// A registered handler for inbound InstallSnapshot RPCs.
pub type InstallSnapshotHandler =
    Arc<dyn Fn(InstallSnapshotRequest) -> Completion<InstallSnapshotResponse> + Send + Sync>;

/// The server half of the RPC boundary: receiving RPCs from peer nodes.
///
/// Exactly one handler may be registered per RPC kind; a second registration fails with
/// `DuplicateHandler`. Handlers are invoked off the server's receive loop and reply through
/// the completion they return.
pub trait RaftServer: Send + Sync + 'static {
    /// Register the handler for inbound AppendEntries RPCs.
    fn register_append_entries_handler(&self, handler: AppendEntriesHandler) -> RaftResult<()>;

    /// Register the handler for inbound RequestVote RPCs.
    fn register_vote_handler(&self, handler: VoteHandler) -> RaftResult<()>;

    /// Register the handler for inbound InstallSnapshot RPCs.
    fn register_install_snapshot_handler(&self, handler: InstallSnapshotHandler) -> RaftResult<()>;

    /// Start serving inbound RPCs.
    fn start(&self) -> RaftResult<()>;

    /// Stop serving inbound RPCs.
    fn stop(&self) -> RaftResult<()>;

    /// Check whether the server loop is running.
    fn is_running(&self) -> bool;
}
