//! Error types exposed by this crate.

use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// The error taxonomy of the library.
///
/// Every failure surfaced through a [`Completion`](crate::Completion), an RPC handler or the
/// node facade carries one of these variants. Variants are tags with just enough payload to
/// act on; human-oriented detail goes through `tracing`, not through the error value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RaftError {
    /// A command or read was submitted to a node which is not the cluster leader.
    #[error("node is not the Raft leader (hint: {leader_hint:?})")]
    NotLeader {
        /// The ID of the current leader, if known. Useful in redirecting clients.
        leader_hint: Option<NodeId>,
    },

    /// A read-index quorum round revealed a higher term mid-flight.
    #[error("leadership was lost to term {term}")]
    LeadershipLost { term: u64 },

    /// The operation did not fulfil within the requested window.
    #[error("operation timed out")]
    Timeout,

    /// The candidate lost its election or was superseded by a higher term.
    #[error("election failed, superseded by term {term}")]
    ElectionFailed { term: u64 },

    /// A log consistency check failed.
    ///
    /// This is internal to the replication protocol; it surfaces on the wire as an
    /// `AppendEntries` response with `success == false` plus conflict hints.
    #[error("log inconsistency: {message}")]
    LogInconsistency { message: String },

    /// The state machine rejected the command payload of a committed entry.
    #[error("state machine rejected command: {message}")]
    BadCommand { message: String },

    /// Durable state could not be read back intact. This is fatal and stops the node.
    #[error("persistent state is corrupt: {message}")]
    PersistenceCorrupt { message: String },

    /// The transport could not reach the target node.
    #[error("network unreachable: {message}")]
    NetworkUnreachable { message: String },

    /// The remote endpoint went away mid-conversation.
    #[error("disconnected")]
    Disconnected,

    /// A completion was fulfilled more than once.
    #[error("completion has already been fulfilled")]
    AlreadyFulfilled,

    /// Work was submitted to an executor which has shut down.
    #[error("executor is gone")]
    ExecutorGone,

    /// The operation was cancelled by its caller or by a collector decision.
    #[error("cancelled")]
    Cancelled,

    /// A handler was registered twice for the same RPC kind.
    #[error("a {rpc} handler is already registered")]
    DuplicateHandler { rpc: String },

    /// The Raft node is shutting down and can no longer accept work.
    #[error("raft node is shutting down")]
    ShuttingDown,
}

impl RaftError {
    /// Shorthand for a `PersistenceCorrupt` error with the given message.
    pub fn corrupt(message: impl Into<String>) -> Self {
        RaftError::PersistenceCorrupt {
            message: message.into(),
        }
    }

    /// Shorthand for a `NetworkUnreachable` error with the given message.
    pub fn unreachable(message: impl Into<String>) -> Self {
        RaftError::NetworkUnreachable {
            message: message.into(),
        }
    }
}
