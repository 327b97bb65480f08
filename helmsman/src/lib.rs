#![doc = include_str!("../README.md")]

pub mod collect;
pub mod completion;
pub mod config;
mod core;
pub mod error;
pub mod executor;
pub mod membership;
pub mod metrics;
pub mod network;
pub(crate) mod quorum;
pub mod raft;
mod replication;
pub mod state_machine;
pub mod storage;
pub(crate) mod store;

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

pub use async_trait;
pub use crate::completion::Completion;
pub use crate::completion::Resolver;
pub use crate::completion::Step;
pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::SnapshotPolicy;
pub use crate::core::State;
pub use crate::error::RaftError;
pub use crate::error::RaftResult;
pub use crate::executor::Executor;
pub use crate::executor::KeepAlive;
pub use crate::membership::MembershipConfig;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftServer;
pub use crate::network::RaftTransport;
pub use crate::raft::Raft;
pub use crate::replication::ReplicationMetrics;
pub use crate::state_machine::StateMachine;
pub use crate::storage::Persistence;

/// A Raft node's ID.
pub type NodeId = u64;

/// The identity of a log entry: the term in which it was created and its position in the log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        LogId { term, index }
    }
}

/// A trait for types which can produce a condensed one-line summary for logging.
pub trait MessageSummary {
    /// Return a brief summary of the message, suitable for a tracing field.
    fn summary(&self) -> String;
}

/// Whether to update a value or to leave it as is.
#[derive(Debug)]
pub enum Update<T> {
    /// Update the value to the contained value.
    Update(T),
    /// Leave the value untouched.
    Ignore,
}
