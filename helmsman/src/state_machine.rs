//! The application state machine contract.

use anyhow::Result;
use async_trait::async_trait;

use crate::LogId;

/// An application state machine driven by the replicated log.
///
/// `apply` must be deterministic and must not persist anything on its own: the log is the
/// source of truth, and after a crash the state machine is rebuilt by restoring the latest
/// snapshot and replaying the log suffix.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a committed command to the state machine, returning the response bytes for the
    /// client which submitted it.
    ///
    /// A returned error normally fails just that command's completion; the commit itself
    /// stands, and the engine moves on to the next entry. The one exception is an error which
    /// downcasts to [`FatalStateMachineError`], which halts the node to avoid divergence.
    async fn apply(&self, index: LogId, command: &[u8]) -> Result<Vec<u8>>;

    /// Capture the full state of the machine as opaque bytes, sufficient for `restore`.
    async fn get_state(&self) -> Result<Vec<u8>>;

    /// Reset the machine from bytes previously produced by `get_state`, recording
    /// `last_applied` as the log position the state corresponds to.
    async fn restore(&self, state: &[u8], last_applied: LogId) -> Result<()>;

    /// The id of the last log entry applied to this machine.
    async fn last_applied(&self) -> Result<LogId>;
}

/// An error which indicates that the state machine can no longer make progress and the node
/// must shut down rather than risk diverging from its peers.
#[derive(Debug, thiserror::Error)]
#[error("fatal state machine error: {0}")]
pub struct FatalStateMachineError(pub String);
