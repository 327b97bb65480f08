//! The simulator-backed implementation of the Raft RPC boundary.
//!
//! `SimRpc` is both halves at once: a [`RaftTransport`] client sending request frames over
//! the simulator, and a [`RaftServer`] dispatching inbound frames to registered handlers.
//! Frames are serde_json envelopes with correlation ids; each node's RPC traffic rides on a
//! single well-known port.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use helmsman::completion::Completion;
use helmsman::completion::Resolver;
use helmsman::error::RaftError;
use helmsman::error::RaftResult;
use helmsman::executor::Executor;
use helmsman::network::AppendEntriesHandler;
use helmsman::network::InstallSnapshotHandler;
use helmsman::network::RaftServer;
use helmsman::network::RaftTransport;
use helmsman::network::VoteHandler;
use helmsman::raft::AppendEntriesRequest;
use helmsman::raft::AppendEntriesResponse;
use helmsman::raft::InstallSnapshotRequest;
use helmsman::raft::InstallSnapshotResponse;
use helmsman::raft::VoteRequest;
use helmsman::raft::VoteResponse;
use helmsman::NodeId;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::Message;
use crate::NetworkSimulator;

/// The well-known port Raft RPC frames ride on.
pub const RAFT_PORT: u16 = 1024;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
enum RpcKind {
    AppendEntries,
    Vote,
    InstallSnapshot,
}

impl RpcKind {
    fn name(&self) -> &'static str {
        match self {
            RpcKind::AppendEntries => "append_entries",
            RpcKind::Vote => "vote",
            RpcKind::InstallSnapshot => "install_snapshot",
        }
    }
}

/// An RPC envelope as it travels through the simulator.
#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Request {
        id: u64,
        kind: RpcKind,
        body: serde_json::Value,
    },
    Response {
        id: u64,
        body: Result<serde_json::Value, String>,
    },
}

#[derive(Default)]
struct Handlers {
    append_entries: Option<AppendEntriesHandler>,
    vote: Option<VoteHandler>,
    install_snapshot: Option<InstallSnapshotHandler>,
}

struct SimRpcInner {
    sim: NetworkSimulator,
    id: NodeId,
    executor: Executor,
    next_correlation: AtomicU64,
    pending: Mutex<HashMap<u64, Resolver<serde_json::Value>>>,
    handlers: Mutex<Handlers>,
    running: AtomicBool,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// The simulator-backed RPC endpoint of a single node.
#[derive(Clone)]
pub struct SimRpc {
    inner: Arc<SimRpcInner>,
}

impl SimRpc {
    /// Create the RPC endpoint for `id`, registering the node with the simulator.
    pub fn new(sim: NetworkSimulator, id: NodeId, executor: Executor) -> Self {
        sim.add_node(id);
        Self {
            inner: Arc::new(SimRpcInner {
                sim,
                id,
                executor,
                next_correlation: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                handlers: Mutex::new(Handlers::default()),
                running: AtomicBool::new(false),
                pump: Mutex::new(None),
            }),
        }
    }

    /// Issue a typed request to `target`, correlating the eventual response frame.
    fn call<Req, Resp>(&self, target: NodeId, kind: RpcKind, req: &Req, timeout: Duration) -> Completion<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Send + 'static,
    {
        let body = match serde_json::to_value(req) {
            Ok(body) => body,
            Err(err) => return Completion::failed(RaftError::unreachable(format!("encode error: {}", err))),
        };
        let id = self.inner.next_correlation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = Completion::pair_on(&self.inner.executor);
        self.inner.pending.lock().unwrap().insert(id, tx);

        let frame = Frame::Request { id, kind, body };
        let payload = match serde_json::to_vec(&frame) {
            Ok(payload) => payload,
            Err(err) => {
                self.inner.pending.lock().unwrap().remove(&id);
                return Completion::failed(RaftError::unreachable(format!("encode error: {}", err)));
            }
        };

        // A message the simulator refuses to route fails fast; one the simulator drops is
        // indistinguishable from loss and surfaces as a timeout below.
        let routed = self
            .inner
            .sim
            .send(Message::new(self.inner.id, RAFT_PORT, target, RAFT_PORT, payload));
        let inner = self.inner.clone();
        let _ = routed.then_value(move |ok| {
            if !ok {
                if let Some(tx) = inner.pending.lock().unwrap().remove(&id) {
                    let _ = tx.fail(RaftError::unreachable(format!("no route to node {}", target)));
                }
            }
        });

        let inner = self.inner.clone();
        let _ = self.inner.executor.timer(timeout, move || {
            if let Some(tx) = inner.pending.lock().unwrap().remove(&id) {
                let _ = tx.fail(RaftError::Timeout);
            }
        });

        rx.then_try(|res: RaftResult<serde_json::Value>| -> RaftResult<Resp> {
            match res {
                Ok(value) => serde_json::from_value(value)
                    .map_err(|err| RaftError::unreachable(format!("decode error: {}", err))),
                Err(err) => Err(err),
            }
        })
    }

    /// Dispatch an inbound request frame to its registered handler, off the pump task.
    fn dispatch_request(inner: &Arc<SimRpcInner>, source: NodeId, id: u64, kind: RpcKind, body: serde_json::Value) {
        let completion: Option<Completion<serde_json::Value>> = {
            let handlers = inner.handlers.lock().unwrap();
            match kind {
                RpcKind::AppendEntries => handlers.append_entries.as_ref().map(|handler| {
                    decode_and_run::<AppendEntriesRequest, AppendEntriesResponse>(handler.as_ref(), body)
                }),
                RpcKind::Vote => handlers
                    .vote
                    .as_ref()
                    .map(|handler| decode_and_run::<VoteRequest, VoteResponse>(handler.as_ref(), body)),
                RpcKind::InstallSnapshot => handlers.install_snapshot.as_ref().map(|handler| {
                    decode_and_run::<InstallSnapshotRequest, InstallSnapshotResponse>(handler.as_ref(), body)
                }),
            }
        };

        let completion = match completion {
            Some(completion) => completion,
            None => {
                tracing::warn!(kind = kind.name(), "inbound RPC with no registered handler");
                return;
            }
        };

        let inner = inner.clone();
        tokio::spawn(async move {
            let body = match completion.await {
                Ok(value) => Ok(value),
                Err(err) => Err(err.to_string()),
            };
            let frame = Frame::Response { id, body };
            let payload = match serde_json::to_vec(&frame) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::error!(error=%err, "error encoding RPC response frame");
                    return;
                }
            };
            let _ = inner.sim.send(Message::new(inner.id, RAFT_PORT, source, RAFT_PORT, payload));
        });
    }
}

/// Decode a request body, run the handler, and re-encode the typed response as a value.
fn decode_and_run<Req, Resp>(
    handler: &dyn Fn(Req) -> Completion<Resp>,
    body: serde_json::Value,
) -> Completion<serde_json::Value>
where
    Req: DeserializeOwned,
    Resp: Serialize + Send + 'static,
{
    let req: Req = match serde_json::from_value(body) {
        Ok(req) => req,
        Err(err) => return Completion::failed(RaftError::unreachable(format!("decode error: {}", err))),
    };
    handler(req).then_try(|res: RaftResult<Resp>| -> RaftResult<serde_json::Value> {
        match res {
            Ok(resp) => serde_json::to_value(resp).map_err(|err| RaftError::unreachable(format!("encode error: {}", err))),
            Err(err) => Err(err),
        }
    })
}

impl RaftTransport for SimRpc {
    fn append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest,
        timeout: Duration,
    ) -> Completion<AppendEntriesResponse> {
        self.call(target, RpcKind::AppendEntries, &rpc, timeout)
    }

    fn vote(&self, target: NodeId, rpc: VoteRequest, timeout: Duration) -> Completion<VoteResponse> {
        self.call(target, RpcKind::Vote, &rpc, timeout)
    }

    fn install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
        timeout: Duration,
    ) -> Completion<InstallSnapshotResponse> {
        self.call(target, RpcKind::InstallSnapshot, &rpc, timeout)
    }
}

impl RaftServer for SimRpc {
    fn register_append_entries_handler(&self, handler: AppendEntriesHandler) -> RaftResult<()> {
        let mut handlers = self.inner.handlers.lock().unwrap();
        if handlers.append_entries.is_some() {
            return Err(RaftError::DuplicateHandler {
                rpc: "append_entries".into(),
            });
        }
        handlers.append_entries = Some(handler);
        Ok(())
    }

    fn register_vote_handler(&self, handler: VoteHandler) -> RaftResult<()> {
        let mut handlers = self.inner.handlers.lock().unwrap();
        if handlers.vote.is_some() {
            return Err(RaftError::DuplicateHandler { rpc: "vote".into() });
        }
        handlers.vote = Some(handler);
        Ok(())
    }

    fn register_install_snapshot_handler(&self, handler: InstallSnapshotHandler) -> RaftResult<()> {
        let mut handlers = self.inner.handlers.lock().unwrap();
        if handlers.install_snapshot.is_some() {
            return Err(RaftError::DuplicateHandler {
                rpc: "install_snapshot".into(),
            });
        }
        handlers.install_snapshot = Some(handler);
        Ok(())
    }

    fn start(&self) -> RaftResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let rx = self
            .inner
            .sim
            .bind_port(self.inner.id, RAFT_PORT)
            .map_err(|_| RaftError::Disconnected)?;

        let inner = self.inner.clone();
        let pump = tokio::spawn(async move {
            loop {
                let msg = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                let msg = match msg {
                    Some(msg) => msg,
                    // The node was removed from the simulator.
                    None => break,
                };
                let frame: Frame = match serde_json::from_slice(&msg.payload) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::warn!(error=%err, "dropping undecodable RPC frame");
                        continue;
                    }
                };
                match frame {
                    Frame::Request { id, kind, body } => {
                        SimRpc::dispatch_request(&inner, msg.source, id, kind, body);
                    }
                    Frame::Response { id, body } => {
                        let tx = inner.pending.lock().unwrap().remove(&id);
                        if let Some(tx) = tx {
                            let _ = match body {
                                Ok(value) => tx.fulfil(value),
                                Err(message) => tx.fail(RaftError::unreachable(message)),
                            };
                        }
                    }
                }
            }
        });
        *self.inner.pump.lock().unwrap() = Some(pump);
        Ok(())
    }

    fn stop(&self) -> RaftResult<()> {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(pump) = self.inner.pump.lock().unwrap().take() {
            pump.abort();
        }
        let mut pending = self.inner.pending.lock().unwrap();
        for (_, tx) in pending.drain() {
            let _ = tx.fail(RaftError::Disconnected);
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}
