#![doc = include_str!("../README.md")]

pub mod rpc;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use helmsman::completion::Completion;
use helmsman::error::RaftError;
use helmsman::NodeId;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::sleep_until;
use tokio::time::Instant;

/// A directed network edge: fixed latency plus an independent per-message delivery
/// probability.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NetworkEdge {
    latency: Duration,
    reliability: f64,
}

impl NetworkEdge {
    /// Create a new edge description. `reliability` is clamped to `[0, 1]`.
    pub fn new(latency: Duration, reliability: f64) -> Self {
        Self {
            latency,
            reliability: reliability.max(0.0).min(1.0),
        }
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn reliability(&self) -> f64 {
        self.reliability
    }
}

/// A message in flight between two simulated nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub source: NodeId,
    pub source_port: u16,
    pub dest: NodeId,
    pub dest_port: u16,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(source: NodeId, source_port: u16, dest: NodeId, dest_port: u16, payload: Vec<u8>) -> Self {
        Self {
            source,
            source_port,
            dest,
            dest_port,
            payload,
        }
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>;

struct PortRecord {
    tx: mpsc::UnboundedSender<Message>,
    rx: SharedReceiver,
}

impl PortRecord {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct ConnectionRecord {
    peer: NodeId,
    local_port: u16,
    remote_port: u16,
}

struct NodeRecord {
    /// The default mailbox for messages not claimed by a bound port.
    mailbox: PortRecord,
    /// Bound ports demultiplexing inbound messages.
    ports: HashMap<u16, PortRecord>,
    /// The arena of open connection records; `Connection` handles are indices into it.
    connections: Vec<ConnectionRecord>,
}

impl NodeRecord {
    fn new() -> Self {
        Self {
            mailbox: PortRecord::new(),
            ports: HashMap::new(),
            connections: Vec::new(),
        }
    }
}

struct EdgeRecord {
    edge: NetworkEdge,
    queue_tx: mpsc::UnboundedSender<(Message, Instant, bool)>,
    courier: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct Topology {
    nodes: HashMap<NodeId, NodeRecord>,
    edges: HashMap<(NodeId, NodeId), EdgeRecord>,
}

struct SimInner {
    started: AtomicBool,
    rng: Mutex<ChaCha8Rng>,
    topology: Mutex<Topology>,
}

/// A deterministic in-memory network for tests.
///
/// Nodes are mailboxes; directed edges carry latency and reliability. Messages scheduled on
/// an edge are delivered in FIFO order at `send time + latency` by a per-edge courier task,
/// and are dropped independently with probability `1 - reliability` using the seeded RNG, so
/// a given seed reproduces the same loss pattern.
///
/// Couriers are tokio tasks; construct and drive the simulator inside a runtime.
#[derive(Clone)]
pub struct NetworkSimulator {
    inner: Arc<SimInner>,
}

impl NetworkSimulator {
    /// Create a simulator with an arbitrary seed.
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Create a simulator whose loss decisions replay deterministically for the given seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: Arc::new(SimInner {
                started: AtomicBool::new(false),
                rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
                topology: Mutex::new(Topology::default()),
            }),
        }
    }

    /// Add a node to the topology. Adding an existing node is a no-op.
    pub fn add_node(&self, id: NodeId) {
        let mut topology = self.inner.topology.lock().unwrap();
        topology.nodes.entry(id).or_insert_with(NodeRecord::new);
    }

    /// Add a node and return a handle to it.
    pub fn create_node(&self, id: NodeId) -> SimNode {
        self.add_node(id);
        SimNode {
            id,
            sim: self.clone(),
        }
    }

    /// Remove a node along with all of its incident edges.
    ///
    /// Outstanding receives on the node fail with a disconnection error.
    pub fn remove_node(&self, id: NodeId) {
        let mut topology = self.inner.topology.lock().unwrap();
        topology.nodes.remove(&id);
        let incident: Vec<(NodeId, NodeId)> =
            topology.edges.keys().filter(|(src, dst)| *src == id || *dst == id).copied().collect();
        for key in incident {
            if let Some(record) = topology.edges.remove(&key) {
                record.courier.abort();
            }
        }
    }

    pub fn has_node(&self, id: NodeId) -> bool {
        self.inner.topology.lock().unwrap().nodes.contains_key(&id)
    }

    /// Add a directional edge. Missing endpoints are created; an existing edge is replaced.
    pub fn add_edge(&self, src: NodeId, dst: NodeId, edge: NetworkEdge) {
        let mut topology = self.inner.topology.lock().unwrap();
        topology.nodes.entry(src).or_insert_with(NodeRecord::new);
        topology.nodes.entry(dst).or_insert_with(NodeRecord::new);

        let inner = self.inner.clone();
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<(Message, Instant, bool)>();
        let courier = tokio::spawn(async move {
            while let Some((msg, deliver_at, dropped)) = queue_rx.recv().await {
                sleep_until(deliver_at).await;
                if dropped {
                    continue;
                }
                // Deliver to the port queue when one is bound, else the default mailbox.
                // Ports are resolved at delivery time so late binds still receive.
                let tx = {
                    let topology = inner.topology.lock().unwrap();
                    match topology.nodes.get(&msg.dest) {
                        Some(node) => node
                            .ports
                            .get(&msg.dest_port)
                            .map(|record| record.tx.clone())
                            .unwrap_or_else(|| node.mailbox.tx.clone()),
                        // The destination disappeared mid-flight.
                        None => continue,
                    }
                };
                let _ = tx.send(msg);
            }
        });

        if let Some(old) = topology.edges.insert((src, dst), EdgeRecord { edge, queue_tx, courier }) {
            old.courier.abort();
        }
    }

    /// Remove a directional edge.
    pub fn remove_edge(&self, src: NodeId, dst: NodeId) {
        let mut topology = self.inner.topology.lock().unwrap();
        if let Some(record) = topology.edges.remove(&(src, dst)) {
            record.courier.abort();
        }
    }

    pub fn has_edge(&self, src: NodeId, dst: NodeId) -> bool {
        self.inner.topology.lock().unwrap().edges.contains_key(&(src, dst))
    }

    /// Fetch the description of an edge, if present.
    pub fn get_edge(&self, src: NodeId, dst: NodeId) -> Option<NetworkEdge> {
        self.inner.topology.lock().unwrap().edges.get(&(src, dst)).map(|record| record.edge)
    }

    /// Enable message routing.
    pub fn start(&self) {
        self.inner.started.store(true, Ordering::SeqCst);
    }

    /// Disable message routing. Messages already in flight are still delivered.
    pub fn stop(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
    }

    /// Stop the simulator and clear all nodes and edges, allowing reuse.
    pub fn reset(&self) {
        self.stop();
        let mut topology = self.inner.topology.lock().unwrap();
        for (_, record) in topology.edges.drain() {
            record.courier.abort();
        }
        topology.nodes.clear();
    }

    /// Route a message through the topology.
    ///
    /// Fulfils with `false` when the simulator is stopped or no edge connects source to
    /// destination; otherwise the message is scheduled on the edge and the completion
    /// fulfils with `true`. A scheduled message may still be dropped by the edge's
    /// reliability before delivery.
    pub fn send(&self, msg: Message) -> Completion<bool> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Completion::ready(false);
        }
        let topology = self.inner.topology.lock().unwrap();
        let record = match topology.edges.get(&(msg.source, msg.dest)) {
            Some(record) => record,
            None => return Completion::ready(false),
        };
        let dropped = {
            let mut rng = self.inner.rng.lock().unwrap();
            rng.gen::<f64>() >= record.edge.reliability
        };
        let deliver_at = Instant::now() + record.edge.latency;
        let _ = record.queue_tx.send((msg, deliver_at, dropped));
        Completion::ready(true)
    }

    /// Receive the next message queued at `node`, from the given bound port or from the
    /// default mailbox.
    pub fn receive_on(&self, node: NodeId, port: Option<u16>, timeout: Duration) -> Completion<Message> {
        let rx = {
            let topology = self.inner.topology.lock().unwrap();
            let record = match topology.nodes.get(&node) {
                Some(record) => record,
                None => return Completion::failed(RaftError::Disconnected),
            };
            match port {
                Some(port) => match record.ports.get(&port) {
                    Some(port_record) => port_record.rx.clone(),
                    None => return Completion::failed(RaftError::Disconnected),
                },
                None => record.mailbox.rx.clone(),
            }
        };

        let (tx, completion) = Completion::pair();
        tokio::spawn(async move {
            let res = tokio::time::timeout(timeout, async {
                let mut rx = rx.lock().await;
                rx.recv().await
            })
            .await;
            match res {
                Ok(Some(msg)) => {
                    let _ = tx.fulfil(msg);
                }
                Ok(None) => {
                    let _ = tx.fail(RaftError::Disconnected);
                }
                Err(_elapsed) => {
                    let _ = tx.fail(RaftError::Timeout);
                }
            }
        });
        completion
    }

    /// Bind a port on `node`, returning the shared receiver backing it.
    pub(crate) fn bind_port(&self, node: NodeId, port: u16) -> Result<SharedReceiver, RaftError> {
        let mut topology = self.inner.topology.lock().unwrap();
        let record = topology.nodes.get_mut(&node).ok_or(RaftError::Disconnected)?;
        let port_record = record.ports.entry(port).or_insert_with(PortRecord::new);
        Ok(port_record.rx.clone())
    }
}

impl Default for NetworkSimulator {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle to a node in the simulated network.
#[derive(Clone)]
pub struct SimNode {
    id: NodeId,
    sim: NetworkSimulator,
}

impl SimNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Bind a port, returning a listener over messages addressed to it.
    pub fn bind(&self, port: u16) -> Completion<Listener> {
        match self.sim.bind_port(self.id, port) {
            Ok(_rx) => Completion::ready(Listener {
                node: self.id,
                port,
                sim: self.sim.clone(),
            }),
            Err(err) => Completion::failed(err),
        }
    }

    /// Open a connection record to a peer, pinning the local and remote ports.
    pub fn connect(&self, peer: NodeId, local_port: u16, remote_port: u16) -> Completion<Connection> {
        if !self.sim.has_node(peer) {
            return Completion::failed(RaftError::unreachable(format!("no such node: {}", peer)));
        }
        if self.sim.bind_port(self.id, local_port).is_err() {
            return Completion::failed(RaftError::Disconnected);
        }
        let mut topology = self.sim.inner.topology.lock().unwrap();
        let record = match topology.nodes.get_mut(&self.id) {
            Some(record) => record,
            None => return Completion::failed(RaftError::Disconnected),
        };
        record.connections.push(ConnectionRecord {
            peer,
            local_port,
            remote_port,
        });
        let handle = record.connections.len() - 1;
        Completion::ready(Connection {
            node: self.id,
            handle,
            peer,
            local_port,
            remote_port,
            sim: self.sim.clone(),
        })
    }

    /// Send a raw message from this node.
    pub fn send(&self, msg: Message) -> Completion<bool> {
        self.sim.send(msg)
    }

    /// Receive the next message from this node's default mailbox.
    pub fn receive(&self, timeout: Duration) -> Completion<Message> {
        self.sim.receive_on(self.id, None, timeout)
    }
}

/// A bound port on a simulated node.
pub struct Listener {
    node: NodeId,
    port: u16,
    sim: NetworkSimulator,
}

impl Listener {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Receive the next message addressed to this port.
    pub fn receive(&self, timeout: Duration) -> Completion<Message> {
        self.sim.receive_on(self.node, Some(self.port), timeout)
    }
}

/// A thin reference to a connection record held in its node's arena.
pub struct Connection {
    node: NodeId,
    handle: usize,
    peer: NodeId,
    local_port: u16,
    remote_port: u16,
    sim: NetworkSimulator,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("node", &self.node)
            .field("handle", &self.handle)
            .field("peer", &self.peer)
            .field("local_port", &self.local_port)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}

impl Connection {
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// The index of this connection's record in its node's arena.
    pub fn handle(&self) -> usize {
        self.handle
    }

    /// Send payload bytes to the connection's peer.
    pub fn send(&self, payload: Vec<u8>) -> Completion<bool> {
        self.sim.send(Message::new(self.node, self.local_port, self.peer, self.remote_port, payload))
    }

    /// Receive the next message addressed to the connection's local port.
    pub fn receive(&self, timeout: Duration) -> Completion<Message> {
        self.sim.receive_on(self.node, Some(self.local_port), timeout)
    }
}
