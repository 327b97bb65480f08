//! Fixtures for testing Raft.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use helmsman::error::RaftError;
use helmsman::executor::Executor;
use helmsman::metrics::Wait;
use helmsman::network::RaftServer;
use helmsman::raft::Raft;
use helmsman::storage::Persistence;
use helmsman::storage::PersistenceDebug;
use helmsman::Config;
use helmsman::LogId;
use helmsman::NodeId;
use helmsman::RaftMetrics;
use helmsman::State;
use memstore::MemKv;
use memstore::MemStore;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;
use simnet::rpc::SimRpc;
use simnet::NetworkEdge;
use simnet::NetworkSimulator;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete Raft type used during testing.
pub type MemRaft = Raft<SimRpc, MemStore, MemKv>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::FULL)
        .with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The per-node handles tracked by the router.
pub struct NodeHandles {
    pub raft: MemRaft,
    pub store: Arc<MemStore>,
    pub kv: Arc<MemKv>,
    pub rpc: SimRpc,
}

/// A test harness wiring whole Raft clusters over the network simulator.
pub struct RaftRouter {
    /// The Raft runtime config which all nodes are using.
    config: Arc<Config>,
    /// The simulated network carrying all RPC frames.
    sim: NetworkSimulator,
    /// The edge description used for every link in the mesh.
    edge: NetworkEdge,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, NodeHandles>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
}

pub struct Builder {
    config: Arc<Config>,
    latency: Duration,
    reliability: f64,
    seed: u64,
}

impl Builder {
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn reliability(mut self, reliability: f64) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> RaftRouter {
        let sim = NetworkSimulator::with_seed(self.seed);
        sim.start();
        RaftRouter {
            config: self.config,
            sim,
            edge: NetworkEdge::new(self.latency, self.reliability),
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
        }
    }
}

impl RaftRouter {
    pub fn builder(config: Arc<Config>) -> Builder {
        Builder {
            config,
            latency: Duration::from_millis(10),
            reliability: 1.0,
            seed: 0,
        }
    }

    /// Create a new instance with perfect links and 10ms latency.
    pub fn new(config: Arc<Config>) -> Self {
        Self::builder(config).build()
    }

    pub fn simulator(&self) -> &NetworkSimulator {
        &self.sim
    }

    /// Create, wire up and start a new Raft node bearing the given ID.
    ///
    /// `members` seeds the node's pristine cluster membership: nodes which are part of it
    /// start as followers and may campaign, others come up as passive non-voters.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId, members: BTreeSet<NodeId>) {
        let store = Arc::new(MemStore::new_with_members(id, members));
        self.new_raft_node_with_sto(id, store).await
    }

    pub async fn new_raft_node_with_sto(self: &Arc<Self>, id: NodeId, store: Arc<MemStore>) {
        let kv = Arc::new(MemKv::new());
        let rpc = SimRpc::new(self.sim.clone(), id, Executor::current());
        let raft = Raft::new(
            id,
            self.config.clone(),
            Arc::new(rpc.clone()),
            store.clone(),
            kv.clone(),
            Executor::current(),
        );

        // Wire the server half of the RPC boundary straight into the facade.
        {
            let raft = raft.clone();
            rpc.register_append_entries_handler(Arc::new(move |req| raft.append_entries(req)))
                .expect("append_entries handler already registered");
        }
        {
            let raft = raft.clone();
            rpc.register_vote_handler(Arc::new(move |req| raft.vote(req))).expect("vote handler already registered");
        }
        {
            let raft = raft.clone();
            rpc.register_install_snapshot_handler(Arc::new(move |req| raft.install_snapshot(req)))
                .expect("install_snapshot handler already registered");
        }
        rpc.start().expect("failed to start sim rpc server");
        raft.start().expect("failed to start raft node");

        // Mesh the new node with every node already in the router.
        let mut rt = self.routing_table.write().await;
        for existing in rt.keys() {
            self.sim.add_edge(id, *existing, self.edge);
            self.sim.add_edge(*existing, id, self.edge);
        }
        rt.insert(id, NodeHandles { raft, store, kv, rpc });
    }

    /// Isolate the network of the specified node by removing all of its edges.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
        let rt = self.routing_table.read().await;
        for other in rt.keys().filter(|other| **other != id) {
            self.sim.remove_edge(id, *other);
            self.sim.remove_edge(*other, id);
        }
    }

    /// Restore the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restore_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.remove(&id);
        let rt = self.routing_table.read().await;
        for other in rt.keys().filter(|other| **other != id) {
            self.sim.add_edge(id, *other, self.edge);
            self.sim.add_edge(*other, id, self.edge);
        }
    }

    /// Replace every mesh edge with one of the given reliability, keeping latency.
    pub async fn set_reliability(&self, reliability: f64) {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let edge = NetworkEdge::new(self.edge.latency(), reliability);
        for src in rt.keys() {
            for dst in rt.keys().filter(|dst| *dst != src) {
                if isolated.contains(src) || isolated.contains(dst) {
                    continue;
                }
                self.sim.add_edge(*src, *dst, edge);
            }
        }
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        let mut metrics = vec![];
        for node in rt.values() {
            metrics.push(node.raft.metrics().borrow().clone());
        }
        metrics
    }

    /// Get a handle to the storage backend for the target node.
    pub async fn get_storage_handle(&self, node_id: &NodeId) -> Result<Arc<MemStore>> {
        let rt = self.routing_table.read().await;
        let node = rt.get(node_id).with_context(|| format!("could not find node {} in routing table", node_id))?;
        Ok(node.store.clone())
    }

    /// Get a handle to the state machine for the target node.
    pub async fn get_kv_handle(&self, node_id: &NodeId) -> Result<Arc<MemKv>> {
        let rt = self.routing_table.read().await;
        let node = rt.get(node_id).with_context(|| format!("could not find node {} in routing table", node_id))?;
        Ok(node.kv.clone())
    }

    pub async fn wait(&self, node_id: &NodeId, timeout: Option<Duration>) -> Result<Wait> {
        let rt = self.routing_table.read().await;
        let node = rt.get(node_id).with_context(|| format!("node {} not found", node_id))?;
        Ok(node.raft.wait(timeout))
    }

    /// Wait for metrics until it satisfies some condition.
    #[tracing::instrument(level = "info", skip(self, func))]
    pub async fn wait_for_metrics<T>(
        &self,
        node_id: &NodeId,
        func: T,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<RaftMetrics>
    where
        T: Fn(&RaftMetrics) -> bool + Send,
    {
        let wait = self.wait(node_id, timeout).await?;
        let rst = wait.metrics(func, msg).await?;
        Ok(rst)
    }

    /// Wait for specified nodes until they applied upto `want_log`(inclusive) logs.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_log(
        &self,
        node_ids: &BTreeSet<u64>,
        want_log: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.log(want_log, msg).await?;
        }
        Ok(())
    }

    /// Wait for specified nodes until they have applied at least `want_log` entries.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_applied(
        &self,
        node_ids: &BTreeSet<u64>,
        want_log: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.applied_at_least(want_log, msg).await?;
        }
        Ok(())
    }

    /// Wait for specified nodes until their state becomes `state`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_state(
        &self,
        node_ids: &BTreeSet<u64>,
        want_state: State,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.state(want_state, msg).await?;
        }
        Ok(())
    }

    /// Wait for specified nodes until their snapshot covers `want`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_snapshot(
        &self,
        node_ids: &BTreeSet<u64>,
        want: LogId,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.snapshot(want, msg).await?;
        }
        Ok(())
    }

    /// Get the ID of the current leader.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|node| {
            if node.current_leader == Some(node.id) && node.state == State::Leader {
                if isolated.contains(&node.id) {
                    None
                } else {
                    Some(node.id)
                }
            } else {
                None
            }
        })
    }

    /// Wait until some node reports itself leader, returning its ID.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("no leader elected within {:?}", timeout));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Submit a `key=value` command to the target node, returning the response bytes.
    pub async fn client_request(
        &self,
        target: NodeId,
        key: &str,
        value: &str,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, RaftError> {
        let command = format!("{}={}", key, value).into_bytes();
        let rt = self.routing_table.read().await;
        let node = rt.get(&target).unwrap_or_else(|| panic!("node {} does not exist in routing table", target));
        let completion = node.raft.submit_command(command, timeout);
        drop(rt);
        completion.await
    }

    /// Send a series of client requests to the target node, causing test failure on error.
    pub async fn client_request_many(&self, target: NodeId, prefix: &str, count: usize) {
        for idx in 0..count {
            if let Err(err) = self
                .client_request(target, &format!("{}-{}", prefix, idx), &idx.to_string(), Duration::from_secs(5))
                .await
            {
                panic!("error from client request {}: {:?}", idx, err)
            }
        }
    }

    /// Perform a linearizable read on the target node, returning the state machine bytes.
    pub async fn read_state(&self, target: NodeId, timeout: Duration) -> std::result::Result<Vec<u8>, RaftError> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&target).unwrap_or_else(|| panic!("node {} does not exist in routing table", target));
        let completion = node.raft.read_state(timeout);
        drop(rt);
        completion.await
    }

    /// Propose a membership change on the target node.
    pub async fn change_membership(
        &self,
        target: NodeId,
        members: BTreeSet<NodeId>,
        timeout: Duration,
    ) -> std::result::Result<u64, RaftError> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&target).unwrap_or_else(|| panic!("node {} does not exist in routing table", target));
        let completion = node.raft.change_membership(members, timeout);
        drop(rt);
        completion.await
    }

    //////////////////////////////////////////////////////////////////////////////////////////////

    /// Assert that the cluster has an elected leader, and is in a stable state with all
    /// non-isolated voters in agreement on term, leader and logs.
    pub async fn assert_stable_cluster(&self, expected_term: Option<u64>, expected_last_log: Option<u64>) {
        let isolated = self.isolated_nodes.read().await;
        let nodes = self.latest_metrics().await;

        let non_isolated_nodes: Vec<_> = nodes
            .iter()
            .filter(|node| !isolated.contains(&node.id) && node.membership_config.contains(&node.id))
            .collect();
        let leader = non_isolated_nodes
            .iter()
            .find(|node| node.state == State::Leader)
            .expect("expected to find a cluster leader");
        let followers: Vec<_> = non_isolated_nodes.iter().filter(|node| node.state == State::Follower).collect();

        assert_eq!(
            followers.len() + 1,
            non_isolated_nodes.len(),
            "expected all nodes to be followers with one leader, got 1 leader and {} followers, expected {} followers",
            followers.len(),
            non_isolated_nodes.len() - 1,
        );
        let expected_term = match expected_term {
            Some(term) => term,
            None => leader.current_term,
        };
        let expected_last_log = match expected_last_log {
            Some(idx) => idx,
            None => leader.last_log_index,
        };
        for node in non_isolated_nodes.iter() {
            assert_eq!(
                node.current_leader,
                Some(leader.id),
                "node {} has leader {:?}, expected {}",
                node.id,
                node.current_leader,
                leader.id
            );
            assert_eq!(
                node.current_term, expected_term,
                "node {} has term {}, expected {}",
                node.id, node.current_term, expected_term
            );
            assert_eq!(
                node.last_applied, expected_last_log,
                "node {} has last_applied {}, expected {}",
                node.id, node.last_applied, expected_last_log
            );
            assert_eq!(
                node.last_log_index, expected_last_log,
                "node {} has last_log_index {}, expected {}",
                node.id, node.last_log_index, expected_last_log
            );
        }
    }

    /// Assert that all nodes hold byte-identical logs.
    pub async fn assert_logs_converged(&self, node_ids: &BTreeSet<NodeId>) {
        let rt = self.routing_table.read().await;
        let mut reference: Option<(NodeId, Vec<helmsman::raft::Entry>)> = None;
        for id in node_ids {
            let node = rt.get(id).unwrap_or_else(|| panic!("node {} does not exist in routing table", id));
            let log = node.store.get_log_entries(..).await.unwrap();
            match &reference {
                None => reference = Some((*id, log)),
                Some((ref_id, ref_log)) => {
                    assert_eq!(
                        ref_log, &log,
                        "log of node {} diverges from log of node {}",
                        id, ref_id
                    );
                }
            }
        }
    }

    /// Assert that the key/value state machines of the given nodes are identical.
    pub async fn assert_state_machines_converged(&self, node_ids: &BTreeSet<NodeId>) {
        let rt = self.routing_table.read().await;
        let mut reference: Option<(NodeId, BTreeMap<String, String>)> = None;
        for id in node_ids {
            let node = rt.get(id).unwrap_or_else(|| panic!("node {} does not exist in routing table", id));
            let map = node.kv.state_map().await;
            match &reference {
                None => reference = Some((*id, map)),
                Some((ref_id, ref_map)) => {
                    assert_eq!(
                        ref_map, &map,
                        "state machine of node {} diverges from node {}",
                        id, ref_id
                    );
                }
            }
        }
    }

    /// Assert the hard state persisted for the given node.
    pub async fn assert_hard_state(&self, node_id: NodeId, expect_term: u64, expect_voted_for: Option<NodeId>) {
        let rt = self.routing_table.read().await;
        let node = rt.get(&node_id).unwrap_or_else(|| panic!("node {} does not exist in routing table", node_id));
        let hs = node.store.read_hard_state().await.unwrap_or_else(|| panic!("no hard state found for node {}", node_id));
        assert_eq!(
            hs.current_term, expect_term,
            "expected node {} to have term {}, got {}",
            node_id, expect_term, hs.current_term
        );
        if let Some(voted_for) = expect_voted_for {
            assert_eq!(
                hs.voted_for,
                Some(voted_for),
                "expected node {} to have voted for {}, got {:?}",
                node_id,
                voted_for,
                hs.voted_for
            );
        }
    }
}

/// Parse the state machine bytes returned by `read_state` into the key/value map.
pub fn parse_kv_state(state: &[u8]) -> BTreeMap<String, String> {
    let value: serde_json::Value = serde_json::from_slice(state).expect("state bytes should be valid json");
    serde_json::from_value(value.get("data").cloned().expect("state json should carry a data map"))
        .expect("data map should deserialize")
}
