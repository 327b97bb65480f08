#![doc = include_str!("../README.md")]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::ops::RangeBounds;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use helmsman::membership::MembershipConfig;
use helmsman::raft::Entry;
use helmsman::raft::EntryPayload;
use helmsman::state_machine::StateMachine;
use helmsman::storage::HardState;
use helmsman::storage::InitialState;
use helmsman::storage::Persistence;
use helmsman::storage::PersistenceDebug;
use helmsman::storage::Snapshot;
use helmsman::LogId;
use helmsman::NodeId;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

/// An in-memory implementation of the `helmsman` persistence contract.
///
/// Nothing here survives an actual process crash; the value of this store is that it honors
/// the contract's observable semantics exactly, which is what the engine and the test suite
/// care about.
pub struct MemStore {
    /// The ID of the Raft node for which this storage instance is configured.
    id: NodeId,
    /// The Raft log.
    log: RwLock<BTreeMap<u64, Entry>>,
    /// The current hard state.
    hs: RwLock<Option<HardState>>,
    /// The current snapshot.
    current_snapshot: RwLock<Option<Snapshot>>,
    /// The membership a pristine node starts from before any config entry exists.
    initial_membership: MembershipConfig,
}

impl MemStore {
    /// Create a new `MemStore` instance whose pristine membership is just this node.
    pub fn new(id: NodeId) -> Self {
        let mut members = BTreeSet::new();
        members.insert(id);
        Self::new_with_members(id, members)
    }

    /// Create a new `MemStore` instance seeded with the given pristine cluster membership.
    ///
    /// This stands in for the well-known location where a real deployment records the
    /// cluster it was provisioned into.
    pub fn new_with_members(id: NodeId, members: BTreeSet<NodeId>) -> Self {
        Self {
            id,
            log: RwLock::new(BTreeMap::new()),
            hs: RwLock::new(None),
            current_snapshot: RwLock::new(None),
            initial_membership: MembershipConfig {
                members,
                members_after_consensus: None,
            },
        }
    }
}

#[async_trait]
impl Persistence for MemStore {
    async fn get_membership_config(&self) -> Result<MembershipConfig> {
        let log = self.log.read().await;
        let cfg_in_log = log.values().rev().find_map(|entry| match &entry.payload {
            EntryPayload::ConfigChange(membership) => Some(membership.clone()),
            _ => None,
        });
        if let Some(cfg) = cfg_in_log {
            return Ok(cfg);
        }
        let snapshot = self.current_snapshot.read().await;
        Ok(snapshot
            .as_ref()
            .map(|snap| snap.meta.membership.clone())
            .unwrap_or_else(|| self.initial_membership.clone()))
    }

    async fn get_initial_state(&self) -> Result<InitialState> {
        let membership = self.get_membership_config().await?;
        let mut hs = self.hs.write().await;
        match &*hs {
            Some(inner) => {
                let last_log_id = self.last_log_id().await?;
                let last_applied_log = self
                    .current_snapshot
                    .read()
                    .await
                    .as_ref()
                    .map(|snap| snap.meta.last_log_id)
                    .unwrap_or_default();
                Ok(InitialState {
                    last_log_id,
                    last_applied_log,
                    hard_state: inner.clone(),
                    membership,
                })
            }
            None => {
                tracing::debug!(id = self.id, "no hard state found, starting from pristine state");
                let new = InitialState {
                    membership,
                    ..InitialState::new_initial(self.id)
                };
                *hs = Some(new.hard_state.clone());
                Ok(new)
            }
        }
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, entry)| entry.clone()).collect())
    }

    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry>> {
        let log = self.log.read().await;
        Ok(log.get(&log_index).cloned())
    }

    async fn last_log_id(&self) -> Result<LogId> {
        let log = self.log.read().await;
        if let Some((_, entry)) = log.iter().next_back() {
            return Ok(entry.log_id);
        }
        let snapshot = self.current_snapshot.read().await;
        Ok(snapshot.as_ref().map(|snap| snap.meta.last_log_id).unwrap_or_default())
    }

    async fn append_to_log(&self, entries: &[&Entry]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    async fn truncate_log(&self, from: u64) -> Result<()> {
        let mut log = self.log.write().await;
        log.split_off(&from);
        Ok(())
    }

    async fn purge_log_upto(&self, upto: u64) -> Result<()> {
        let mut log = self.log.write().await;
        *log = log.split_off(&(upto + 1));
        Ok(())
    }

    async fn save_snapshot(&self, snap: &Snapshot) -> Result<()> {
        *self.current_snapshot.write().await = Some(snap.clone());
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.current_snapshot.read().await.clone())
    }
}

#[async_trait]
impl PersistenceDebug for MemStore {
    async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }
}

/// The serializable internals of [`MemKv`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct MemKvInner {
    last_applied: LogId,
    data: BTreeMap<String, String>,
}

/// A small key/value state machine over `key=value` command bytes.
///
/// `apply` is deterministic and keeps no durable state of its own; snapshots are the
/// serde_json serialization of the whole map plus the applied position.
#[derive(Default)]
pub struct MemKv {
    inner: RwLock<MemKvInner>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the value currently held for `key`.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.inner.read().await.data.get(key).cloned()
    }

    /// Clone out the full key/value map, for test assertions.
    pub async fn state_map(&self) -> BTreeMap<String, String> {
        self.inner.read().await.data.clone()
    }

    /// The id of the last entry applied to this machine.
    pub async fn last_applied_log(&self) -> LogId {
        self.inner.read().await.last_applied
    }
}

#[async_trait]
impl StateMachine for MemKv {
    async fn apply(&self, index: LogId, command: &[u8]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(command).map_err(|_| anyhow!("command is not valid utf-8"))?;
        let (key, value) = text
            .split_once('=')
            .ok_or_else(|| anyhow!("malformed command, expected key=value, got {:?}", text))?;

        let mut inner = self.inner.write().await;
        inner.data.insert(key.to_string(), value.to_string());
        inner.last_applied = index;
        Ok(value.as_bytes().to_vec())
    }

    async fn get_state(&self) -> Result<Vec<u8>> {
        let inner = self.inner.read().await;
        Ok(serde_json::to_vec(&*inner)?)
    }

    async fn restore(&self, state: &[u8], last_applied: LogId) -> Result<()> {
        let mut restored: MemKvInner = serde_json::from_slice(state)?;
        restored.last_applied = last_applied;
        *self.inner.write().await = restored;
        Ok(())
    }

    async fn last_applied(&self) -> Result<LogId> {
        Ok(self.inner.read().await.last_applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmsman::storage::SnapshotMeta;
    use maplit::btreeset;

    fn entry(term: u64, index: u64, payload: EntryPayload) -> Entry {
        Entry {
            log_id: LogId { term, index },
            payload,
        }
    }

    #[tokio::test]
    async fn test_initial_state_is_pristine_with_seeded_membership() {
        let store = MemStore::new_with_members(1, btreeset![1, 2, 3]);
        let initial = store.get_initial_state().await.unwrap();
        assert_eq!(initial.hard_state, HardState::default());
        assert_eq!(initial.last_log_id, LogId::default());
        assert_eq!(initial.membership.members, btreeset![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_hard_state_round_trip() {
        let store = MemStore::new(1);
        let hs = HardState {
            current_term: 5,
            voted_for: Some(2),
        };
        store.save_hard_state(&hs).await.unwrap();
        assert_eq!(store.read_hard_state().await, Some(hs.clone()));
        let initial = store.get_initial_state().await.unwrap();
        assert_eq!(initial.hard_state, hs);
    }

    #[tokio::test]
    async fn test_log_append_truncate_purge() {
        let store = MemStore::new(1);
        let entries: Vec<Entry> = (1..=5).map(|i| entry(1, i, EntryPayload::Blank)).collect();
        let refs: Vec<&Entry> = entries.iter().collect();
        store.append_to_log(&refs).await.unwrap();
        assert_eq!(store.last_log_id().await.unwrap(), LogId { term: 1, index: 5 });

        store.truncate_log(4).await.unwrap();
        assert_eq!(store.last_log_id().await.unwrap(), LogId { term: 1, index: 3 });

        store.purge_log_upto(2).await.unwrap();
        let remaining = store.get_log_entries(..).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].log_id.index, 3);
    }

    #[tokio::test]
    async fn test_membership_config_prefers_log_over_snapshot() {
        let store = MemStore::new_with_members(1, btreeset![1]);
        let cfg = MembershipConfig {
            members: btreeset![1, 2],
            members_after_consensus: None,
        };
        store
            .append_to_log(&[&entry(1, 1, EntryPayload::ConfigChange(cfg.clone()))])
            .await
            .unwrap();
        assert_eq!(store.get_membership_config().await.unwrap(), cfg);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let store = MemStore::new(1);
        let snap = Snapshot {
            meta: SnapshotMeta {
                last_log_id: LogId { term: 2, index: 10 },
                membership: MembershipConfig::new_initial(1),
            },
            data: b"snapshot-bytes".to_vec(),
        };
        store.save_snapshot(&snap).await.unwrap();
        let loaded = store.load_snapshot().await.unwrap().unwrap();
        assert_eq!(loaded.meta, snap.meta);
        assert_eq!(loaded.data, snap.data);
        assert_eq!(store.last_log_id().await.unwrap(), LogId { term: 2, index: 10 });
    }

    #[tokio::test]
    async fn test_kv_apply_and_snapshot_restore() {
        let kv = MemKv::new();
        let res = kv.apply(LogId { term: 1, index: 1 }, b"x=1").await.unwrap();
        assert_eq!(res, b"1".to_vec());
        kv.apply(LogId { term: 1, index: 2 }, b"y=2").await.unwrap();
        assert_eq!(kv.get("x").await.as_deref(), Some("1"));

        let state = kv.get_state().await.unwrap();
        let restored = MemKv::new();
        restored.restore(&state, LogId { term: 1, index: 2 }).await.unwrap();
        assert_eq!(restored.get("y").await.as_deref(), Some("2"));
        assert_eq!(restored.last_applied().await.unwrap(), LogId { term: 1, index: 2 });
    }

    #[tokio::test]
    async fn test_kv_rejects_malformed_command() {
        let kv = MemKv::new();
        let res = kv.apply(LogId { term: 1, index: 1 }, b"no-equals-sign").await;
        assert!(res.is_err());
        assert_eq!(kv.last_applied().await.unwrap(), LogId::default());
    }
}
