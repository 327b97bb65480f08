//! An in-memory index over the persisted log suffix and snapshot boundary.
//!
//! The engine owns one `LogStore` and routes every log mutation through it: writes go to
//! durable storage first and the cache is updated only after the write returns, so the cache
//! never claims durability that storage does not have. Entries newer than the latest snapshot
//! are held in memory for O(1) access by index; everything at or below the snapshot boundary
//! is served by the snapshot itself.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;

use crate::raft::Entry;
use crate::storage::Persistence;
use crate::LogId;

pub(crate) struct LogStore<P: Persistence> {
    storage: Arc<P>,
    /// The retained log suffix, front entry at `first_index`.
    entries: VecDeque<Entry>,
    /// The index of the front entry; equals the next append index while the suffix is empty.
    first_index: u64,
    /// The boundary of the latest snapshot, `(0, 0)` when none exists.
    snapshot_last_log_id: LogId,
    last_log_id: LogId,
}

impl<P: Persistence> LogStore<P> {
    /// Rebuild the store from the latest snapshot plus the persisted log suffix.
    pub async fn load(storage: Arc<P>) -> Result<Self> {
        let snapshot_last_log_id = storage
            .load_snapshot()
            .await?
            .map(|snap| snap.meta.last_log_id)
            .unwrap_or_default();
        let suffix = storage.get_log_entries(snapshot_last_log_id.index + 1..).await?;
        let last_log_id = suffix.last().map(|entry| entry.log_id).unwrap_or(snapshot_last_log_id);
        Ok(Self {
            storage,
            first_index: snapshot_last_log_id.index + 1,
            entries: suffix.into(),
            snapshot_last_log_id,
            last_log_id,
        })
    }

    pub fn last_log_id(&self) -> LogId {
        self.last_log_id
    }

    pub fn snapshot_last_log_id(&self) -> LogId {
        self.snapshot_last_log_id
    }

    /// The first log index which is still held as an entry rather than inside the snapshot.
    pub fn first_retained_index(&self) -> u64 {
        self.first_index
    }

    /// The term of the entry at `index`, if the store can still answer for it.
    ///
    /// Index 0 is the origin before any entry and always has term 0; the snapshot boundary is
    /// answered from the snapshot metadata.
    pub fn term_of(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_last_log_id.index {
            return Some(self.snapshot_last_log_id.term);
        }
        self.entry(index).map(|entry| entry.log_id.term)
    }

    pub fn entry(&self, index: u64) -> Option<&Entry> {
        if index < self.first_index {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    /// Clone out the entries in `[lo, hi)`, clamped to the retained suffix.
    pub fn entries(&self, lo: u64, hi: u64) -> Vec<Entry> {
        let lo = lo.max(self.first_index);
        (lo..hi).filter_map(|idx| self.entry(idx).cloned()).collect()
    }

    /// The first retained index whose entry carries the given term, if any.
    pub fn first_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries.iter().find(|entry| entry.log_id.term == term).map(|entry| entry.log_id.index)
    }

    /// Durably append entries and extend the cache.
    pub async fn append(&mut self, entries: Vec<Entry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        if entries[0].log_id.index != self.last_log_id.index + 1 {
            return Err(anyhow!(
                "discontinuous log append: have last index {}, got {}",
                self.last_log_id.index,
                entries[0].log_id.index
            ));
        }
        let refs: Vec<&Entry> = entries.iter().collect();
        self.storage.append_to_log(&refs).await?;
        self.last_log_id = entries.last().map(|entry| entry.log_id).unwrap_or(self.last_log_id);
        self.entries.extend(entries);
        Ok(())
    }

    /// Durably remove all entries with `index >= from`, repairing a follower conflict.
    pub async fn truncate(&mut self, from: u64) -> Result<()> {
        self.storage.truncate_log(from).await?;
        while self.entries.back().map(|entry| entry.log_id.index >= from).unwrap_or(false) {
            self.entries.pop_back();
        }
        self.last_log_id = self.entries.back().map(|entry| entry.log_id).unwrap_or(self.snapshot_last_log_id);
        Ok(())
    }

    /// Record a freshly taken snapshot and compact the log prefix behind it.
    pub async fn compact(&mut self, boundary: LogId) -> Result<()> {
        self.storage.purge_log_upto(boundary.index).await?;
        self.drop_cached_upto(boundary.index);
        self.snapshot_last_log_id = boundary;
        if self.last_log_id < boundary {
            self.last_log_id = boundary;
        }
        Ok(())
    }

    /// Adopt an installed snapshot from the leader.
    ///
    /// When the existing log holds the snapshot's boundary entry the suffix past it is kept;
    /// otherwise the entire log is discarded.
    pub async fn reset_to_snapshot(&mut self, boundary: LogId, retain_suffix: bool) -> Result<()> {
        if retain_suffix {
            return self.compact(boundary).await;
        }
        self.storage.truncate_log(self.first_index).await?;
        self.storage.purge_log_upto(boundary.index).await?;
        self.entries.clear();
        self.first_index = boundary.index + 1;
        self.snapshot_last_log_id = boundary;
        self.last_log_id = boundary;
        Ok(())
    }

    fn drop_cached_upto(&mut self, upto: u64) {
        while self.entries.front().map(|entry| entry.log_id.index <= upto).unwrap_or(false) {
            self.entries.pop_front();
        }
        self.first_index = match self.entries.front() {
            Some(front) => front.log_id.index,
            None => upto + 1,
        };
    }
}
