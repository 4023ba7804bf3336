//! The entry index plane: `ActionKey -> CacheEntry`, sharded for concurrent access (§4.3,
//! §5 "action cache index: sharded mapping with per-shard serialization for writes").
//!
//! Shard selection uses the first byte of the key's digest, mirroring the same 2-hex
//! sharding the blob store already uses on disk (`BlobStore::path_for`), just kept
//! in-memory here instead of as directory fan-out.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use builder_core::model::{ActionKey, CacheEntry};

const SHARD_COUNT: usize = 64;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Sharded, reader-parallel entry index.
///
/// Reads never block other reads or writes to a different shard; writes are serialized
/// per-shard via `parking_lot::RwLock`, never globally.
pub struct EntryIndex {
    shards: Vec<RwLock<HashMap<ActionKey, CacheEntry>>>,
}

impl EntryIndex {
    /// Builds an empty index with the default shard count.
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(HashMap::new()));
        }
        EntryIndex { shards }
    }

    fn shard_index(key: &ActionKey) -> usize {
        (key.0 .0[0] as usize) % SHARD_COUNT
    }

    /// Looks up an entry, cloning it out from behind the shard lock.
    pub fn get(&self, key: &ActionKey) -> Option<CacheEntry> {
        self.shards[Self::shard_index(key)].read().get(key).cloned()
    }

    /// Inserts or overwrites an entry for `key`.
    pub fn insert(&self, key: ActionKey, entry: CacheEntry) {
        let _ = self.shards[Self::shard_index(&key)].write().insert(key, entry);
    }

    /// Removes an entry, e.g. after corruption is detected on probe.
    pub fn remove(&self, key: &ActionKey) -> Option<CacheEntry> {
        self.shards[Self::shard_index(key)].write().remove(key)
    }

    /// Records a probe hit: bumps `hit_count` and refreshes `last_access_unix`, used by the
    /// eviction score.
    pub fn record_hit(&self, key: &ActionKey) {
        if let Some(entry) = self.shards[Self::shard_index(key)].write().get_mut(key) {
            entry.hit_count += 1;
            entry.last_access_unix = now_unix();
        }
    }

    /// Whether `key` is present, without cloning the entry.
    pub fn contains(&self, key: &ActionKey) -> bool {
        self.shards[Self::shard_index(key)].read().contains_key(key)
    }

    /// Total number of entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every `(key, entry)` pair, for sweep/eviction/persistence passes. Takes
    /// each shard's read lock in turn rather than a global lock, so this is not an atomic
    /// point-in-time view under concurrent writers, which is acceptable for the
    /// best-effort reconciliation work that consumes it.
    pub fn snapshot(&self) -> Vec<(ActionKey, CacheEntry)> {
        let mut out = Vec::with_capacity(self.len());
        for shard in &self.shards {
            out.extend(shard.read().iter().map(|(k, v)| (*k, v.clone())));
        }
        out
    }

    /// Loads entries into the index, used when reconstructing from the on-disk shard log.
    /// Later entries for the same key win (last-write-wins), matching append-only replay.
    pub fn load(&self, entries: Vec<(ActionKey, CacheEntry)>) {
        for (key, entry) in entries {
            self.insert(key, entry);
        }
    }
}

impl Default for EntryIndex {
    fn default() -> Self {
        Self::new()
    }
}
