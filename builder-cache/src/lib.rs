//! Multi-tier content-addressed cache (§4.3, §4.4, §6).
//!
//! `ActionCache` is the action cache (C): a blob store plus an entry index, persisted to
//! disk and safe for concurrent probes/inserts from every scheduler worker. An optional
//! [`RemoteCacheTransport`] backs a second tier consulted on local miss. [`target`] builds
//! the thin target-cache layer (D) on top.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

pub mod error;
pub mod index;
mod persist;
pub mod remote;
pub mod target;

mod blob;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub use blob::BlobStore;
pub use error::{CacheError, Result};
pub use index::EntryIndex;
pub use remote::{HttpRemoteCache, HttpRemoteConfig, RemoteCacheTransport};
pub use target::{target_key, TargetCache};

use builder_core::model::{ActionKey, CacheEntry, Digest};
use builder_hash::ContentHasher;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Scoring weights for the eviction policy: `S = alpha*(now - last_access) +
/// beta*(1/size) + gamma*(1/hit_count)` (§4.3), highest score evicted first — age
/// dominates, but between two equally-stale entries the smaller, more-frequently-hit one
/// contributes a smaller `1/size`/`1/hit_count` term and so survives longer.
#[derive(Debug, Clone, Copy)]
pub struct EvictionWeights {
    /// Weight applied to age (seconds since last access).
    pub alpha: f64,
    /// Weight applied to the size penalty (evicts large entries first, all else equal).
    pub beta: f64,
    /// Weight applied to hit count (evicts cold entries first, all else equal).
    pub gamma: f64,
}

impl Default for EvictionWeights {
    fn default() -> Self {
        EvictionWeights {
            alpha: 1.0,
            beta: 0.01,
            gamma: 5.0,
        }
    }
}

/// Budget that triggers eviction: the cache sweeps down to these limits whenever `sweep` or
/// an over-budget `insert` runs.
#[derive(Debug, Clone, Copy)]
pub struct CacheBudget {
    /// Maximum total entry count before eviction kicks in.
    pub max_entries: usize,
    /// Maximum total blob bytes on disk before eviction kicks in.
    pub max_total_bytes: u64,
    /// Maximum age, in seconds since last access, an entry may reach before it is evicted
    /// regardless of the count/byte budgets. `None` disables the age limit.
    pub max_age_secs: Option<u64>,
}

impl Default for CacheBudget {
    fn default() -> Self {
        CacheBudget {
            max_entries: 100_000,
            max_total_bytes: 20 * 1024 * 1024 * 1024,
            max_age_secs: Some(30 * 24 * 60 * 60),
        }
    }
}

/// The action cache: content-addressed blob store + persistent entry index, with optional
/// remote acceleration.
///
/// `probe` is the hot path every action runner invocation starts with; `insert` is the hot
/// path every cache-missed, successful action ends with. Both are safe to call from any
/// number of scheduler worker threads concurrently.
pub struct ActionCache {
    root: PathBuf,
    blobs: BlobStore,
    index: EntryIndex,
    remote: Option<Box<dyn RemoteCacheTransport>>,
    budget: CacheBudget,
    weights: EvictionWeights,
}

impl ActionCache {
    /// Opens (creating if necessary) an action cache rooted at `root`, replaying its
    /// persisted index from `root/index/`.
    pub fn open(root: PathBuf) -> Result<Self> {
        let blobs = BlobStore::open(root.clone())?;
        let index = EntryIndex::new();
        let records = persist::load_all(&root.join("index"))?;
        let count = records.len();
        index.load(records);
        tracing::info!(entries = count, "loaded action cache index");

        Ok(ActionCache {
            root,
            blobs,
            index,
            remote: None,
            budget: CacheBudget::default(),
            weights: EvictionWeights::default(),
        })
    }

    /// Attaches a remote cache transport, consulted on local miss.
    pub fn with_remote(mut self, remote: Box<dyn RemoteCacheTransport>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Overrides the default eviction budget.
    pub fn with_budget(mut self, budget: CacheBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Looks up `key`. On a local hit, the stored entry's declared outputs are re-verified
    /// to exist as blobs before being reported as a hit; a dangling entry (outputs missing
    /// from the blob store, e.g. after manual blob GC) is treated as corruption: the stale
    /// index entry is dropped and this reports a miss rather than propagating an error,
    /// matching §4.3's "a corrupt entry degrades to a miss, never a build failure".
    ///
    /// On a local miss with a remote transport attached, the remote is probed next; a
    /// remote hit pulls the entry and its blobs down and inserts them locally before
    /// returning, so the next probe for the same key is a local hit.
    pub fn probe(&self, key: ActionKey) -> Result<Option<CacheEntry>> {
        if let Some(entry) = self.index.get(&key) {
            if self.outputs_present(&entry) {
                self.index.record_hit(&key);
                return Ok(Some(entry));
            }
            tracing::warn!(key = %key, "dropping cache entry with missing blobs");
            let _ = self.index.remove(&key);
        }

        if let Some(remote) = &self.remote {
            match remote.remote_probe(key) {
                Ok(Some(entry)) => {
                    if let Err(err) = self.pull_remote_blobs(remote.as_ref(), &entry) {
                        tracing::warn!(%err, "remote hit but blob pull failed, treating as miss");
                        return Ok(None);
                    }
                    self.insert_local(key, entry.clone())?;
                    return Ok(Some(entry));
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(%err, "remote probe failed, falling back to local miss");
                }
            }
        }

        Ok(None)
    }

    fn outputs_present(&self, entry: &CacheEntry) -> bool {
        entry
            .outputs
            .iter()
            .all(|o| self.blobs.contains(o.content_hash))
    }

    /// Pulls every missing output blob from `remote` and admits it locally only after
    /// re-hashing the downloaded bytes and confirming they match the declared digest (§4.3
    /// "download on remote hit is content-verified before local admission"). A mismatch is
    /// treated as a corrupt/forged remote entry and surfaces as a `CacheCorruption` error,
    /// which the caller (`probe`) degrades to a local miss rather than propagating.
    fn pull_remote_blobs(
        &self,
        remote: &dyn RemoteCacheTransport,
        entry: &CacheEntry,
    ) -> Result<()> {
        let hasher = ContentHasher::default();
        for output in &entry.outputs {
            if !self.blobs.contains(output.content_hash) {
                let bytes = remote.remote_get_blob(output.content_hash)?;
                let actual = hasher.hash_bytes(&bytes);
                if actual != output.content_hash {
                    return Err(CacheError::Corruption(format!(
                        "remote blob {} re-hashed to {actual}",
                        output.content_hash
                    )));
                }
                self.blobs.put(output.content_hash, &bytes)?;
            }
        }
        Ok(())
    }

    /// Stores blobs (read from `source_dir` by each output's relative path) and the entry
    /// for `key`. If a remote transport is attached, the same blobs and entry are also
    /// pushed remotely; remote push failures are logged and swallowed, never fatal.
    pub fn insert(
        &self,
        key: ActionKey,
        mut entry: CacheEntry,
        source_dir: &Path,
    ) -> Result<()> {
        for output in &entry.outputs {
            if !self.blobs.contains(output.content_hash) {
                let bytes = std::fs::read(source_dir.join(&output.relative_path))?;
                self.blobs.put(output.content_hash, &bytes)?;
            }
        }
        entry.last_access_unix = now_unix();
        self.insert_local(key, entry.clone())?;

        if let Some(remote) = &self.remote {
            for output in &entry.outputs {
                if let Ok(bytes) = self.blobs.get(output.content_hash) {
                    if let Err(err) = remote.remote_put_blob(output.content_hash, &bytes) {
                        tracing::warn!(%err, "remote blob push failed");
                    }
                }
            }
            if let Err(err) = remote.remote_insert(key, &entry) {
                tracing::warn!(%err, "remote entry push failed");
            }
        }

        self.maybe_evict();
        Ok(())
    }

    fn insert_local(&self, key: ActionKey, entry: CacheEntry) -> Result<()> {
        persist::append_record(&self.root.join("index"), key, &entry)?;
        self.index.insert(key, entry);
        Ok(())
    }

    /// Places an entry's outputs on disk under `dest_dir`, relative to each output's
    /// recorded path.
    pub fn materialize(&self, entry: &CacheEntry, dest_dir: &Path) -> Result<()> {
        for output in &entry.outputs {
            let dest = dest_dir.join(&output.relative_path);
            self.blobs
                .materialize(output.content_hash, &dest, output.executable)?;
        }
        Ok(())
    }

    /// Re-hashes every stored blob referenced from the index and reports any whose content
    /// no longer matches its digest. Read-only; does not mutate the cache.
    pub fn verify(&self, hasher: &ContentHasher) -> Result<Vec<ActionKey>> {
        let mut corrupt = Vec::new();
        for (key, entry) in self.index.snapshot() {
            for output in &entry.outputs {
                if !self.blobs.verify(output.content_hash, hasher)? {
                    corrupt.push(key);
                    break;
                }
            }
        }
        Ok(corrupt)
    }

    /// Reconciles the index against the blob store and evicts down to budget: drops index
    /// entries whose blobs are missing or corrupt, removes blobs with no referencing entry,
    /// and compacts each shard's on-disk log. Intended to run on startup and periodically in
    /// the background, never on the probe/insert hot path.
    pub fn sweep(&self, hasher: &ContentHasher) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let snapshot = self.index.snapshot();
        let mut referenced = std::collections::HashSet::new();

        for (key, entry) in &snapshot {
            let mut ok = true;
            for output in &entry.outputs {
                if !self.blobs.verify(output.content_hash, hasher).unwrap_or(false) {
                    ok = false;
                    break;
                }
                let _ = referenced.insert(output.content_hash);
            }
            if !ok {
                let _ = self.index.remove(key);
                report.entries_dropped += 1;
            }
        }

        for digest in self.blobs.all_digests() {
            if !referenced.contains(&digest) {
                self.blobs.remove(digest)?;
                report.blobs_removed += 1;
            }
        }

        self.compact_all()?;
        self.maybe_evict();
        Ok(report)
    }

    fn compact_all(&self) -> Result<()> {
        let snapshot = self.index.snapshot();
        let mut by_shard: std::collections::HashMap<usize, Vec<(ActionKey, CacheEntry)>> =
            std::collections::HashMap::new();
        for (key, entry) in snapshot {
            by_shard.entry((key.0 .0[0] as usize) % 64).or_default().push((key, entry));
        }
        for (shard, live) in by_shard {
            persist::compact_shard(&self.root.join("index"), shard, &live)?;
        }
        Ok(())
    }

    /// Evicts until the entry-count, total-byte, and age budgets are all satisfied (§4.3).
    /// Entries past `max_age_secs` are evicted unconditionally; the rest are evicted in
    /// descending score order until the count and byte budgets hold.
    fn maybe_evict(&self) {
        let snapshot = self.index.snapshot();
        let now = now_unix();

        let mut total_bytes: u64 = 0;
        let mut scored: Vec<(f64, u64, bool, ActionKey)> = Vec::with_capacity(snapshot.len());
        for (key, entry) in &snapshot {
            let age = (now - entry.last_access_unix).max(0) as f64;
            let size: u64 = entry.outputs.iter().map(|o| o.size).sum();
            total_bytes += size;
            let aged_out = self
                .budget
                .max_age_secs
                .map(|max_age| age as u64 > max_age)
                .unwrap_or(false);
            let score = self.weights.alpha * age
                + self.weights.beta * (1.0 / size as f64)
                + self.weights.gamma * (1.0 / entry.hit_count as f64);
            scored.push((score, size, aged_out, *key));
        }

        let over_count = snapshot.len() > self.budget.max_entries;
        let over_bytes = total_bytes > self.budget.max_total_bytes;
        let any_aged_out = scored.iter().any(|(_, _, aged_out, _)| *aged_out);
        if !over_count && !over_bytes && !any_aged_out {
            return;
        }

        // Aged-out entries sort first regardless of score; among the rest, highest score
        // (oldest/largest/coldest) is evicted first.
        scored.sort_by(|a, b| {
            b.2.cmp(&a.2)
                .then_with(|| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal))
        });

        let mut count = snapshot.len();
        let mut bytes = total_bytes;
        for (_, size, aged_out, key) in scored {
            if !aged_out && count <= self.budget.max_entries && bytes <= self.budget.max_total_bytes
            {
                break;
            }
            if let Some(entry) = self.index.remove(&key) {
                for output in entry.outputs {
                    let _ = self.blobs.remove(output.content_hash);
                }
                count -= 1;
                bytes = bytes.saturating_sub(size);
                tracing::debug!(key = %key, "evicted cache entry over budget");
            }
        }
    }

    /// Total number of entries currently indexed.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Digest derivation helper for target-level keys, delegating to [`target_key`].
    pub fn target_key(&self, hasher: &ContentHasher, action_keys: &[ActionKey]) -> Digest {
        target_key(hasher, action_keys)
    }
}

/// Outcome of a [`ActionCache::sweep`] pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    /// Index entries dropped because their blobs were missing or failed re-verification.
    pub entries_dropped: usize,
    /// Orphan blobs removed because no surviving index entry referenced them.
    pub blobs_removed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use builder_core::model::{Digest as Dig, ExecutionMetadata, OutputRecord};
    use std::path::PathBuf as PB;

    fn make_entry(hasher: &ContentHasher, content: &[u8]) -> (CacheEntry, Digest) {
        let digest = hasher.hash_bytes(content);
        let entry = CacheEntry {
            outputs: vec![OutputRecord {
                relative_path: PB::from("out.txt"),
                content_hash: digest,
                size: content.len() as u64,
                executable: false,
            }],
            execution_metadata: ExecutionMetadata {
                wall_time_ms: 5,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                peak_memory_bytes: None,
            },
            success: true,
            schema_version: 1,
            last_access_unix: 0,
            hit_count: 0,
        };
        (entry, digest)
    }

    #[test]
    fn insert_then_probe_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("out.txt"), b"hello").unwrap();

        let cache = ActionCache::open(dir.path().to_path_buf()).unwrap();
        let hasher = ContentHasher::default();
        let (entry, _digest) = make_entry(&hasher, b"hello");
        let key = ActionKey(Dig::ZERO);

        cache.insert(key, entry, source.path()).unwrap();
        let probed = cache.probe(key).unwrap();
        assert!(probed.is_some());
    }

    #[test]
    fn probe_miss_on_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ActionCache::open(dir.path().to_path_buf()).unwrap();
        assert!(cache.probe(ActionKey(Dig::ZERO)).unwrap().is_none());
    }

    #[test]
    fn dangling_entry_degrades_to_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("out.txt"), b"hello").unwrap();

        let cache = ActionCache::open(dir.path().to_path_buf()).unwrap();
        let hasher = ContentHasher::default();
        let (entry, digest) = make_entry(&hasher, b"hello");
        let key = ActionKey(Dig::ZERO);
        cache.insert(key, entry, source.path()).unwrap();

        cache.blobs.remove(digest).unwrap();
        assert!(cache.probe(key).unwrap().is_none());
    }

    #[test]
    fn reopen_replays_persisted_index() {
        let dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("out.txt"), b"hello").unwrap();

        {
            let cache = ActionCache::open(dir.path().to_path_buf()).unwrap();
            let hasher = ContentHasher::default();
            let (entry, _digest) = make_entry(&hasher, b"hello");
            cache.insert(ActionKey(Dig::ZERO), entry, source.path()).unwrap();
        }

        let reopened = ActionCache::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn sweep_drops_entries_with_missing_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("out.txt"), b"hello").unwrap();

        let cache = ActionCache::open(dir.path().to_path_buf()).unwrap();
        let hasher = ContentHasher::default();
        let (entry, digest) = make_entry(&hasher, b"hello");
        let key = ActionKey(Dig::ZERO);
        cache.insert(key, entry, source.path()).unwrap();
        cache.blobs.remove(digest).unwrap();

        let report = cache.sweep(&hasher).unwrap();
        assert_eq!(report.entries_dropped, 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn eviction_respects_entry_count_budget() {
        let dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("out.txt"), b"a").unwrap();

        let cache = ActionCache::open(dir.path().to_path_buf())
            .unwrap()
            .with_budget(CacheBudget {
                max_entries: 1,
                max_total_bytes: u64::MAX,
                max_age_secs: None,
            });
        let hasher = ContentHasher::default();
        let key_old = ActionKey(Dig([1u8; 32]));
        let key_new = ActionKey(Dig([2u8; 32]));

        // `insert` always stamps `last_access_unix` to the current time, so the first
        // entry is backdated directly in the index (after its own insert, which does not
        // yet exceed the budget) to give eviction an unambiguous choice once the second
        // insert pushes the count over budget.
        let (entry_old, _) = make_entry(&hasher, b"a");
        cache.insert(key_old, entry_old, source.path()).unwrap();
        let mut stale = cache.index.get(&key_old).unwrap();
        stale.last_access_unix = now_unix() - 1000;
        cache.index.insert(key_old, stale);

        let (entry_new, _) = make_entry(&hasher, b"a");
        cache.insert(key_new, entry_new, source.path()).unwrap();

        assert_eq!(cache.len(), 1);
        assert!(cache.probe(key_new).unwrap().is_some());
        assert!(cache.probe(key_old).unwrap().is_none());
    }

    #[test]
    fn eviction_respects_total_byte_budget() {
        let dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("out.txt"), b"payload-bytes").unwrap();

        let cache = ActionCache::open(dir.path().to_path_buf())
            .unwrap()
            .with_budget(CacheBudget {
                max_entries: 100,
                max_total_bytes: "payload-bytes".len() as u64,
                max_age_secs: None,
            });
        let hasher = ContentHasher::default();
        let key_a = ActionKey(Dig([1u8; 32]));
        let key_b = ActionKey(Dig([2u8; 32]));

        let (entry_a, _) = make_entry(&hasher, b"payload-bytes");
        cache.insert(key_a, entry_a, source.path()).unwrap();
        assert_eq!(cache.len(), 1);
        let mut stale = cache.index.get(&key_a).unwrap();
        stale.last_access_unix = now_unix() - 1000;
        cache.index.insert(key_a, stale);

        let (entry_b, _) = make_entry(&hasher, b"payload-bytes");
        cache.insert(key_b, entry_b, source.path()).unwrap();

        // Total bytes across both entries exceeds the budget, so the older one is evicted.
        assert_eq!(cache.len(), 1);
        assert!(cache.probe(key_b).unwrap().is_some());
    }

    #[test]
    fn eviction_removes_entries_past_max_age_even_under_other_budgets() {
        let dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("out.txt"), b"a").unwrap();

        let cache = ActionCache::open(dir.path().to_path_buf())
            .unwrap()
            .with_budget(CacheBudget {
                max_entries: 100,
                max_total_bytes: u64::MAX,
                max_age_secs: Some(10),
            });
        let hasher = ContentHasher::default();
        let key = ActionKey(Dig([1u8; 32]));
        let (entry, _) = make_entry(&hasher, b"a");
        cache.insert(key, entry, source.path()).unwrap();

        // Backdate the entry past the age budget directly in the index, then force a sweep.
        let mut stale = cache.index.get(&key).unwrap();
        stale.last_access_unix = now_unix() - 1000;
        cache.index.insert(key, stale);
        cache.maybe_evict();

        assert_eq!(cache.len(), 0);
    }

    struct MockRemote {
        blobs: parking_lot::Mutex<std::collections::HashMap<Digest, Vec<u8>>>,
    }

    impl RemoteCacheTransport for MockRemote {
        fn remote_probe(&self, _key: ActionKey) -> Result<Option<CacheEntry>> {
            Ok(None)
        }
        fn remote_insert(&self, _key: ActionKey, _entry: &CacheEntry) -> Result<()> {
            Ok(())
        }
        fn remote_get_blob(&self, digest: Digest) -> Result<Vec<u8>> {
            Ok(self.blobs.lock().get(&digest).cloned().unwrap_or_default())
        }
        fn remote_put_blob(&self, _digest: Digest, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn remote_blob_pull_rejects_content_that_does_not_match_its_digest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ActionCache::open(dir.path().to_path_buf()).unwrap();
        let hasher = ContentHasher::default();
        let claimed_digest = hasher.hash_bytes(b"expected content");

        let mut tampered = std::collections::HashMap::new();
        let _ = tampered.insert(claimed_digest, b"tampered bytes".to_vec());
        let remote = MockRemote {
            blobs: parking_lot::Mutex::new(tampered),
        };

        let entry = CacheEntry {
            outputs: vec![OutputRecord {
                relative_path: PB::from("out.txt"),
                content_hash: claimed_digest,
                size: 14,
                executable: false,
            }],
            execution_metadata: ExecutionMetadata {
                wall_time_ms: 1,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                peak_memory_bytes: None,
            },
            success: true,
            schema_version: 1,
            last_access_unix: 0,
            hit_count: 0,
        };

        let err = cache.pull_remote_blobs(&remote, &entry).unwrap_err();
        assert!(matches!(err, CacheError::Corruption(_)));
        assert!(!cache.blobs.contains(claimed_digest));
    }
}
