//! The target cache (D, §4.4): a thin layer over the action cache keyed by the combined
//! identity of a target's full action set, enabling a "nothing to do" fast path that skips
//! per-action probing entirely when the whole target was built before with these exact
//! actions.
//!
//! `target_key = H(sorted(action_keys))` — sorting makes the key independent of discovery
//! or scheduling order, matching the graph's own canonicalization in
//! `BuildGraph::topological_sort`.

use builder_core::model::{ActionKey, Digest};
use builder_hash::ContentHasher;

/// Derives the target-level cache key from the full set of action keys a target resolved
/// to, including any actions added by dynamic discovery.
pub fn target_key(hasher: &ContentHasher, action_keys: &[ActionKey]) -> Digest {
    let mut sorted: Vec<ActionKey> = action_keys.to_vec();
    sorted.sort_by(|a, b| a.0.to_hex().cmp(&b.0.to_hex()));
    let labels: Vec<String> = (0..sorted.len()).map(|i| i.to_string()).collect();
    hasher.hash_composite(
        labels
            .iter()
            .zip(sorted.iter())
            .map(|(label, key)| (label.as_str(), key.0)),
    )
}

/// Tracks which target keys are known-good from a prior build, backing the null-build fast
/// path: if every action a target currently resolves to matches the recorded set bit for
/// bit, the whole target can be skipped without touching the action cache at all.
///
/// Kept intentionally dumb — a `HashSet` of digests, no eviction of its own. Any anomaly
/// (a key not found here) just means "fall through to the action cache", never an error.
#[derive(Default)]
pub struct TargetCache {
    known_good: std::collections::HashSet<Digest>,
}

impl TargetCache {
    /// Builds an empty target cache.
    pub fn new() -> Self {
        TargetCache::default()
    }

    /// Whether `key` is a known-good target digest from a previous successful build.
    pub fn is_known_good(&self, key: Digest) -> bool {
        self.known_good.contains(&key)
    }

    /// Records `key` as known-good after every constituent action hit or was freshly
    /// inserted into the action cache successfully.
    pub fn mark_known_good(&mut self, key: Digest) {
        let _ = self.known_good.insert(key);
    }

    /// Drops a target key, e.g. when one of its actions misses or a dependency changed.
    pub fn invalidate(&mut self, key: Digest) {
        let _ = self.known_good.remove(&key);
    }

    /// Number of known-good target keys currently tracked.
    pub fn len(&self) -> usize {
        self.known_good.len()
    }

    /// Whether no target keys are currently tracked.
    pub fn is_empty(&self) -> bool {
        self.known_good.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use builder_core::model::Digest as Dig;

    #[test]
    fn target_key_is_independent_of_input_order() {
        let hasher = ContentHasher::default();
        let a = ActionKey(Dig([1u8; 32]));
        let b = ActionKey(Dig([2u8; 32]));
        assert_eq!(
            target_key(&hasher, &[a, b]),
            target_key(&hasher, &[b, a])
        );
    }

    #[test]
    fn unknown_key_is_not_known_good() {
        let cache = TargetCache::new();
        assert!(!cache.is_known_good(Digest::ZERO));
    }

    #[test]
    fn mark_then_invalidate_roundtrips() {
        let mut cache = TargetCache::new();
        cache.mark_known_good(Digest::ZERO);
        assert!(cache.is_known_good(Digest::ZERO));
        cache.invalidate(Digest::ZERO);
        assert!(!cache.is_known_good(Digest::ZERO));
    }
}
