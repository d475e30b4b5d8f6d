//! Node cache with get-or-fetch semantics and request coalescing.
//!
//! Resolved nodes are cached under explicit keys:
//!
//! - `Raw` caches a decoded node as stored, independent of time travel.
//!   Branches are always cached raw.
//! - `LeafTRange` caches a leaf materialized as of `to_t`.
//! - `LeafHistoryRange` caches a leaf materialized for `from_t..=to_t`.
//!
//! Materialized keys carry the overlay `epoch`, so a new commit
//! invalidates by key without flushing anything.
//!
//! Coalescing: concurrent `get_or_fetch` calls for one key perform a
//! single storage fetch. Followers wait on a shared in-flight slot. A
//! failed fetch is never cached; followers see the error and future
//! callers retry. An empty leaf that fetched successfully is a valid
//! `Ready` entry, not a miss.

use crate::error::Result;
use crate::index::ResolvedNode;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum CacheKind {
    /// Decoded node as read from storage.
    Raw,
    /// Leaf materialized for a `to_t` ceiling.
    LeafTRange,
    /// Leaf materialized for a `from_t..=to_t` window.
    LeafHistoryRange,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CacheKey {
    pub kind: CacheKind,
    pub node_id: String,
    pub to_t: i64,
    pub from_t: Option<i64>,
    /// Whether the leaf kept every version (history mode). Part of the
    /// key so history and latest-state materializations never mix.
    pub history_mode: bool,
    /// Overlay epoch at materialization time. Always 0 for `Raw`.
    pub epoch: u64,
}

impl CacheKey {
    /// Raw node key: epoch- and time-independent.
    pub fn raw(node_id: impl Into<String>) -> Self {
        Self {
            kind: CacheKind::Raw,
            node_id: node_id.into(),
            to_t: 0,
            from_t: None,
            history_mode: false,
            epoch: 0,
        }
    }

    pub fn leaf_t_range(node_id: impl Into<String>, to_t: i64, epoch: u64, history_mode: bool) -> Self {
        Self {
            kind: CacheKind::LeafTRange,
            node_id: node_id.into(),
            to_t,
            from_t: None,
            history_mode,
            epoch,
        }
    }

    pub fn leaf_history_range(
        node_id: impl Into<String>,
        from_t: i64,
        to_t: i64,
        epoch: u64,
        history_mode: bool,
    ) -> Self {
        Self {
            kind: CacheKind::LeafHistoryRange,
            node_id: node_id.into(),
            to_t,
            from_t: Some(from_t),
            history_mode,
            epoch,
        }
    }
}

/// Get-or-fetch cache for resolved nodes.
///
/// Implementations must deduplicate concurrent fetches per key.
#[async_trait]
pub trait NodeCache: Debug + Send + Sync {
    /// Return the cached node, or run `fetch` once and cache the result.
    async fn get_or_fetch<F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<ResolvedNode>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<ResolvedNode>> + Send;

    fn evict(&self, key: &CacheKey);

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pass-through cache: always fetches.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl NoCache {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NodeCache for NoCache {
    async fn get_or_fetch<F, Fut>(&self, _key: &CacheKey, fetch: F) -> Result<ResolvedNode>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<ResolvedNode>> + Send,
    {
        fetch().await
    }

    fn evict(&self, _key: &CacheKey) {}

    fn clear(&self) {}

    fn len(&self) -> usize {
        0
    }
}

/// Counters for cache behavior, cheap to copy out.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Hits that returned a completed entry immediately.
    pub ready_hits: u64,
    /// Hits that joined an in-flight fetch and waited.
    pub coalesced_hits: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Entry state: completed, or a shared slot the fetching task fills in.
///
/// `futures::lock::Mutex` keeps this runtime-agnostic.
enum CacheEntry {
    Ready(ResolvedNode),
    InFlight(std::sync::Arc<futures::lock::Mutex<Option<Result<ResolvedNode>>>>),
}

impl Clone for CacheEntry {
    fn clone(&self) -> Self {
        match self {
            CacheEntry::Ready(node) => CacheEntry::Ready(node.clone()),
            CacheEntry::InFlight(slot) => CacheEntry::InFlight(slot.clone()),
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheEntry::Ready(node) => f.debug_tuple("Ready").field(node).finish(),
            CacheEntry::InFlight(_) => f.debug_tuple("InFlight").finish(),
        }
    }
}

/// Bounded in-memory cache with single-flight fetch deduplication.
///
/// Eviction removes an arbitrary `Ready` entry when full; in-flight
/// entries are never evicted.
#[derive(Debug)]
pub struct SimpleCache {
    entries: std::sync::RwLock<FxHashMap<CacheKey, CacheEntry>>,
    max_entries: usize,
    stats: std::sync::RwLock<CacheStats>,
}

impl Clone for SimpleCache {
    fn clone(&self) -> Self {
        // Only clone Ready entries, skip InFlight
        let entries = self
            .entries
            .read()
            .unwrap()
            .iter()
            .filter_map(|(k, v)| match v {
                CacheEntry::Ready(node) => Some((k.clone(), CacheEntry::Ready(node.clone()))),
                CacheEntry::InFlight(_) => None,
            })
            .collect();
        Self {
            entries: std::sync::RwLock::new(entries),
            max_entries: self.max_entries,
            stats: std::sync::RwLock::new(*self.stats.read().unwrap()),
        }
    }
}

impl SimpleCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: std::sync::RwLock::new(FxHashMap::default()),
            max_entries,
            stats: std::sync::RwLock::new(CacheStats::default()),
        }
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.read().unwrap()
    }

    pub fn reset_stats(&self) {
        *self.stats.write().unwrap() = CacheStats::default();
    }

    pub fn estimated_size_bytes(&self) -> usize {
        self.entries
            .read()
            .unwrap()
            .values()
            .filter_map(|entry| match entry {
                CacheEntry::Ready(node) => Some(node.size_bytes()),
                CacheEntry::InFlight(_) => None,
            })
            .sum()
    }
}

#[async_trait]
impl NodeCache for SimpleCache {
    async fn get_or_fetch<F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<ResolvedNode>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<ResolvedNode>> + Send,
    {
        // `fetch` is FnOnce but an orphaned in-flight entry forces a retry
        // of the lookup, so keep it in an Option until we become the
        // fetcher.
        let mut fetch = Some(fetch);

        enum Action {
            Hit(ResolvedNode),
            Wait(std::sync::Arc<futures::lock::Mutex<Option<Result<ResolvedNode>>>>),
            Fetch(std::sync::Arc<futures::lock::Mutex<Option<Result<ResolvedNode>>>>),
        }

        loop {
            let action = {
                let mut entries = self.entries.write().unwrap();

                match entries.get(key) {
                    Some(CacheEntry::Ready(node)) => {
                        let mut stats = self.stats.write().unwrap();
                        stats.hits += 1;
                        stats.ready_hits += 1;
                        Action::Hit(node.clone())
                    }
                    Some(CacheEntry::InFlight(slot)) => {
                        let mut stats = self.stats.write().unwrap();
                        stats.hits += 1;
                        stats.coalesced_hits += 1;
                        Action::Wait(slot.clone())
                    }
                    None => {
                        let mut stats = self.stats.write().unwrap();
                        stats.misses += 1;

                        // Evict a Ready entry when full; never an InFlight.
                        if entries.len() >= self.max_entries {
                            let ready_key = entries
                                .iter()
                                .find(|(_, v)| matches!(v, CacheEntry::Ready(_)))
                                .map(|(k, _)| k.clone());
                            if let Some(old_key) = ready_key {
                                entries.remove(&old_key);
                                stats.evictions += 1;
                            }
                        }

                        let slot = std::sync::Arc::new(futures::lock::Mutex::new(None));
                        entries.insert(key.clone(), CacheEntry::InFlight(slot.clone()));
                        Action::Fetch(slot)
                    }
                }
            };

            match action {
                Action::Hit(node) => return Ok(node),
                Action::Wait(slot) => {
                    // The fetching task holds the lock until done.
                    let guard = slot.lock().await;
                    match guard.as_ref() {
                        Some(Ok(node)) => return Ok(node.clone()),
                        Some(Err(e)) => {
                            return Err(crate::error::Error::Storage(e.to_string()))
                        }
                        None => {
                            // Orphaned in-flight: the fetcher was dropped
                            // before filling the slot. Remove the stale
                            // entry if it is still ours, then retry.
                            drop(guard);

                            let mut entries = self.entries.write().unwrap();
                            let stale = matches!(
                                entries.get(key),
                                Some(CacheEntry::InFlight(s)) if std::sync::Arc::ptr_eq(s, &slot)
                            );
                            if stale {
                                entries.remove(key);
                            }
                            continue;
                        }
                    }
                }
                Action::Fetch(slot) => {
                    let mut guard = slot.lock().await;

                    let do_fetch = fetch
                        .take()
                        .expect("SimpleCache fetch invoked more than once");
                    let result = do_fetch().await;

                    match &result {
                        Ok(node) => *guard = Some(Ok(node.clone())),
                        Err(e) => {
                            *guard = Some(Err(crate::error::Error::Storage(e.to_string())))
                        }
                    }
                    drop(guard);

                    match result {
                        Ok(node) => {
                            let mut entries = self.entries.write().unwrap();
                            entries.insert(key.clone(), CacheEntry::Ready(node.clone()));
                            return Ok(node);
                        }
                        Err(e) => {
                            // Never cache failures; later callers retry.
                            let mut entries = self.entries.write().unwrap();
                            entries.remove(key);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    fn evict(&self, key: &CacheKey) {
        if self.entries.write().unwrap().remove(key).is_some() {
            self.stats.write().unwrap().evictions += 1;
        }
    }

    fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|v| matches!(v, CacheEntry::Ready(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::IndexType;
    use crate::index::{IndexNode, ResolvedNode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn dummy_leaf(id: &str) -> ResolvedNode {
        ResolvedNode::leaf(IndexNode::leaf(id.to_string(), IndexType::Spot), Arc::from(vec![]))
    }

    #[tokio::test]
    async fn test_get_or_fetch_caches_result() {
        let cache = SimpleCache::new(16);
        let key = CacheKey::raw("node-1");
        let fetches = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fetches = fetches.clone();
            let node = cache
                .get_or_fetch(&key, move || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(dummy_leaf("node-1"))
                })
                .await
                .unwrap();
            assert_eq!(node.node().id, "node-1");
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_coalesce() {
        let cache = Arc::new(SimpleCache::new(16));
        let key = CacheKey::raw("shared");
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let key = key.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(&key, move || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(dummy_leaf("shared"))
                    })
                    .await
                    .unwrap()
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        // exactly one storage fetch for N concurrent resolves
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_not_cached() {
        let cache = SimpleCache::new(16);
        let key = CacheKey::raw("flaky");

        let err = cache
            .get_or_fetch(&key, || async {
                Err(crate::error::Error::storage("backend down"))
            })
            .await;
        assert!(err.is_err());
        assert_eq!(cache.len(), 0);

        // next caller retries and can succeed
        let node = cache
            .get_or_fetch(&key, || async { Ok(dummy_leaf("flaky")) })
            .await
            .unwrap();
        assert_eq!(node.node().id, "flaky");
    }

    #[tokio::test]
    async fn test_empty_leaf_is_a_valid_entry() {
        let cache = SimpleCache::new(16);
        let key = CacheKey::leaf_t_range("empty-leaf", 5, 1, false);

        cache
            .get_or_fetch(&key, || async { Ok(dummy_leaf("empty-leaf")) })
            .await
            .unwrap();

        // second call hits, even though the leaf holds zero flakes
        let fetched = Arc::new(AtomicUsize::new(0));
        let f2 = fetched.clone();
        cache
            .get_or_fetch(&key, move || async move {
                f2.fetch_add(1, Ordering::SeqCst);
                Ok(dummy_leaf("empty-leaf"))
            })
            .await
            .unwrap();
        assert_eq!(fetched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_eviction_keeps_bound() {
        let cache = SimpleCache::new(2);
        for i in 0..4 {
            let key = CacheKey::raw(format!("node-{i}"));
            cache
                .get_or_fetch(&key, || async move { Ok(dummy_leaf("x")) })
                .await
                .unwrap();
        }
        assert!(cache.len() <= 2);
        assert!(cache.stats().evictions >= 2);
    }

    #[tokio::test]
    async fn test_distinct_epochs_are_distinct_entries() {
        let cache = SimpleCache::new(16);
        let k1 = CacheKey::leaf_t_range("leaf", 5, 1, false);
        let k2 = CacheKey::leaf_t_range("leaf", 5, 2, false);

        let fetches = Arc::new(AtomicUsize::new(0));
        for key in [&k1, &k2] {
            let fetches = fetches.clone();
            cache
                .get_or_fetch(key, move || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(dummy_leaf("leaf"))
                })
                .await
                .unwrap();
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }
}
