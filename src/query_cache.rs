/// Per-collection query cache.
///
/// The cache guarantees that for every canonical query string at most one
/// [`CachedQuery`] handle is alive in the cache at any time. Asking for an
/// equivalent query again returns the very same `Arc`, so every consumer of
/// that query shares one result set and one subscriber count.
///
/// Handles leave the cache only through [`QueryCache::uncache`], which the
/// replacement policy calls. An uncached handle keeps working for whoever
/// still holds it, but it is flagged so it can never be put back.
use crate::query::Query;
use crate::storage::Document;
use crate::types::now_millis;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct EvaluationState {
    last_evaluated: Option<i64>,
    results: Option<Vec<Document>>,
    evaluated_version: Option<u64>,
}

/// A cached, result-bearing query.
#[derive(Debug)]
pub struct CachedQuery {
    query: Query,
    canonical: String,
    created_at: i64,
    sequence: u64,
    subscribers: AtomicUsize,
    uncached: AtomicBool,
    state: Mutex<EvaluationState>,
}

impl CachedQuery {
    fn new(query: Query, canonical: String, created_at: i64, sequence: u64) -> Self {
        Self {
            query,
            canonical,
            created_at,
            sequence,
            subscribers: AtomicUsize::new(0),
            uncached: AtomicBool::new(false),
            state: Mutex::new(EvaluationState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, EvaluationState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Cache key of this handle.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Creation time in milliseconds.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Insertion order within the owning cache.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Time of the last evaluation, `None` if never evaluated.
    pub fn last_evaluated(&self) -> Option<i64> {
        self.state().last_evaluated
    }

    pub fn is_evaluated(&self) -> bool {
        self.last_evaluated().is_some()
    }

    /// Number of active observers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    pub(crate) fn add_subscriber(&self) {
        self.subscribers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn remove_subscriber(&self) {
        let _ = self
            .subscribers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Whether this handle was evicted from its cache.
    pub fn is_uncached(&self) -> bool {
        self.uncached.load(Ordering::SeqCst)
    }

    /// Last computed result set.
    pub fn results(&self) -> Option<Vec<Document>> {
        self.state().results.clone()
    }

    /// Collection change version the results were computed at.
    pub fn evaluated_version(&self) -> Option<u64> {
        self.state().evaluated_version
    }

    /// Record a fresh evaluation.
    pub fn set_results(&self, results: Vec<Document>, version: u64, at: i64) {
        let mut state = self.state();
        state.results = Some(results);
        state.evaluated_version = Some(version);
        state.last_evaluated = Some(at);
    }

    /// Record an evaluation time without touching the results.
    pub fn mark_evaluated(&self, at: i64) {
        self.state().last_evaluated = Some(at);
    }
}

/// Keeps one observer registered on a cached query. Dropping the guard
/// releases it.
#[derive(Debug)]
pub struct QuerySubscription {
    handle: Arc<CachedQuery>,
}

impl QuerySubscription {
    pub fn new(handle: Arc<CachedQuery>) -> Self {
        handle.add_subscriber();
        Self { handle }
    }

    pub fn handle(&self) -> &Arc<CachedQuery> {
        &self.handle
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        self.handle.remove_subscriber();
    }
}

/// Map from canonical query string to its cached handle.
#[derive(Debug, Default)]
pub struct QueryCache {
    map: HashMap<String, Arc<CachedQuery>>,
    next_sequence: AtomicU64,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached handle for `query`, creating it on a miss.
    pub fn get_by_query(&mut self, query: &Query) -> Arc<CachedQuery> {
        self.get_by_query_at(query, now_millis())
    }

    /// Same as [`get_by_query`](Self::get_by_query) with an explicit creation time.
    pub fn get_by_query_at(&mut self, query: &Query, now: i64) -> Arc<CachedQuery> {
        let canonical = query.canonical_string();
        let sequence = &self.next_sequence;
        self.map
            .entry(canonical.clone())
            .or_insert_with(|| {
                let seq = sequence.fetch_add(1, Ordering::Relaxed);
                Arc::new(CachedQuery::new(query.clone(), canonical, now, seq))
            })
            .clone()
    }

    /// Evict a handle. Idempotent; the handle stays uncached forever.
    pub fn uncache(&mut self, handle: &Arc<CachedQuery>) {
        handle.uncached.store(true, Ordering::SeqCst);
        if let Some(current) = self.map.get(handle.canonical()) {
            if Arc::ptr_eq(current, handle) {
                self.map.remove(handle.canonical());
            }
        }
    }

    /// Whether this exact handle is the live cache entry.
    pub fn contains(&self, handle: &Arc<CachedQuery>) -> bool {
        self.map
            .get(handle.canonical())
            .is_some_and(|current| Arc::ptr_eq(current, handle))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All cached handles in insertion order.
    pub fn handles(&self) -> Vec<Arc<CachedQuery>> {
        let mut handles: Vec<Arc<CachedQuery>> = self.map.values().cloned().collect();
        handles.sort_by_key(|h| h.sequence());
        handles
    }

    /// Evict everything.
    pub fn clear(&mut self) {
        for handle in self.map.values() {
            handle.uncached.store(true, Ordering::SeqCst);
        }
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Filter;

    #[test]
    fn test_equivalent_queries_share_handle() {
        let mut cache = QueryCache::new();
        let q1 = Query::new()
            .filter(Filter::eq("a", 1))
            .filter(Filter::eq("b", 2));
        let q2 = Query::new()
            .filter(Filter::eq("b", 2))
            .filter(Filter::eq("a", 1));

        let h1 = cache.get_by_query(&q1);
        let h2 = cache.get_by_query(&q2);
        assert!(Arc::ptr_eq(&h1, &h2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_fresh_handle_state() {
        let mut cache = QueryCache::new();
        let handle = cache.get_by_query_at(&Query::new(), 1234);
        assert_eq!(handle.created_at(), 1234);
        assert_eq!(handle.last_evaluated(), None);
        assert_eq!(handle.subscriber_count(), 0);
        assert!(!handle.is_uncached());
    }

    #[test]
    fn test_uncache_is_permanent_and_idempotent() {
        let mut cache = QueryCache::new();
        let query = Query::new().limit(3);
        let old = cache.get_by_query(&query);

        cache.uncache(&old);
        cache.uncache(&old);
        assert!(old.is_uncached());
        assert!(cache.is_empty());

        // A new lookup creates a new handle; the old one is not resurrected.
        let new = cache.get_by_query(&query);
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(old.is_uncached());

        // Uncaching the stale handle again must not evict the new one.
        cache.uncache(&old);
        assert!(cache.contains(&new));
    }

    #[test]
    fn test_subscription_guard_counts() {
        let mut cache = QueryCache::new();
        let handle = cache.get_by_query(&Query::new());

        let first = QuerySubscription::new(handle.clone());
        let second = QuerySubscription::new(handle.clone());
        assert_eq!(handle.subscriber_count(), 2);

        drop(first);
        assert_eq!(handle.subscriber_count(), 1);
        drop(second);
        assert_eq!(handle.subscriber_count(), 0);
    }

    #[test]
    fn test_handles_in_insertion_order() {
        let mut cache = QueryCache::new();
        for i in 0..5 {
            cache.get_by_query(&Query::new().limit(i));
        }
        let limits: Vec<Option<usize>> = cache.handles().iter().map(|h| h.query().limit).collect();
        assert_eq!(limits, vec![Some(0), Some(1), Some(2), Some(3), Some(4)]);
    }
}
