/// Cache replacement for query caches.
///
/// The replacement policy decides which cached queries to drop once a
/// collection's cache grows past `try_to_keep_max`. It never touches a query
/// that has active subscribers.
///
/// The policy does not run inline with the activity that grows the cache.
/// [`ReplacementTimer`] debounces it: the first write arms a timer, further
/// writes while it is armed are ignored, and the policy runs once when the
/// timer fires.
use crate::config::{CacheConfig, DEFAULT_TRY_TO_KEEP_MAX, DEFAULT_UNEXECUTED_LIFETIME};
use crate::query_cache::{CachedQuery, QueryCache};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Strategy for evicting cached queries.
pub trait CacheReplacementPolicy: Send + Sync {
    /// Evict from `cache`, treating `now` (ms) as the current time. Returns
    /// the evicted handles.
    fn run(&self, cache: &mut QueryCache, now: i64) -> Vec<Arc<CachedQuery>>;
}

/// The default policy.
///
/// 1. Does nothing while the cache holds fewer than `try_to_keep_max` queries.
/// 2. Only queries without subscribers are candidates.
/// 3. Candidates that were never evaluated and are older than
///    `unexecuted_lifetime` are evicted right away.
/// 4. If more than `try_to_keep_max` candidates remain, the least recently
///    evaluated ones are evicted (insertion order breaks ties).
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultReplacementPolicy {
    pub try_to_keep_max: usize,
    pub unexecuted_lifetime: Duration,
}

impl Default for DefaultReplacementPolicy {
    fn default() -> Self {
        Self {
            try_to_keep_max: DEFAULT_TRY_TO_KEEP_MAX,
            unexecuted_lifetime: DEFAULT_UNEXECUTED_LIFETIME,
        }
    }
}

impl DefaultReplacementPolicy {
    pub fn new(try_to_keep_max: usize, unexecuted_lifetime: Duration) -> Self {
        Self {
            try_to_keep_max,
            unexecuted_lifetime,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.try_to_keep_max, config.unexecuted_lifetime)
    }
}

impl CacheReplacementPolicy for DefaultReplacementPolicy {
    fn run(&self, cache: &mut QueryCache, now: i64) -> Vec<Arc<CachedQuery>> {
        if cache.len() < self.try_to_keep_max {
            return Vec::new();
        }

        let min_unexecuted_created_at = now - self.unexecuted_lifetime.as_millis() as i64;
        let mut evicted = Vec::new();
        let mut candidates = Vec::new();

        for handle in cache.handles() {
            if handle.subscriber_count() > 0 {
                continue;
            }
            if !handle.is_evaluated() && handle.created_at() < min_unexecuted_created_at {
                cache.uncache(&handle);
                evicted.push(handle);
                continue;
            }
            candidates.push(handle);
        }

        let must_evict = candidates.len().saturating_sub(self.try_to_keep_max);
        if must_evict == 0 {
            return evicted;
        }

        // Stable sort: equal timestamps keep insertion order. Never-evaluated
        // handles sort first.
        candidates.sort_by_key(|h| h.last_evaluated());
        for handle in candidates.into_iter().take(must_evict) {
            cache.uncache(&handle);
            evicted.push(handle);
        }

        evicted
    }
}

/// Debounced one-shot timer, one per collection.
#[derive(Default)]
pub struct ReplacementTimer {
    pending: Arc<Mutex<Option<JoinHandle<()>>>>,
    cancelled: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ReplacementTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer. Returns false if it was already armed or cancelled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm<F>(&self, delay: Duration, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        let mut pending = lock(&self.pending);
        if pending.is_some() {
            return false;
        }

        let slot = Arc::clone(&self.pending);
        let cancelled = Arc::clone(&self.cancelled);
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Clear the armed state before running so the job may re-arm.
            lock(&slot).take();
            if !cancelled.load(Ordering::SeqCst) {
                job();
            }
        }));
        true
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.pending).is_some()
    }

    /// Cancel the pending run and refuse any further arming.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = lock(&self.pending).take() {
            handle.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ReplacementTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplacementTimer")
            .field("armed", &self.is_armed())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use crate::query_cache::QuerySubscription;
    use std::sync::atomic::AtomicUsize;

    fn fill(cache: &mut QueryCache, count: usize, created_at: i64) -> Vec<Arc<CachedQuery>> {
        (0..count)
            .map(|i| cache.get_by_query_at(&Query::new().limit(i), created_at))
            .collect()
    }

    #[test]
    fn test_below_threshold_is_noop() {
        let mut cache = QueryCache::new();
        fill(&mut cache, 3, 0);
        let policy = DefaultReplacementPolicy::new(4, Duration::from_millis(10));
        assert!(policy.run(&mut cache, 1_000_000).is_empty());
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_evicts_least_recently_evaluated() {
        let mut cache = QueryCache::new();
        let handles = fill(&mut cache, 3, 1_000);
        handles[0].mark_evaluated(10);
        handles[1].mark_evaluated(20);
        handles[2].mark_evaluated(30);

        let policy = DefaultReplacementPolicy::new(2, Duration::from_secs(30));
        let evicted = policy.run(&mut cache, 2_000);

        assert_eq!(evicted.len(), 1);
        assert!(Arc::ptr_eq(&evicted[0], &handles[0]));
        assert!(handles[0].is_uncached());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_old_unevaluated_evicted_regardless_of_max() {
        let mut cache = QueryCache::new();
        let stale = cache.get_by_query_at(&Query::new().limit(1), 0);
        let fresh = cache.get_by_query_at(&Query::new().limit(2), 50_000);

        // Threshold reached, but candidates (2) do not exceed try_to_keep_max (2).
        let policy = DefaultReplacementPolicy::new(2, Duration::from_secs(30));
        let evicted = policy.run(&mut cache, 60_000);

        assert_eq!(evicted.len(), 1);
        assert!(Arc::ptr_eq(&evicted[0], &stale));
        assert!(cache.contains(&fresh));
    }

    #[test]
    fn test_subscribed_never_evicted() {
        let mut cache = QueryCache::new();
        let handles = fill(&mut cache, 4, 0);
        let _guards: Vec<QuerySubscription> = handles
            .iter()
            .map(|h| QuerySubscription::new(h.clone()))
            .collect();

        let policy = DefaultReplacementPolicy::new(0, Duration::from_millis(0));
        assert!(policy.run(&mut cache, i64::MAX / 2).is_empty());
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let mut cache = QueryCache::new();
        let handles = fill(&mut cache, 3, 1_000);
        for h in &handles {
            h.mark_evaluated(500);
        }

        let policy = DefaultReplacementPolicy::new(1, Duration::from_secs(30));
        let evicted = policy.run(&mut cache, 2_000);
        assert_eq!(evicted.len(), 2);
        assert!(Arc::ptr_eq(&evicted[0], &handles[0]));
        assert!(Arc::ptr_eq(&evicted[1], &handles[1]));
        assert!(cache.contains(&handles[2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_debounces() {
        let timer = ReplacementTimer::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let runs = runs.clone();
            timer.arm(Duration::from_millis(100), move || {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());

        // Can be armed again after firing.
        let again = runs.clone();
        assert!(timer.arm(Duration::from_millis(100), move || {
            again.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let timer = ReplacementTimer::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        timer.arm(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();

        let counter = runs.clone();
        assert!(!timer.arm(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
