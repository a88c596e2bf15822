/// Property tests for the query cache and the default replacement policy.
use koru_reactive::{
    CacheReplacementPolicy, CachedQuery, DefaultReplacementPolicy, Filter, Query, QueryCache,
    QuerySubscription,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Entry {
    created_at: i64,
    evaluated_at: Option<i64>,
    subscribed: bool,
}

fn entry_strategy() -> impl Strategy<Value = Entry> {
    (0i64..100_000, proptest::option::of(0i64..100_000), any::<bool>()).prop_map(
        |(created_at, evaluated_at, subscribed)| Entry {
            created_at,
            evaluated_at,
            subscribed,
        },
    )
}

fn build(entries: &[Entry]) -> (QueryCache, Vec<Arc<CachedQuery>>, Vec<QuerySubscription>) {
    let mut cache = QueryCache::new();
    let mut handles = Vec::new();
    let mut guards = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        let handle = cache.get_by_query_at(&Query::new().skip(i + 1), entry.created_at);
        if let Some(at) = entry.evaluated_at {
            handle.mark_evaluated(at);
        }
        if entry.subscribed {
            guards.push(QuerySubscription::new(handle.clone()));
        }
        handles.push(handle);
    }
    (cache, handles, guards)
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

    #[test]
    fn subscribed_handles_are_never_evicted(
        entries in proptest::collection::vec(entry_strategy(), 0..40),
        max in 0usize..12,
        lifetime_ms in 0u64..60_000,
        now in 0i64..200_000,
    ) {
        let (mut cache, handles, _guards) = build(&entries);
        let policy = DefaultReplacementPolicy::new(max, Duration::from_millis(lifetime_ms));
        let evicted = policy.run(&mut cache, now);

        for handle in &evicted {
            prop_assert_eq!(handle.subscriber_count(), 0);
            prop_assert!(handle.is_uncached());
            prop_assert!(!cache.contains(handle));
        }
        for (entry, handle) in entries.iter().zip(&handles) {
            if entry.subscribed {
                prop_assert!(cache.contains(handle));
            }
        }
        prop_assert_eq!(cache.len() + evicted.len(), entries.len());
    }

    #[test]
    fn unsubscribed_survivors_fit_the_limit(
        entries in proptest::collection::vec(entry_strategy(), 0..40),
        max in 0usize..12,
        now in 0i64..200_000,
    ) {
        let (mut cache, _handles, _guards) = build(&entries);
        let before = cache.len();
        let policy = DefaultReplacementPolicy::new(max, Duration::from_secs(30));
        policy.run(&mut cache, now);

        let unsubscribed = cache
            .handles()
            .iter()
            .filter(|h| h.subscriber_count() == 0)
            .count();
        if before >= max {
            prop_assert!(unsubscribed <= max);
        } else {
            prop_assert_eq!(cache.len(), before);
        }
    }

    #[test]
    fn filter_order_does_not_change_the_handle(
        values in proptest::collection::vec(0i64..1000, 1..6),
    ) {
        let mut cache = QueryCache::new();
        let forward = values
            .iter()
            .enumerate()
            .fold(Query::new(), |q, (i, v)| q.filter(Filter::eq(format!("f{}", i), *v)));
        let backward = values
            .iter()
            .enumerate()
            .rev()
            .fold(Query::new(), |q, (i, v)| q.filter(Filter::eq(format!("f{}", i), *v)));

        let a = cache.get_by_query(&forward);
        let b = cache.get_by_query(&backward);
        prop_assert!(Arc::ptr_eq(&a, &b));
        prop_assert_eq!(cache.len(), 1);
    }
}
