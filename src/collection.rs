/// Collections: documents, cached queries and their freshness.
///
/// A collection owns one storage instance, one [`QueryCache`] and one
/// [`ReplacementTimer`]. Every write through the collection emits a change
/// event on the database bus; the collection itself listens on that bus and
/// bumps a change version for every event of its own name, whether the event
/// was produced here or arrived from another instance. A cached query
/// remembers the version it was evaluated at, so [`Collection::exec`] only
/// goes back to storage after a relevant change.
///
/// # Example
///
/// ```ignore
/// let products = db
///     .collection(CollectionDescriptor::new("products").schema(json!({"version": 0})))
///     .await?;
/// products.insert(json!({"id": "p1", "price": 10})).await?;
///
/// let cheap = products.find(Query::new().filter(Filter::lt("price", 20)));
/// let _observer = products.observe(&cheap);
/// let docs = products.exec(&cheap).await?;
/// ```
use crate::cache_replacement::{CacheReplacementPolicy, ReplacementTimer};
use crate::change_event::ChangeEvent;
use crate::error::{ReactiveError, ReactiveResult};
use crate::event_bus::{ChangeEventBus, EventFilter, SubscriptionId};
use crate::query::Query;
use crate::query_cache::{CachedQuery, QueryCache, QuerySubscription};
use crate::schema::Schema;
use crate::storage::{Document, StorageInstance};
use crate::types::now_millis;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;

/// What to create: a name, a schema, and optionally a custom eviction policy.
#[derive(Clone)]
pub struct CollectionDescriptor {
    pub name: String,
    pub schema: Option<JsonValue>,
    /// Replaces the database's default replacement policy for this collection.
    pub cache_replacement_policy: Option<Arc<dyn CacheReplacementPolicy>>,
}

impl CollectionDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            cache_replacement_policy: None,
        }
    }

    pub fn schema(mut self, schema: JsonValue) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn cache_replacement_policy(mut self, policy: Arc<dyn CacheReplacementPolicy>) -> Self {
        self.cache_replacement_policy = Some(policy);
        self
    }
}

impl std::fmt::Debug for CollectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionDescriptor")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field(
                "custom_policy",
                &self.cache_replacement_policy.is_some(),
            )
            .finish()
    }
}

/// Everything a collection needs from its database.
pub(crate) struct CollectionParts {
    pub database_name: String,
    pub schema: Schema,
    pub storage: Arc<dyn StorageInstance>,
    pub bus: Arc<ChangeEventBus>,
    pub token: String,
    pub policy: Arc<dyn CacheReplacementPolicy>,
    pub replacement_wait: Duration,
}

struct CollectionInner {
    name: String,
    database_name: String,
    schema: Schema,
    storage: Arc<dyn StorageInstance>,
    bus: Arc<ChangeEventBus>,
    token: String,
    cache: Mutex<QueryCache>,
    policy: Arc<dyn CacheReplacementPolicy>,
    replacement_wait: Duration,
    timer: ReplacementTimer,
    version: Arc<watch::Sender<u64>>,
    subscription: SubscriptionId,
    destroyed: AtomicBool,
}

impl CollectionInner {
    fn cache(&self) -> MutexGuard<'_, QueryCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_cache_replacement(&self) -> Vec<Arc<CachedQuery>> {
        let evicted = self.policy.run(&mut self.cache(), now_millis());
        if !evicted.is_empty() {
            tracing::debug!(
                collection = %self.name,
                evicted = evicted.len(),
                "Evicted cached queries"
            );
        }
        evicted
    }
}

/// A live collection handle. Clones share the same collection.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl Collection {
    pub(crate) fn new(name: String, parts: CollectionParts) -> Self {
        let (version, _) = watch::channel(0u64);
        let version = Arc::new(version);

        let bump = Arc::clone(&version);
        let subscription = parts
            .bus
            .subscribe(EventFilter::collection(name.clone()), move |_event| {
                bump.send_modify(|v| *v += 1);
            });

        Self {
            inner: Arc::new(CollectionInner {
                name,
                database_name: parts.database_name,
                schema: parts.schema,
                storage: parts.storage,
                bus: parts.bus,
                token: parts.token,
                cache: Mutex::new(QueryCache::new()),
                policy: parts.policy,
                replacement_wait: parts.replacement_wait,
                timer: ReplacementTimer::new(),
                version,
                subscription,
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn database_name(&self) -> &str {
        &self.inner.database_name
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub(crate) fn storage(&self) -> &Arc<dyn StorageInstance> {
        &self.inner.storage
    }

    fn ensure_alive(&self) -> ReactiveResult<()> {
        if self.is_destroyed() {
            return Err(ReactiveError::CollectionDestroyed {
                name: self.inner.name.clone(),
            });
        }
        Ok(())
    }

    fn primary_of(&self, data: &JsonValue) -> ReactiveResult<String> {
        self.inner
            .schema
            .primary_of(data)
            .ok_or_else(|| ReactiveError::MissingPrimaryKey {
                collection: self.inner.name.clone(),
                primary_key: self.inner.schema.primary_key().to_string(),
            })
    }

    /// Current change version. Increases with every change event of this
    /// collection seen on the bus.
    pub fn change_version(&self) -> u64 {
        *self.inner.version.borrow()
    }

    /// Watch the change version, e.g. to re-run observed queries.
    pub fn changed(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    /// Store a new document and emit an insert event.
    pub async fn insert(&self, data: JsonValue) -> ReactiveResult<Document> {
        self.ensure_alive()?;
        let id = self.primary_of(&data)?;
        let start = Utc::now();
        let stored = self.inner.storage.put(Document::new(id.clone(), data)).await?;

        let event = ChangeEvent::insert(
            self.inner.name.clone(),
            id,
            stored.data.clone(),
            self.inner.token.clone(),
        )
        .with_times(start, Utc::now());
        self.inner.bus.emit(event);
        self.trigger_cache_replacement();
        Ok(stored)
    }

    /// Insert the document, or replace the stored one with the same primary
    /// key and emit an update event.
    pub async fn upsert(&self, data: JsonValue) -> ReactiveResult<Document> {
        self.ensure_alive()?;
        let id = self.primary_of(&data)?;
        let Some(previous) = self.inner.storage.get(&id).await? else {
            return self.insert(data).await;
        };

        let start = Utc::now();
        let stored = self
            .inner
            .storage
            .put(Document {
                id: id.clone(),
                rev: previous.rev.clone(),
                data,
            })
            .await?;

        let event = ChangeEvent::update(
            self.inner.name.clone(),
            id,
            stored.data.clone(),
            previous.data,
            self.inner.token.clone(),
        )
        .with_times(start, Utc::now());
        self.inner.bus.emit(event);
        self.trigger_cache_replacement();
        Ok(stored)
    }

    /// Delete a document and emit a delete event. Returns the removed
    /// document.
    pub async fn remove(&self, id: &str) -> ReactiveResult<Document> {
        self.ensure_alive()?;
        let previous = self
            .inner
            .storage
            .get(id)
            .await?
            .ok_or_else(|| ReactiveError::DocumentNotFound { id: id.to_string() })?;
        let rev = previous
            .rev
            .clone()
            .ok_or_else(|| ReactiveError::DocumentConflict { id: id.to_string() })?;

        let start = Utc::now();
        self.inner.storage.remove(id, &rev).await?;

        let event = ChangeEvent::delete(
            self.inner.name.clone(),
            id,
            previous.data.clone(),
            self.inner.token.clone(),
        )
        .with_times(start, Utc::now());
        self.inner.bus.emit(event);
        self.trigger_cache_replacement();
        Ok(previous)
    }

    pub async fn find_one(&self, id: &str) -> ReactiveResult<Option<Document>> {
        self.ensure_alive()?;
        self.inner.storage.get(id).await
    }

    /// The cached handle for `query`. Equivalent queries share one handle.
    pub fn find(&self, query: Query) -> Arc<CachedQuery> {
        let handle = self.inner.cache().get_by_query(&query);
        self.trigger_cache_replacement();
        handle
    }

    /// Results of a cached query, recomputed only if the collection changed
    /// since the last evaluation.
    pub async fn exec(&self, handle: &Arc<CachedQuery>) -> ReactiveResult<Vec<Document>> {
        self.ensure_alive()?;
        let version = self.change_version();
        if handle.evaluated_version() == Some(version) {
            if let Some(results) = handle.results() {
                handle.mark_evaluated(now_millis());
                return Ok(results);
            }
        }

        let documents = self.inner.storage.all_documents().await?;
        let results = handle.query().execute(documents);
        handle.set_results(results.clone(), version, now_millis());
        tracing::trace!(
            collection = %self.inner.name,
            query = %handle.canonical(),
            results = results.len(),
            "Evaluated query"
        );
        Ok(results)
    }

    /// Register an observer on a cached query. The handle is protected from
    /// eviction until the returned guard is dropped.
    pub fn observe(&self, handle: &Arc<CachedQuery>) -> QuerySubscription {
        QuerySubscription::new(Arc::clone(handle))
    }

    /// Number of cached queries.
    pub fn cache_len(&self) -> usize {
        self.inner.cache().len()
    }

    /// Whether `handle` is the live cache entry for its query.
    pub fn is_cached(&self, handle: &Arc<CachedQuery>) -> bool {
        self.inner.cache().contains(handle)
    }

    /// Run the replacement policy now. Returns the evicted handles.
    pub fn run_cache_replacement(&self) -> Vec<Arc<CachedQuery>> {
        self.inner.run_cache_replacement()
    }

    /// Schedule a debounced replacement run. Returns false if one is already
    /// scheduled or the collection is destroyed.
    pub fn trigger_cache_replacement(&self) -> bool {
        let weak: Weak<CollectionInner> = Arc::downgrade(&self.inner);
        self.inner.timer.arm(self.inner.replacement_wait, move || {
            if let Some(inner) = weak.upgrade() {
                inner.run_cache_replacement();
            }
        })
    }

    pub fn is_replacement_armed(&self) -> bool {
        self.inner.timer.is_armed()
    }

    /// Stop the collection: cancel the replacement timer, stop tracking
    /// changes and drop the cache. Returns false if already destroyed.
    pub fn destroy(&self) -> bool {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.timer.cancel();
        self.inner.bus.unsubscribe(self.inner.subscription);
        self.inner.cache().clear();
        tracing::debug!(collection = %self.inner.name, "Collection destroyed");
        true
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.inner.name)
            .field("database", &self.inner.database_name)
            .field("version", &self.inner.schema.version())
            .field("cached_queries", &self.cache_len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_replacement::DefaultReplacementPolicy;
    use crate::change_event::Operation;
    use crate::query::Filter;
    use crate::storage::{MemoryStorage, StorageAdapter};
    use serde_json::json;

    async fn collection_with(wait: Duration, max: usize) -> (Collection, Arc<ChangeEventBus>) {
        let bus = Arc::new(ChangeEventBus::new("tok"));
        let storage = MemoryStorage::new()
            .create_storage_instance("db", "products", 0)
            .await
            .unwrap();
        let collection = Collection::new(
            "products".to_string(),
            CollectionParts {
                database_name: "db".to_string(),
                schema: Schema::create(&json!({"version": 0})).unwrap(),
                storage,
                bus: bus.clone(),
                token: "tok".to_string(),
                policy: Arc::new(DefaultReplacementPolicy::new(
                    max,
                    Duration::from_secs(30),
                )),
                replacement_wait: wait,
            },
        );
        (collection, bus)
    }

    async fn collection() -> (Collection, Arc<ChangeEventBus>) {
        collection_with(Duration::from_secs(20), 100).await
    }

    #[tokio::test]
    async fn test_writes_emit_events() {
        let (products, bus) = collection().await;
        let (_, mut rx) = bus.subscribe_channel(EventFilter::collection("products"));

        products.insert(json!({"id": "p1", "price": 10})).await.unwrap();
        products.upsert(json!({"id": "p1", "price": 12})).await.unwrap();
        products.remove("p1").await.unwrap();

        let ops: Vec<Operation> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.operation())
            .collect();
        assert_eq!(ops, vec![Operation::Insert, Operation::Update, Operation::Delete]);
    }

    #[tokio::test]
    async fn test_update_carries_previous_data() {
        let (products, bus) = collection().await;
        products.insert(json!({"id": "p1", "price": 10})).await.unwrap();

        let (_, mut rx) = bus.subscribe_channel(EventFilter::all());
        products.upsert(json!({"id": "p1", "price": 12})).await.unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.previous_data(), Some(&json!({"id": "p1", "price": 10})));
        assert_eq!(event.document_data(), Some(&json!({"id": "p1", "price": 12})));
        assert_eq!(event.origin_token(), "tok");
    }

    #[tokio::test]
    async fn test_missing_primary_key() {
        let (products, _) = collection().await;
        let result = products.insert(json!({"price": 10})).await;
        assert!(matches!(result, Err(ReactiveError::MissingPrimaryKey { .. })));
    }

    #[tokio::test]
    async fn test_exec_recomputes_only_after_change() {
        let (products, _) = collection().await;
        products.insert(json!({"id": "a", "price": 5})).await.unwrap();
        products.insert(json!({"id": "b", "price": 50})).await.unwrap();

        let cheap = products.find(Query::new().filter(Filter::lt("price", 20)));
        let first = products.exec(&cheap).await.unwrap();
        assert_eq!(first.len(), 1);
        let evaluated_at = cheap.evaluated_version();

        // No change in between: same version, cached results.
        products.exec(&cheap).await.unwrap();
        assert_eq!(cheap.evaluated_version(), evaluated_at);

        products.insert(json!({"id": "c", "price": 1})).await.unwrap();
        let second = products.exec(&cheap).await.unwrap();
        assert_eq!(second.len(), 2);
        assert_ne!(cheap.evaluated_version(), evaluated_at);
    }

    #[tokio::test]
    async fn test_foreign_collection_events_do_not_bump_version() {
        let (products, bus) = collection().await;
        let before = products.change_version();
        bus.emit(ChangeEvent::insert("orders", "o1", json!({}), "other"));
        assert_eq!(products.change_version(), before);
        bus.emit(ChangeEvent::insert("products", "p9", json!({}), "other"));
        assert_eq!(products.change_version(), before + 1);
    }

    #[tokio::test]
    async fn test_find_shares_handles() {
        let (products, _) = collection().await;
        let a = products.find(Query::new().filter(Filter::eq("x", 1)));
        let b = products.find(Query::new().filter(Filter::eq("x", 1)));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(products.cache_len(), 1);
        assert!(products.is_replacement_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_runs_after_wait() {
        let (products, _) = collection_with(Duration::from_millis(100), 0).await;
        let kept = products.find(Query::new().limit(1));
        let _observer = products.observe(&kept);
        products.find(Query::new().limit(2));
        products.find(Query::new().limit(3));
        assert_eq!(products.cache_len(), 3);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(products.cache_len(), 1);
        assert!(products.is_cached(&kept));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_timer() {
        let (products, bus) = collection_with(Duration::from_millis(100), 0).await;
        let handle = products.find(Query::new());
        assert!(products.is_replacement_armed());
        let subscribers = bus.subscriber_count();

        assert!(products.destroy());
        assert!(!products.destroy());
        assert!(!products.trigger_cache_replacement());
        assert_eq!(bus.subscriber_count(), subscribers - 1);
        assert!(handle.is_uncached());

        let result = products.insert(json!({"id": "late"})).await;
        assert!(matches!(result, Err(ReactiveError::CollectionDestroyed { .. })));
    }
}
