/// Database instances.
///
/// A [`Database`] ties the pieces together: it claims its (name, adapter)
/// identity, bootstraps the storage token, owns the change-event bus and the
/// write queue, starts the broadcast coordinator when several instances may
/// share the storage, and manages the collections.
///
/// Collection bookkeeping lives in the internal store: one record per
/// (collection, schema version) with id `{name}-{version}` holding the
/// schema hash. A collection may be re-opened with a different schema only
/// while its storage is still empty.
///
/// # Example
///
/// ```ignore
/// use koru_reactive::prelude::*;
///
/// let storage = MemoryStorage::new();
/// let db = Database::builder("shop")
///     .adapter(Arc::new(storage.clone()))
///     .create()
///     .await?;
///
/// let products = db
///     .collection(CollectionDescriptor::new("products").schema(json!({"version": 0})))
///     .await?;
/// products.insert(json!({"id": "p1", "price": 10})).await?;
///
/// db.destroy().await;
/// ```
use crate::cache_replacement::{CacheReplacementPolicy, DefaultReplacementPolicy};
use crate::change_event::ChangeEvent;
use crate::collection::{Collection, CollectionDescriptor, CollectionParts};
use crate::config::{CacheConfig, DatabaseConfig};
use crate::error::{ReactiveError, ReactiveResult};
use crate::event_bus::{ChangeEventBus, EventFilter, SubscriptionId};
use crate::hooks::Hooks;
use crate::multi_instance::{BroadcastCoordinator, ensure_storage_token};
use crate::registry;
use crate::schema::Schema;
use crate::storage::{Document, MemoryStorage, StorageAdapter, StorageInstance};
use crate::transport::{BroadcastTransport, InProcessTransport};
use crate::types::random_token;
use crate::write_queue::WriteQueue;
use futures::future::BoxFuture;
use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Id of the internal record of one collection version.
fn collection_record_id(name: &str, version: u32) -> String {
    format!("{}-{}", name, version)
}

/// Internal documents that are not collection records.
fn is_local_document(id: &str) -> bool {
    id.starts_with("_local/")
}

/// Collection name and schema version stored in a collection record.
fn record_identity(record: &Document) -> Option<(String, u32)> {
    let name = record.data.get("name")?.as_str()?.to_string();
    let version = u32::try_from(record.data.get("version")?.as_u64()?).ok()?;
    Some((name, version))
}

fn schema_hash_of(record: &Document) -> &str {
    record
        .data
        .get("schemaHash")
        .and_then(|h| h.as_str())
        .unwrap_or_default()
}

fn collection_record(name: &str, schema: &Schema) -> JsonValue {
    json!({
        "name": name,
        "schemaHash": schema.hash(),
        "schema": schema.normalized(),
        "version": schema.version(),
    })
}

/// Builder for [`Database`].
pub struct DatabaseBuilder {
    config: DatabaseConfig,
    adapter: Option<Arc<dyn StorageAdapter>>,
    transport: Option<Arc<dyn BroadcastTransport>>,
    hooks: Hooks,
}

impl DatabaseBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            config: DatabaseConfig::new(name),
            adapter: None,
            transport: None,
            hooks: Hooks::new(),
        }
    }

    /// Replace the whole config (the name included).
    pub fn config(mut self, config: DatabaseConfig) -> Self {
        self.config = config;
        self
    }

    pub fn multi_instance(mut self, enabled: bool) -> Self {
        self.config.multi_instance = enabled;
        self
    }

    pub fn ignore_duplicate(mut self, enabled: bool) -> Self {
        self.config.ignore_duplicate = enabled;
        self
    }

    pub fn channel_close_grace(mut self, grace: Duration) -> Self {
        self.config.channel_close_grace = grace;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn options(mut self, options: JsonValue) -> Self {
        self.config.options = options;
        self
    }

    /// Storage adapter. Defaults to a fresh [`MemoryStorage`].
    pub fn adapter(mut self, adapter: Arc<dyn StorageAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Broadcast transport. Defaults to [`InProcessTransport::global`].
    pub fn transport(mut self, transport: Arc<dyn BroadcastTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Create the database instance.
    pub async fn create(self) -> ReactiveResult<Database> {
        let adapter = self
            .adapter
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(InProcessTransport::global()));
        Database::create(self.config, adapter, transport, self.hooks).await
    }
}

/// Create a database with the given adapter, the global in-process
/// transport and no hooks.
pub async fn create_database(
    config: DatabaseConfig,
    adapter: Arc<dyn StorageAdapter>,
) -> ReactiveResult<Database> {
    Database::builder(config.name.clone())
        .config(config)
        .adapter(adapter)
        .create()
        .await
}

/// Delete every stored collection and the internal store of a database.
///
/// Meant for databases that are not open; open instances should use
/// [`Database::remove`].
pub async fn remove_database(name: &str, adapter: &dyn StorageAdapter) -> ReactiveResult<()> {
    let internal = adapter.create_internal_instance(name).await?;
    let records = internal.all_documents().await?;
    for record in records.iter().filter(|d| !is_local_document(&d.id)) {
        let Some((collection, version)) = record_identity(record) else {
            tracing::warn!(database = %name, record = %record.id, "Skipping unreadable collection record");
            continue;
        };
        let storage = adapter
            .create_storage_instance(name, &collection, version)
            .await?;
        storage.destroy().await?;
    }
    internal.destroy().await?;
    tracing::debug!(database = %name, "Database removed");
    Ok(())
}

/// Number of live database instances in this process.
pub fn database_count() -> usize {
    registry::database_count()
}

struct DatabaseInner {
    config: DatabaseConfig,
    adapter: Arc<dyn StorageAdapter>,
    adapter_name: String,
    token: String,
    storage_token: String,
    internal: Arc<dyn StorageInstance>,
    bus: Arc<ChangeEventBus>,
    queue: WriteQueue,
    hooks: Hooks,
    coordinator: Option<Arc<BroadcastCoordinator>>,
    collections: RwLock<HashMap<String, Collection>>,
    destroyed: AtomicBool,
}

/// A database instance. Clones share the same instance.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Start building a database called `name`.
    pub fn builder(name: impl Into<String>) -> DatabaseBuilder {
        DatabaseBuilder::new(name)
    }

    async fn create(
        config: DatabaseConfig,
        adapter: Arc<dyn StorageAdapter>,
        transport: Arc<dyn BroadcastTransport>,
        hooks: Hooks,
    ) -> ReactiveResult<Self> {
        config.validate()?;
        hooks.run_pre_create_database(&config)?;

        let adapter_name = adapter.name().to_string();
        registry::claim(&config.name, &adapter_name, config.ignore_duplicate)?;

        let name = config.name.clone();
        let db = match Self::open(config, adapter, transport.as_ref(), hooks).await {
            Ok(db) => db,
            Err(e) => {
                registry::release(&name, &adapter_name);
                return Err(e);
            }
        };
        registry::database_created();

        if let Err(e) = db.inner.hooks.run_create_database(&db).await {
            db.destroy().await;
            return Err(e);
        }

        tracing::debug!(
            database = %db.name(),
            adapter = %db.inner.adapter_name,
            token = %db.token(),
            multi_instance = db.is_multi_instance(),
            "Database created"
        );
        Ok(db)
    }

    async fn open(
        config: DatabaseConfig,
        adapter: Arc<dyn StorageAdapter>,
        transport: &dyn BroadcastTransport,
        hooks: Hooks,
    ) -> ReactiveResult<Self> {
        let internal = adapter.create_internal_instance(&config.name).await?;
        let queue = WriteQueue::new();

        let bootstrap = Arc::clone(&internal);
        let storage_token = queue
            .locked_run(move || async move { ensure_storage_token(&bootstrap).await })
            .await?;

        let token = random_token();
        let bus = Arc::new(ChangeEventBus::new(token.clone()));
        let coordinator = if config.multi_instance {
            Some(
                BroadcastCoordinator::start(
                    &config.name,
                    token.clone(),
                    storage_token.clone(),
                    transport,
                    &bus,
                    config.channel_close_grace,
                )
                .await,
            )
        } else {
            None
        };

        let adapter_name = adapter.name().to_string();
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                config,
                adapter,
                adapter_name,
                token,
                storage_token,
                internal,
                bus,
                queue,
                hooks,
                coordinator,
                collections: RwLock::new(HashMap::new()),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    fn collections(&self) -> RwLockReadGuard<'_, HashMap<String, Collection>> {
        self.inner
            .collections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn collections_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Collection>> {
        self.inner
            .collections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self) -> ReactiveResult<()> {
        if self.is_destroyed() {
            return Err(ReactiveError::DatabaseDestroyed {
                name: self.name().to_string(),
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Name of the storage adapter; part of the database's identity.
    pub fn adapter_name(&self) -> &str {
        &self.inner.adapter_name
    }

    /// Random token of this instance, stamped on every local change event.
    pub fn token(&self) -> &str {
        &self.inner.token
    }

    /// Token persisted in the storage; equal for all instances sharing it.
    pub fn storage_token(&self) -> &str {
        &self.inner.storage_token
    }

    pub fn is_multi_instance(&self) -> bool {
        self.inner.config.multi_instance
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// The broadcast coordinator, present only in multi-instance mode.
    pub fn coordinator(&self) -> Option<&Arc<BroadcastCoordinator>> {
        self.inner.coordinator.as_ref()
    }

    /// Create (or re-open) a collection.
    ///
    /// Fails if the name is reserved or taken, if no schema is given, or if
    /// a different schema was recorded for this version and the stored
    /// collection already holds documents.
    pub async fn collection(
        &self,
        mut descriptor: CollectionDescriptor,
    ) -> ReactiveResult<Collection> {
        self.ensure_open()?;
        self.inner.hooks.run_pre_create_collection(&mut descriptor)?;

        let name = descriptor.name.clone();
        if name.starts_with('_') {
            return Err(ReactiveError::ReservedCollectionName { name });
        }
        if self.collections().contains_key(&name) {
            return Err(ReactiveError::CollectionExists { name });
        }
        let definition = descriptor
            .schema
            .as_ref()
            .ok_or_else(|| ReactiveError::MissingSchema { name: name.clone() })?;
        let schema = Schema::create(definition)?;

        let record_id = collection_record_id(&name, schema.version());
        let internal = Arc::clone(&self.inner.internal);
        let lookup_id = record_id.clone();
        let existing = self
            .inner
            .queue
            .locked_run(move || async move { internal.get(&lookup_id).await })
            .await?;

        let storage = self
            .inner
            .adapter
            .create_storage_instance(self.name(), &name, schema.version())
            .await?;

        let mut record_stale = existing.is_none();
        if let Some(record) = &existing {
            let previous_hash = schema_hash_of(record);
            if previous_hash != schema.hash() {
                if storage.has_documents().await? {
                    return Err(ReactiveError::SchemaHashMismatch {
                        name,
                        previous_hash: previous_hash.to_string(),
                        schema_hash: schema.hash().to_string(),
                    });
                }
                record_stale = true;
            }
        }

        let policy: Arc<dyn CacheReplacementPolicy> = match descriptor.cache_replacement_policy {
            Some(policy) => policy,
            None => Arc::new(DefaultReplacementPolicy::from_config(&self.inner.config.cache)),
        };
        let collection = Collection::new(
            name.clone(),
            CollectionParts {
                database_name: self.name().to_string(),
                schema: schema.clone(),
                storage,
                bus: Arc::clone(&self.inner.bus),
                token: self.inner.token.clone(),
                policy,
                replacement_wait: self.inner.config.cache.replacement_wait,
            },
        );

        {
            // Another call may have created the same collection meanwhile.
            let mut collections = self.collections_mut();
            if collections.contains_key(&name) {
                collection.destroy();
                return Err(ReactiveError::CollectionExists { name });
            }
            collections.insert(name.clone(), collection.clone());
        }

        if record_stale {
            let internal = Arc::clone(&self.inner.internal);
            let mut record = Document::new(record_id, collection_record(&name, &schema));
            record.rev = existing.and_then(|r| r.rev);
            let written = self
                .inner
                .queue
                .locked_run(move || async move { internal.put(record).await })
                .await;
            if let Err(e) = written {
                // Another instance wrote the record first.
                tracing::trace!(collection = %name, error = %e, "Collection record not written");
            }
        }

        tracing::debug!(
            database = %self.name(),
            collection = %name,
            version = schema.version(),
            "Collection created"
        );
        Ok(collection)
    }

    pub fn get_collection(&self, name: &str) -> Option<Collection> {
        self.collections().get(name).cloned()
    }

    /// Names of the open collections, sorted.
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections().keys().cloned().collect();
        names.sort();
        names
    }

    /// Destroy a collection and delete its records and stored documents, for
    /// every schema version that was ever recorded.
    pub async fn remove_collection(&self, name: &str) -> ReactiveResult<()> {
        self.ensure_open()?;
        let live = self.collections_mut().remove(name);
        if let Some(collection) = &live {
            collection.destroy();
        }

        let internal = Arc::clone(&self.inner.internal);
        let target = name.to_string();
        let versions = self
            .inner
            .queue
            .locked_run(move || async move {
                let mut versions = Vec::new();
                for record in internal.all_documents().await? {
                    if is_local_document(&record.id) {
                        continue;
                    }
                    let Some((collection, version)) = record_identity(&record) else {
                        continue;
                    };
                    if collection != target {
                        continue;
                    }
                    if let Some(rev) = &record.rev {
                        internal.remove(&record.id, rev).await?;
                    }
                    versions.push(version);
                }
                Ok(versions)
            })
            .await?;

        for version in versions {
            let adapter = Arc::clone(&self.inner.adapter);
            let database = self.name().to_string();
            let collection = name.to_string();
            self.inner
                .queue
                .locked_run(move || async move {
                    let storage = adapter
                        .create_storage_instance(&database, &collection, version)
                        .await?;
                    storage.destroy().await
                })
                .await?;
        }

        // A live collection whose version has no record still owns storage.
        if let Some(collection) = live {
            let storage = Arc::clone(collection.storage());
            self.inner
                .queue
                .locked_run(move || async move { storage.destroy().await })
                .await?;
        }

        tracing::debug!(database = %self.name(), collection = %name, "Collection removed");
        Ok(())
    }

    /// Delete every collection record from the internal store. Stored
    /// documents are left in place. Returns the number of records deleted.
    pub async fn dangerous_remove_collection_info(&self) -> ReactiveResult<usize> {
        self.ensure_open()?;
        let internal = Arc::clone(&self.inner.internal);
        self.inner
            .queue
            .locked_run(move || async move {
                let mut removed = 0;
                for record in internal.all_documents().await? {
                    if is_local_document(&record.id) {
                        continue;
                    }
                    if let Some(rev) = &record.rev {
                        internal.remove(&record.id, rev).await?;
                        removed += 1;
                    }
                }
                Ok(removed)
            })
            .await
    }

    /// Emit a change event on this instance's bus. `None` is ignored.
    ///
    /// Events carrying this instance's token are also sent to the other
    /// instances when multi-instance mode is on.
    pub fn emit(&self, event: impl Into<Option<ChangeEvent>>) {
        self.inner.bus.emit(event);
    }

    /// Receive matching change events through a channel.
    pub fn changes(
        &self,
        filter: EventFilter,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<ChangeEvent>) {
        self.inner.bus.subscribe_channel(filter)
    }

    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(filter, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(id)
    }

    /// Send an event to the other instances without emitting it locally.
    ///
    /// Returns `Ok(false)` when nothing was sent: the database is not in
    /// multi-instance mode, the event is local-only, or the channel is
    /// unavailable.
    pub async fn send_to_others(&self, event: &ChangeEvent) -> ReactiveResult<bool> {
        match &self.inner.coordinator {
            Some(coordinator) if self.is_multi_instance() => {
                coordinator.send_to_others(event).await
            }
            _ => Ok(false),
        }
    }

    /// Run `op` on the internal write queue, after every operation queued
    /// before it.
    pub fn locked_run<F, Fut, T>(&self, op: F) -> BoxFuture<'static, ReactiveResult<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ReactiveResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.inner.queue.locked_run(op)
    }

    /// Wait until the write queue has drained.
    pub async fn request_idle(&self) {
        self.inner.queue.await_idle().await;
    }

    /// Shut the instance down. Returns false if it was already destroyed.
    ///
    /// Runs the pre-destroy hooks, stops broadcasting (the channel closes
    /// after the configured grace delay), destroys every collection and
    /// releases the (name, adapter) claim. Stored data is kept.
    pub async fn destroy(&self) -> bool {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.inner.hooks.run_pre_destroy_database(self) {
            tracing::warn!(database = %self.name(), error = %e, "Pre-destroy hook failed");
        }
        registry::database_destroyed();

        if let Some(coordinator) = &self.inner.coordinator {
            coordinator.shutdown();
        }

        self.inner.queue.await_idle().await;

        let collections: Vec<Collection> = self.collections_mut().drain().map(|(_, c)| c).collect();
        for collection in &collections {
            collection.destroy();
        }
        self.inner.bus.close();

        registry::release(self.name(), &self.inner.adapter_name);
        tracing::debug!(database = %self.name(), "Database destroyed");
        true
    }

    /// Destroy the instance and delete all of its stored data.
    pub async fn remove(&self) -> ReactiveResult<()> {
        self.destroy().await;
        remove_database(self.name(), self.inner.adapter.as_ref()).await
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name())
            .field("adapter", &self.inner.adapter_name)
            .field("token", &self.inner.token)
            .field("storage_token", &self.inner.storage_token)
            .field("multi_instance", &self.is_multi_instance())
            .field("collections", &self.collection_names())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
