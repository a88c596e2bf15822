/// Storage collaborator interface and the in-memory reference adapter.
///
/// The reactive layer never persists anything itself. It talks to a
/// [`StorageAdapter`], which hands out [`StorageInstance`]s: one internal
/// metadata store per database plus one store per (collection, schema
/// version). Writes use optimistic revisions: a put must carry the revision
/// it replaces, and a put without a revision only succeeds if the document
/// does not exist yet.
///
/// [`MemoryStorage`] keeps everything in process memory. Every database that
/// is created with the same `MemoryStorage` value shares the same physical
/// storage (and therefore the same storage token), which is how several
/// instances of one database are simulated inside a single process.
use crate::error::{ReactiveError, ReactiveResult};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// A stored document with its current revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document identifier (primary key).
    pub id: String,
    /// Revision token, `None` for documents that were never stored.
    pub rev: Option<String>,
    /// Document body.
    pub data: JsonValue,
}

impl Document {
    /// A new, not yet stored document.
    pub fn new(id: impl Into<String>, data: JsonValue) -> Self {
        Self {
            id: id.into(),
            rev: None,
            data,
        }
    }

    /// Set the revision this write replaces.
    pub fn with_rev(mut self, rev: impl Into<String>) -> Self {
        self.rev = Some(rev.into());
        self
    }
}

/// One physical store (a collection version or the internal metadata store).
#[async_trait]
pub trait StorageInstance: Send + Sync {
    /// Fetch a document by id.
    async fn get(&self, id: &str) -> ReactiveResult<Option<Document>>;

    /// Write a document. Returns the stored document with its new revision.
    ///
    /// Fails with [`ReactiveError::DocumentConflict`] if the revision does not
    /// match the stored one.
    async fn put(&self, document: Document) -> ReactiveResult<Document>;

    /// Remove a document at the given revision.
    async fn remove(&self, id: &str, rev: &str) -> ReactiveResult<()>;

    /// Enumerate all documents.
    async fn all_documents(&self) -> ReactiveResult<Vec<Document>>;

    /// Whether the store holds at least one document.
    async fn has_documents(&self) -> ReactiveResult<bool> {
        Ok(!self.all_documents().await?.is_empty())
    }

    /// Delete the store and everything in it.
    async fn destroy(&self) -> ReactiveResult<()>;
}

/// Factory for storage instances. The adapter name is part of a database's
/// identity: the same (database name, adapter name) pair may only be open
/// once per process unless duplicates are explicitly allowed.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Adapter identity.
    fn name(&self) -> &str;

    /// Open the store of one collection at one schema version.
    async fn create_storage_instance(
        &self,
        database: &str,
        collection: &str,
        version: u32,
    ) -> ReactiveResult<Arc<dyn StorageInstance>>;

    /// Open the internal metadata store of a database.
    async fn create_internal_instance(
        &self,
        database: &str,
    ) -> ReactiveResult<Arc<dyn StorageInstance>>;
}

/// Compute the next revision for a document body.
fn next_revision(previous: Option<&str>, data: &JsonValue) -> String {
    let generation = previous
        .and_then(|rev| rev.split('-').next())
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    let digest = Sha256::digest(data.to_string().as_bytes());
    format!("{}-{}", generation, &hex::encode(digest)[..16])
}

type Locations = DashMap<String, Arc<DashMap<String, Document>>>;

/// In-memory storage adapter.
///
/// Cloning a `MemoryStorage` shares the underlying data.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    locations: Arc<Locations>,
}

impl MemoryStorage {
    /// Create a fresh, empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stores that currently exist.
    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    /// Whether a store exists at the given location.
    pub fn has_location(&self, location: &str) -> bool {
        self.locations.contains_key(location)
    }

    fn open(&self, location: String) -> Arc<dyn StorageInstance> {
        let documents = self
            .locations
            .entry(location.clone())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone();
        Arc::new(MemoryInstance {
            location,
            documents,
            locations: Arc::clone(&self.locations),
        })
    }

    /// Location key of a collection store.
    pub fn collection_location(database: &str, collection: &str, version: u32) -> String {
        format!("{}/{}-{}", database, collection, version)
    }

    /// Location key of a database's internal store.
    pub fn internal_location(database: &str) -> String {
        format!("{}/_internal", database)
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("locations", &self.locations.len())
            .finish()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_storage_instance(
        &self,
        database: &str,
        collection: &str,
        version: u32,
    ) -> ReactiveResult<Arc<dyn StorageInstance>> {
        Ok(self.open(Self::collection_location(database, collection, version)))
    }

    async fn create_internal_instance(
        &self,
        database: &str,
    ) -> ReactiveResult<Arc<dyn StorageInstance>> {
        Ok(self.open(Self::internal_location(database)))
    }
}

struct MemoryInstance {
    location: String,
    documents: Arc<DashMap<String, Document>>,
    locations: Arc<Locations>,
}

#[async_trait]
impl StorageInstance for MemoryInstance {
    async fn get(&self, id: &str) -> ReactiveResult<Option<Document>> {
        Ok(self.documents.get(id).map(|d| d.value().clone()))
    }

    async fn put(&self, document: Document) -> ReactiveResult<Document> {
        match self.documents.entry(document.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().rev.clone();
                if document.rev.is_none() || document.rev != current {
                    return Err(ReactiveError::DocumentConflict { id: document.id });
                }
                let rev = next_revision(current.as_deref(), &document.data);
                let stored = Document {
                    rev: Some(rev),
                    ..document
                };
                occupied.insert(stored.clone());
                Ok(stored)
            }
            Entry::Vacant(vacant) => {
                if document.rev.is_some() {
                    return Err(ReactiveError::DocumentConflict { id: document.id });
                }
                let rev = next_revision(None, &document.data);
                let stored = Document {
                    rev: Some(rev),
                    ..document
                };
                vacant.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn remove(&self, id: &str, rev: &str) -> ReactiveResult<()> {
        match self.documents.entry(id.to_string()) {
            Entry::Occupied(occupied) => {
                if occupied.get().rev.as_deref() != Some(rev) {
                    return Err(ReactiveError::DocumentConflict { id: id.to_string() });
                }
                occupied.remove();
                Ok(())
            }
            Entry::Vacant(_) => Err(ReactiveError::DocumentNotFound { id: id.to_string() }),
        }
    }

    async fn all_documents(&self) -> ReactiveResult<Vec<Document>> {
        Ok(self
            .documents
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn destroy(&self) -> ReactiveResult<()> {
        self.documents.clear();
        self.locations.remove(&self.location);
        Ok(())
    }
}
