//! # koru-reactive — Reactive Query Cache and Multi-Instance Coordination
//!
//! koru-reactive is the reactive layer of an embedded document database:
//! - **Query cache** - Equivalent queries share one cached, result-bearing handle
//! - **Cache replacement** - Debounced eviction that never drops observed queries
//! - **Change events** - Every write is announced on a local event bus
//! - **Multi-instance** - Instances sharing one storage see each other's writes
//!
//! ## Quick Start
//!
//! ```ignore
//! use koru_reactive::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::builder("shop")
//!         .adapter(Arc::new(MemoryStorage::new()))
//!         .create()
//!         .await?;
//!
//!     let products = db
//!         .collection(CollectionDescriptor::new("products").schema(json!({"version": 0})))
//!         .await?;
//!
//!     // Watch every change to the collection
//!     let (_id, mut changes) = db.changes(EventFilter::collection("products"));
//!
//!     products.insert(json!({"id": "p1", "price": 10})).await?;
//!     let event = changes.recv().await;
//!
//!     // Cached queries
//!     let cheap = products.find(Query::new().filter(Filter::lt("price", 20)));
//!     let _observer = products.observe(&cheap);
//!     let docs = products.exec(&cheap).await?;
//!
//!     db.destroy().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Database** (`database`) - Identity, lifecycle, collections, bookkeeping
//! 2. **Collection** (`collection`) - Document writes, cached queries, freshness
//! 3. **Query cache** (`query_cache`, `cache_replacement`) - Handles and eviction
//! 4. **Event bus** (`event_bus`) - Local, synchronous change delivery
//! 5. **Coordination** (`multi_instance`, `transport`) - Cross-instance broadcast
//!
//! Storage and broadcast transports are traits; [`MemoryStorage`] and
//! [`InProcessTransport`] are the in-process implementations.
//!
//! ## Multiple Instances
//!
//! Several `Database` values opened on the same storage (with
//! `ignore_duplicate` when they live in one process) share a storage token
//! and a broadcast channel. A write on one instance is applied to its own bus
//! immediately and shows up on the others shortly after; an instance never
//! receives its own events back, and instances on a different storage never
//! see them at all.

pub mod cache_replacement;
pub mod change_event;
pub mod collection;
pub mod config;
pub mod database;
pub mod error;
pub mod event_bus;
pub mod hooks;
pub mod multi_instance;
pub mod query;
pub mod query_cache;
pub mod registry;
pub mod schema;
pub mod storage;
pub mod transport;
pub mod types;
pub mod write_queue;

// Public API exports
pub use database::{
    Database, DatabaseBuilder, create_database, database_count, remove_database,
};
pub use error::{ReactiveError, ReactiveResult};

pub use cache_replacement::{CacheReplacementPolicy, DefaultReplacementPolicy, ReplacementTimer};
pub use change_event::{ChangeEvent, Operation};
pub use collection::{Collection, CollectionDescriptor};
pub use config::{CacheConfig, DatabaseConfig};
pub use event_bus::{ChangeEventBus, EventFilter, SubscriptionId};
pub use hooks::Hooks;
pub use multi_instance::{BroadcastCoordinator, BroadcastMessage};
pub use query::{Filter, Query, SortBy, SortOrder};
pub use query_cache::{CachedQuery, QueryCache, QuerySubscription};
pub use schema::Schema;
pub use storage::{Document, MemoryStorage, StorageAdapter, StorageInstance};
pub use transport::{BroadcastChannel, BroadcastTransport, InProcessTransport};
pub use write_queue::WriteQueue;

// Re-export commonly used external types for convenience
pub use chrono::{DateTime, Utc};
pub use serde_json::{Value as JsonValue, json};

/// Prelude module for convenient imports.
///
/// Import everything you need with:
/// ```ignore
/// use koru_reactive::prelude::*;
/// ```
pub mod prelude {
    pub use crate::collection::{Collection, CollectionDescriptor};
    pub use crate::config::{CacheConfig, DatabaseConfig};
    pub use crate::database::{Database, create_database, remove_database};
    pub use crate::error::{ReactiveError, ReactiveResult};
    pub use serde_json::{Value as JsonValue, json};

    // Events
    pub use crate::change_event::{ChangeEvent, Operation};
    pub use crate::event_bus::{EventFilter, SubscriptionId};

    // Queries
    pub use crate::query::{Filter, Query, SortBy, SortOrder};
    pub use crate::query_cache::{CachedQuery, QuerySubscription};

    // Collaborators
    pub use crate::hooks::Hooks;
    pub use crate::storage::{Document, MemoryStorage, StorageAdapter};
    pub use crate::transport::InProcessTransport;
}
