/// Error types for koru-reactive operations.
///
/// Identity and definition conflicts carry enough context (names, hashes)
/// to be diagnosed without looking at cache internals. Benign conditions such
/// as the storage-token bootstrap race or foreign broadcast messages never
/// surface as errors.
use thiserror::Error;

/// The main error type for koru-reactive operations.
#[derive(Error, Debug)]
pub enum ReactiveError {
    /// A database with the same name and adapter is already open in this process
    #[error(
        "Database '{name}' is already open with adapter '{adapter}' (set ignore_duplicate to allow this)"
    )]
    NameAdapterInUse {
        /// Database name
        name: String,
        /// Storage adapter name
        adapter: String,
    },

    /// Collection names starting with `_` are reserved for internal use
    #[error("Collection name '{name}' is reserved (names must not start with '_')")]
    ReservedCollectionName {
        /// The rejected collection name
        name: String,
    },

    /// A collection with this name already exists on the database
    #[error("Collection '{name}' already exists")]
    CollectionExists {
        /// The duplicate collection name
        name: String,
    },

    /// A collection was requested without a schema
    #[error("Collection '{name}' has no schema")]
    MissingSchema {
        /// The collection name
        name: String,
    },

    /// The schema differs from the stored one and the collection already holds documents
    #[error(
        "Collection '{name}' already exists with schema hash '{previous_hash}' and contains documents; new schema hash is '{schema_hash}'"
    )]
    SchemaHashMismatch {
        /// The collection name
        name: String,
        /// Hash recorded when the collection was first created
        previous_hash: String,
        /// Hash of the schema passed now
        schema_hash: String,
    },

    /// The schema definition could not be normalized
    #[error("Invalid schema: {reason}")]
    InvalidSchema {
        /// Why the schema was rejected
        reason: String,
    },

    /// The database instance has already been destroyed
    #[error("Database '{name}' is destroyed")]
    DatabaseDestroyed {
        /// Database name
        name: String,
    },

    /// The collection was destroyed or removed from its database
    #[error("Collection '{name}' is destroyed")]
    CollectionDestroyed {
        /// The collection name
        name: String,
    },

    /// A write carried a stale or missing revision
    #[error("Document '{id}' conflicts with the stored revision")]
    DocumentConflict {
        /// Document identifier
        id: String,
    },

    /// Document does not exist
    #[error("Document '{id}' not found")]
    DocumentNotFound {
        /// Document identifier
        id: String,
    },

    /// A document is missing its primary key field
    #[error("Document for collection '{collection}' is missing primary key '{primary_key}'")]
    MissingPrimaryKey {
        /// The collection name
        collection: String,
        /// The primary key field from the schema
        primary_key: String,
    },

    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Broadcast channel failure
    #[error("Channel error: {0}")]
    Channel(String),

    /// A hook rejected the operation
    #[error("Hook error: {0}")]
    Hook(String),

    /// Configuration is not usable
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the problem
        reason: String,
    },

    /// A background task failed unexpectedly
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for koru-reactive operations.
pub type ReactiveResult<T> = Result<T, ReactiveError>;
