/// Instance counting across create and destroy.
///
/// Kept to a single test: the counter is process-wide and other tests in the
/// same binary would race with it.
use koru_reactive::{CollectionDescriptor, Database, MemoryStorage, database_count, json};
use std::sync::Arc;

#[tokio::test]
async fn test_database_count_follows_lifecycle() {
    assert_eq!(database_count(), 0);

    let storage = MemoryStorage::new();
    let a = Database::builder("lifecycle")
        .adapter(Arc::new(storage.clone()))
        .create()
        .await
        .unwrap();
    let b = Database::builder("lifecycle")
        .ignore_duplicate(true)
        .adapter(Arc::new(storage.clone()))
        .create()
        .await
        .unwrap();
    assert_eq!(database_count(), 2);

    // A rejected duplicate does not count.
    let rejected = Database::builder("lifecycle")
        .adapter(Arc::new(storage.clone()))
        .create()
        .await;
    assert!(rejected.is_err());
    assert_eq!(database_count(), 2);

    let products = a
        .collection(CollectionDescriptor::new("products").schema(json!({"version": 0})))
        .await
        .unwrap();

    assert!(a.destroy().await);
    assert_eq!(database_count(), 1);
    assert!(!a.destroy().await);
    assert_eq!(database_count(), 1);
    assert!(products.is_destroyed());

    assert!(b.destroy().await);
    assert_eq!(database_count(), 0);
}
