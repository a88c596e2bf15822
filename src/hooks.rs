/// Lifecycle hooks.
///
/// Hooks let an embedding application observe or adjust database and
/// collection creation without subclassing anything. Each hook point holds an
/// ordered list of callbacks; they run in registration order and the first
/// error aborts the step that triggered them.
///
/// | Hook point | Runs | Receives |
/// |---|---|---|
/// | `pre_create_database` | before the name is claimed | `&DatabaseConfig` |
/// | `create_database` | after the instance is fully built (awaited) | `Database` |
/// | `pre_create_collection` | before validation, may edit the descriptor | `&mut CollectionDescriptor` |
/// | `pre_destroy_database` | first step of `destroy` | `&Database` |
///
/// # Example
///
/// ```ignore
/// let hooks = Hooks::new().pre_create_collection(|descriptor| {
///     descriptor.name = descriptor.name.to_lowercase();
///     Ok(())
/// });
/// let db = Database::builder("shop").hooks(hooks).create().await?;
/// ```
use crate::collection::CollectionDescriptor;
use crate::config::DatabaseConfig;
use crate::database::Database;
use crate::error::ReactiveResult;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

pub type PreCreateDatabaseHook = Arc<dyn Fn(&DatabaseConfig) -> ReactiveResult<()> + Send + Sync>;
pub type CreateDatabaseHook =
    Arc<dyn Fn(Database) -> BoxFuture<'static, ReactiveResult<()>> + Send + Sync>;
pub type PreCreateCollectionHook =
    Arc<dyn Fn(&mut CollectionDescriptor) -> ReactiveResult<()> + Send + Sync>;
pub type PreDestroyDatabaseHook = Arc<dyn Fn(&Database) -> ReactiveResult<()> + Send + Sync>;

/// Ordered hook lists for one database.
#[derive(Clone, Default)]
pub struct Hooks {
    pre_create_database: Vec<PreCreateDatabaseHook>,
    create_database: Vec<CreateDatabaseHook>,
    pre_create_collection: Vec<PreCreateCollectionHook>,
    pre_destroy_database: Vec<PreDestroyDatabaseHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pre_create_database<F>(mut self, hook: F) -> Self
    where
        F: Fn(&DatabaseConfig) -> ReactiveResult<()> + Send + Sync + 'static,
    {
        self.pre_create_database.push(Arc::new(hook));
        self
    }

    pub fn create_database<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Database) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReactiveResult<()>> + Send + 'static,
    {
        let hook: CreateDatabaseHook =
            Arc::new(move |db: Database| -> BoxFuture<'static, ReactiveResult<()>> {
                hook(db).boxed()
            });
        self.create_database.push(hook);
        self
    }

    pub fn pre_create_collection<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut CollectionDescriptor) -> ReactiveResult<()> + Send + Sync + 'static,
    {
        self.pre_create_collection.push(Arc::new(hook));
        self
    }

    pub fn pre_destroy_database<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Database) -> ReactiveResult<()> + Send + Sync + 'static,
    {
        self.pre_destroy_database.push(Arc::new(hook));
        self
    }

    /// Total number of registered hooks.
    pub fn len(&self) -> usize {
        self.pre_create_database.len()
            + self.create_database.len()
            + self.pre_create_collection.len()
            + self.pre_destroy_database.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn run_pre_create_database(&self, config: &DatabaseConfig) -> ReactiveResult<()> {
        for hook in &self.pre_create_database {
            hook(config)?;
        }
        Ok(())
    }

    pub(crate) async fn run_create_database(&self, db: &Database) -> ReactiveResult<()> {
        for hook in &self.create_database {
            hook(db.clone()).await?;
        }
        Ok(())
    }

    pub(crate) fn run_pre_create_collection(
        &self,
        descriptor: &mut CollectionDescriptor,
    ) -> ReactiveResult<()> {
        for hook in &self.pre_create_collection {
            hook(descriptor)?;
        }
        Ok(())
    }

    pub(crate) fn run_pre_destroy_database(&self, db: &Database) -> ReactiveResult<()> {
        for hook in &self.pre_destroy_database {
            hook(db)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("pre_create_database", &self.pre_create_database.len())
            .field("create_database", &self.create_database.len())
            .field("pre_create_collection", &self.pre_create_collection.len())
            .field("pre_destroy_database", &self.pre_destroy_database.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReactiveError;
    use std::sync::Mutex;

    #[test]
    fn test_pre_create_database_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = log.clone();
        let second = log.clone();
        let hooks = Hooks::new()
            .pre_create_database(move |config| {
                first.lock().unwrap().push(format!("first {}", config.name));
                Ok(())
            })
            .pre_create_database(move |_| {
                second.lock().unwrap().push("second".to_string());
                Ok(())
            });

        hooks
            .run_pre_create_database(&DatabaseConfig::new("shop"))
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first shop", "second"]);
        assert_eq!(hooks.len(), 2);
    }

    #[test]
    fn test_error_stops_remaining_hooks() {
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let hooks = Hooks::new()
            .pre_create_database(|_| Err(ReactiveError::Hook("rejected".to_string())))
            .pre_create_database(move |_| {
                *flag.lock().unwrap() = true;
                Ok(())
            });

        let result = hooks.run_pre_create_database(&DatabaseConfig::new("shop"));
        assert!(matches!(result, Err(ReactiveError::Hook(_))));
        assert!(!*ran.lock().unwrap());
    }

    #[test]
    fn test_pre_create_collection_can_edit_descriptor() {
        let hooks = Hooks::new().pre_create_collection(|descriptor| {
            descriptor.name = descriptor.name.to_lowercase();
            Ok(())
        });
        let mut descriptor = CollectionDescriptor::new("Products");
        hooks.run_pre_create_collection(&mut descriptor).unwrap();
        assert_eq!(descriptor.name, "products");
    }
}
