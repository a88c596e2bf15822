/// Process-wide bookkeeping of open databases.
///
/// A (database name, adapter name) pair identifies one physical database.
/// Opening the same pair twice in one process is refused unless the second
/// instance explicitly allows duplicates; the check and the insertion happen
/// under one lock so concurrent creations cannot both pass.
use crate::error::{ReactiveError, ReactiveResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{LazyLock, Mutex, MutexGuard};

static USED_COMBINATIONS: LazyLock<Mutex<HashMap<String, Vec<String>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static DATABASE_COUNT: AtomicUsize = AtomicUsize::new(0);

fn combinations() -> MutexGuard<'static, HashMap<String, Vec<String>>> {
    USED_COMBINATIONS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Record that `name` is being opened with `adapter`.
pub(crate) fn claim(name: &str, adapter: &str, ignore_duplicate: bool) -> ReactiveResult<()> {
    let mut used = combinations();
    let adapters = used.entry(name.to_string()).or_default();
    if !ignore_duplicate && adapters.iter().any(|a| a == adapter) {
        return Err(ReactiveError::NameAdapterInUse {
            name: name.to_string(),
            adapter: adapter.to_string(),
        });
    }
    adapters.push(adapter.to_string());
    Ok(())
}

/// Undo one [`claim`] of the pair.
pub(crate) fn release(name: &str, adapter: &str) {
    let mut used = combinations();
    if let Some(adapters) = used.get_mut(name) {
        if let Some(pos) = adapters.iter().position(|a| a == adapter) {
            adapters.remove(pos);
        }
        if adapters.is_empty() {
            used.remove(name);
        }
    }
}

/// Whether the pair is currently claimed by at least one open instance.
pub fn is_open(name: &str, adapter: &str) -> bool {
    combinations()
        .get(name)
        .is_some_and(|adapters| adapters.iter().any(|a| a == adapter))
}

pub(crate) fn database_created() {
    DATABASE_COUNT.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn database_destroyed() {
    let _ = DATABASE_COUNT.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
}

/// Number of live database instances in this process.
pub fn database_count() -> usize {
    DATABASE_COUNT.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_rejects_duplicate_pair() {
        claim("registry-dup", "memory", false).unwrap();
        let second = claim("registry-dup", "memory", false);
        assert!(matches!(second, Err(ReactiveError::NameAdapterInUse { .. })));

        // Another adapter under the same name is a different database.
        claim("registry-dup", "other", false).unwrap();

        release("registry-dup", "memory");
        release("registry-dup", "other");
        assert!(!is_open("registry-dup", "memory"));
    }

    #[test]
    fn test_ignore_duplicate_stacks_claims() {
        claim("registry-stack", "memory", false).unwrap();
        claim("registry-stack", "memory", true).unwrap();

        release("registry-stack", "memory");
        assert!(is_open("registry-stack", "memory"));
        release("registry-stack", "memory");
        assert!(!is_open("registry-stack", "memory"));
    }

    #[test]
    fn test_release_unknown_is_noop() {
        release("registry-never-claimed", "memory");
        assert!(!is_open("registry-never-claimed", "memory"));
    }
}
