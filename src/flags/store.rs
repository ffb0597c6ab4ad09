//! A thread-safe in-memory storage for local evaluation definitions.
use std::sync::{Arc, RwLock};

use crate::flags::eval::LocalEvaluator;

/// `LocalFlagsStore` provides a Sync storage for flag definitions that allows concurrent access for
/// readers and writers.
///
/// Definitions are immutable and only ever replaced completely, so a reader evaluates against one
/// consistent snapshot.
#[derive(Debug, Default)]
pub(crate) struct LocalFlagsStore {
    evaluator: RwLock<Option<Arc<LocalEvaluator>>>,
}

impl LocalFlagsStore {
    pub fn new() -> Self {
        LocalFlagsStore::default()
    }

    /// Get current definitions. Returns `None` if definitions haven't been fetched yet.
    pub fn get(&self) -> Option<Arc<LocalEvaluator>> {
        // self.evaluator.read() should always return Ok(). Err() is possible only if the lock is
        // poisoned (writer panicked while holding the lock), which should never happen. Still,
        // using .ok()? here to not crash the app.
        let evaluator = self.evaluator.read().ok()?;
        evaluator.clone()
    }

    /// Set new definitions, returning the previous ones.
    pub fn set(&self, evaluator: LocalEvaluator) -> Option<Arc<LocalEvaluator>> {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Some(Arc::new(evaluator));

        let mut slot = self.evaluator.write().ok()?;
        std::mem::replace(&mut slot, new_value)
    }

    /// Forget definitions, e.g. when the project is quota limited.
    pub fn clear(&self) {
        if let Ok(mut slot) = self.evaluator.write() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::LocalFlagsStore;
    use crate::flags::eval::LocalEvaluator;

    #[test]
    fn can_set_definitions_from_another_thread() {
        let store = Arc::new(LocalFlagsStore::new());
        assert!(store.get().is_none());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set(LocalEvaluator::default());
            })
            .join();
        }

        assert!(store.get().is_some());
        store.clear();
        assert!(store.get().is_none());
    }
}
