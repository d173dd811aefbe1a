//! Ownership table of live artifacts.
//!
//! Every artifact registers a disposer when it is created. Disposers run
//! exactly once: either when the artifact is released, or when the owning
//! context drains the table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

pub type ArtifactId = u64;

type Disposer = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct RegistryInner {
    next_id: ArtifactId,
    entries: HashMap<ArtifactId, Disposer>,
}

/// Cheap to clone; clones share the same table.
#[derive(Clone, Default)]
pub struct ArtifactRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // A panicking disposer never runs under the lock, so the table
        // is consistent even if poisoned.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, disposer: impl FnOnce() + Send + 'static) -> ArtifactId {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.insert(id, Box::new(disposer));
        id
    }

    /// Remove `id` and run its disposer. Returns false if it was already gone.
    pub fn unregister(&self, id: ArtifactId) -> bool {
        let disposer = self.lock().entries.remove(&id);
        match disposer {
            Some(dispose) => {
                dispose();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ArtifactId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispose every registered artifact. Returns how many were disposed.
    pub fn dispose_all(&self) -> usize {
        let drained: Vec<Disposer> = self.lock().entries.drain().map(|(_, d)| d).collect();
        let count = drained.len();
        for dispose in drained {
            dispose();
        }
        if count > 0 {
            debug!("[Registry] Disposed {} remaining artifact(s)", count);
        }
        count
    }
}

impl std::fmt::Debug for ArtifactRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactRegistry")
            .field("live", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn unregister_runs_disposer_once() {
        let registry = ArtifactRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let id = registry.register(counting(&runs));

        assert!(registry.contains(id));
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn dispose_all_then_unregister_does_not_repeat() {
        let registry = ArtifactRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let a = registry.register(counting(&runs));
        registry.register(counting(&runs));

        assert_eq!(registry.dispose_all(), 2);
        assert!(!registry.unregister(a));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_registration_and_disposal() {
        let registry = ArtifactRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let runs = Arc::clone(&runs);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let id = registry.register(counting(&runs));
                        registry.unregister(id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 400);
        assert!(registry.is_empty());
    }

    #[test]
    fn disposer_may_touch_the_registry() {
        let registry = ArtifactRegistry::new();
        let inner = registry.clone();
        let id = registry.register(move || {
            let _ = inner.len();
        });
        assert!(registry.unregister(id));
    }
}
