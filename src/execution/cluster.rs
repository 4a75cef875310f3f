//! Named locks for synchronized sequences

use crate::core::error::ExecutionError;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use tracing::debug;

/// Source of named mutual-exclusion locks
pub trait Cluster: Send + Sync {
    /// Block until the named lock is held by the caller
    fn lock(&self, name: &str) -> Result<LockGuard, ExecutionError>;
}

/// Holds a lock until dropped
pub struct LockGuard {
    name: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(name: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[derive(Debug, Default)]
struct LockTable {
    /// Lock name to owning thread and hold count
    held: Mutex<HashMap<String, (ThreadId, usize)>>,
    released: Condvar,
}

impl LockTable {
    fn held(&self) -> MutexGuard<'_, HashMap<String, (ThreadId, usize)>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, name: &str) {
        let mut held = self.held();
        if let Some((_, count)) = held.get_mut(name) {
            *count -= 1;
            if *count == 0 {
                held.remove(name);
                self.released.notify_all();
            }
        }
    }
}

/// In-process locks, reentrant for the owning thread
#[derive(Debug, Clone, Default)]
pub struct LocalCluster {
    table: Arc<LockTable>,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.table.held().contains_key(name)
    }
}

impl Cluster for LocalCluster {
    fn lock(&self, name: &str) -> Result<LockGuard, ExecutionError> {
        let me = thread::current().id();
        let mut held = self.table.held();
        loop {
            let available = held.get(name).map_or(true, |(owner, _)| *owner == me);
            if available {
                held.entry(name.to_string())
                    .and_modify(|(_, count)| *count += 1)
                    .or_insert((me, 1));
                break;
            }
            held = self
                .table
                .released
                .wait(held)
                .unwrap_or_else(|e| e.into_inner());
        }
        drop(held);
        debug!("Acquired lock {}", name);

        let table = self.table.clone();
        let owned = name.to_string();
        Ok(LockGuard::new(name, move || {
            debug!("Releasing lock {}", owned);
            table.release(&owned);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_guard_releases_on_drop() {
        let cluster = LocalCluster::new();
        {
            let guard = cluster.lock("seq").unwrap();
            assert_eq!(guard.name(), "seq");
            assert!(cluster.is_locked("seq"));
        }
        assert!(!cluster.is_locked("seq"));
    }

    #[test]
    fn test_reentrant_for_same_thread() {
        let cluster = LocalCluster::new();
        let outer = cluster.lock("seq").unwrap();
        let inner = cluster.lock("seq").unwrap();
        drop(inner);
        assert!(cluster.is_locked("seq"));
        drop(outer);
        assert!(!cluster.is_locked("seq"));
    }

    #[test]
    fn test_excludes_other_threads() {
        let cluster = LocalCluster::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cluster = cluster.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    let _guard = cluster.lock("shared").unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
