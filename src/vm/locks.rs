//! Per-VM-name advisory locks.
//!
//! Mutating operations on the same name are serialized; different names
//! never contend. Entries are weak so the table does not grow with every
//! name ever touched.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Default)]
pub struct VmLocks {
    table: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

/// Held for the duration of one mutating operation. Released on drop, which
/// covers early returns, errors and task aborts alike.
pub struct VmLockGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl VmLockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl VmLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, name: &str) -> VmLockGuard {
        let lock = self.entry(name);
        debug!("waiting for lock on {}", name);
        let guard = lock.lock_owned().await;
        debug!("acquired lock on {}", name);
        VmLockGuard {
            name: name.to_string(),
            _guard: guard,
        }
    }

    fn entry(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock();
        if let Some(existing) = table.get(name).and_then(Weak::upgrade) {
            return existing;
        }
        table.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(AsyncMutex::new(()));
        table.insert(name.to_string(), Arc::downgrade(&lock));
        lock
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.table.lock().len()
    }
}
