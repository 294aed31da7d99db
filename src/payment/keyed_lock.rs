//! Per-execution-key serialization.
//!
//! Exactly one holder per key: the first caller for a key runs
//! verify/execute/settle while duplicates wait on the same inner mutex and
//! then observe the cached outcome. The outer map mutex only guards map
//! mutation and ref counts; it is never held across the inner acquisition.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct LockEntry {
    lock: Arc<AsyncMutex<()>>,
    refs: usize,
}

#[derive(Default)]
pub struct KeyedLocks {
    entries: Mutex<HashMap<String, LockEntry>>,
}

/// Guard for one key. Dropping releases the inner mutex and reclaims the
/// map entry once no holder or waiter remains.
pub struct KeyedGuard {
    key: String,
    locks: Arc<KeyedLocks>,
    _guard: OwnedMutexGuard<()>,
}

impl KeyedLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn acquire(self: &Arc<Self>, key: &str) -> KeyedGuard {
        let lock = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.to_string()).or_insert_with(|| LockEntry {
                lock: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            entry.lock.clone()
        };
        let guard = lock.lock_owned().await;
        KeyedGuard {
            key: key.to_string(),
            locks: self.clone(),
            _guard: guard,
        }
    }

    fn release(&self, key: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        self.locks.release(&self.key);
    }
}
