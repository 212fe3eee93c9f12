//! Advisory per-object read/write locks. Entries are weak so a key's lock
//! disappears once the last request holding it finishes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::RwLock;

const PRUNE_EVERY: usize = 256;

#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<LockMap>,
}

#[derive(Default)]
struct LockMap {
    locks: HashMap<String, Weak<RwLock<()>>>,
    acquisitions: usize,
}

impl KeyedLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lock_for(&self, key: &str) -> Arc<RwLock<()>> {
        let mut map = self.inner.lock().expect("keyed locks");
        map.acquisitions += 1;
        if map.acquisitions % PRUNE_EVERY == 0 {
            map.locks.retain(|_, weak| weak.strong_count() > 0);
        }
        if let Some(existing) = map.locks.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        let lock = Arc::new(RwLock::new(()));
        map.locks.insert(key.to_string(), Arc::downgrade(&lock));
        lock
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("keyed locks").locks.len()
    }
}
