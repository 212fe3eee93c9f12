//! Shared KV for sharded counters and inverted indexes. Counters are
//! 4-byte big-endian values; everything here is best-effort.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::storage::SharedKV;

fn read_u32(val: &[u8]) -> u32 {
    match val.get(0..4) {
        Some(v) => u32::from_be_bytes([v[0], v[1], v[2], v[3]]),
        None => 0,
    }
}

pub struct SledSharedKV {
    db: sled::Db,
}

impl SledSharedKV {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let db = sled::open(path)?;
        Ok(Arc::new(Self { db }))
    }
}

impl SharedKV for SledSharedKV {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let val = self.db.get(key)?.ok_or_else(|| anyhow!("key not found"))?;
        Ok(val.to_vec())
    }

    fn set(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.db.insert(key, val)?;
        Ok(())
    }

    fn incr(&self, key: &[u8], delta: u32) -> Result<u32> {
        self.db.fetch_and_update(key, |old| {
            let next = old.map(read_u32).unwrap_or(0).saturating_add(delta);
            Some(next.to_be_bytes().to_vec())
        })?;
        let val = self.db.get(key)?.ok_or_else(|| anyhow!("key not found"))?;
        Ok(read_u32(&val))
    }

    fn decr(&self, key: &[u8], delta: u32) -> Result<u32> {
        self.db.fetch_and_update(key, |old| {
            let next = old.map(read_u32).unwrap_or(0).saturating_sub(delta);
            Some(next.to_be_bytes().to_vec())
        })?;
        let val = self.db.get(key)?.ok_or_else(|| anyhow!("key not found"))?;
        Ok(read_u32(&val))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    fn drop_prefix(&self, prefix: &[u8]) -> Result<()> {
        let keys: Vec<Vec<u8>> = self
            .db
            .scan_prefix(prefix)
            .keys()
            .filter_map(|res| res.ok().map(|k| k.to_vec()))
            .collect();
        for key in keys {
            let _ = self.db.remove(key);
        }
        Ok(())
    }

    fn iterate_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        for item in self.db.scan_prefix(prefix) {
            let (key, val) = item?;
            f(&key, &val)?;
        }
        Ok(())
    }
}

/// In-process fallback used when no shared KV path is configured.
pub struct MemSharedKV {
    map: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemSharedKV {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: Mutex::new(HashMap::new()),
        })
    }
}

impl SharedKV for MemSharedKV {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let map = self.map.lock().expect("sharedkv");
        map.get(key).cloned().ok_or_else(|| anyhow!("key not found"))
    }

    fn set(&self, key: &[u8], val: &[u8]) -> Result<()> {
        let mut map = self.map.lock().expect("sharedkv");
        map.insert(key.to_vec(), val.to_vec());
        Ok(())
    }

    fn incr(&self, key: &[u8], delta: u32) -> Result<u32> {
        let mut map = self.map.lock().expect("sharedkv");
        let next = map.get(key).map(|v| read_u32(v)).unwrap_or(0).saturating_add(delta);
        map.insert(key.to_vec(), next.to_be_bytes().to_vec());
        Ok(next)
    }

    fn decr(&self, key: &[u8], delta: u32) -> Result<u32> {
        let mut map = self.map.lock().expect("sharedkv");
        let next = map.get(key).map(|v| read_u32(v)).unwrap_or(0).saturating_sub(delta);
        map.insert(key.to_vec(), next.to_be_bytes().to_vec());
        Ok(next)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut map = self.map.lock().expect("sharedkv");
        map.remove(key);
        Ok(())
    }

    fn drop_prefix(&self, prefix: &[u8]) -> Result<()> {
        let mut map = self.map.lock().expect("sharedkv");
        map.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    fn iterate_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = {
            let map = self.map.lock().expect("sharedkv");
            map.iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (k, v) in snapshot {
            f(&k, &v)?;
        }
        Ok(())
    }
}
