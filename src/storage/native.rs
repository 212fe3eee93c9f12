//! Assembles the configured buckets, shared KV and selector into the
//! process-wide storage, and implements PURGE on top of them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::config;
use crate::storage::bucket::disk::DiskBucket;
use crate::storage::indexdb;
use crate::storage::object::{Id, IdHash, ID_HASH_SIZE};
use crate::storage::selector::{HashRingSelector, RoundRobinSelector};
use crate::storage::sharedkv::{MemSharedKV, SledSharedKV};
use crate::storage::{
    domain_counter_key, inverted_index_key, unix_now, Bucket, PurgeControl, Selector, SharedKV,
    Storage,
};

pub struct NativeStorage {
    buckets: Vec<Arc<dyn Bucket>>,
    shared_kv: Arc<dyn SharedKV>,
    selector: Arc<dyn Selector>,
    by_id: HashMap<String, Arc<dyn Bucket>>,
}

impl NativeStorage {
    pub fn new(cfg: &config::Storage) -> Result<Arc<Self>> {
        let shared_kv = build_shared_kv(cfg);
        // counters and indexes are rebuilt while seeding the buckets
        let _ = shared_kv.drop_prefix(b"if/domain/");
        let _ = shared_kv.drop_prefix(b"ix/");

        let mut bucket_cfgs = cfg.buckets.clone();
        if bucket_cfgs.is_empty() {
            bucket_cfgs.push(config::BucketConfig {
                path: "bucket-0".to_string(),
                ..Default::default()
            });
        }

        let mut buckets: Vec<Arc<dyn Bucket>> = Vec::new();
        let mut by_id = HashMap::new();
        for (idx, bucket_cfg) in bucket_cfgs.iter().enumerate() {
            let id = format!("disk-{idx}");
            let path = if bucket_cfg.path.is_empty() {
                PathBuf::from(format!("bucket-{idx}"))
            } else {
                PathBuf::from(&bucket_cfg.path)
            };
            let db_type = if bucket_cfg.db_type.is_empty() {
                cfg.db_type.as_str()
            } else {
                bucket_cfg.db_type.as_str()
            };
            let db = indexdb::open(&path.join(".indexdb"), db_type)?;
            let max_objects = if bucket_cfg.max_object_limit > 0 {
                Some(bucket_cfg.max_object_limit as usize)
            } else {
                None
            };
            let store_type = if bucket_cfg.bucket_type.trim().is_empty() {
                "normal".to_string()
            } else {
                bucket_cfg.bucket_type.clone()
            };
            let bucket: Arc<dyn Bucket> = DiskBucket::new(
                path,
                &id,
                db,
                Arc::clone(&shared_kv),
                bucket_cfg.async_load || cfg.async_load,
                max_objects,
                store_type,
            )?;
            by_id.insert(id, Arc::clone(&bucket));
            buckets.push(bucket);
        }

        let selector: Arc<dyn Selector> = match cfg.selection_policy.as_str() {
            "roundrobin" => Arc::new(RoundRobinSelector::new(buckets.clone())),
            _ => Arc::new(HashRingSelector::new(buckets.clone())),
        };

        Ok(Arc::new(Self {
            buckets,
            shared_kv,
            selector,
            by_id,
        }))
    }

    pub fn bucket_by_id(&self, id: &str) -> Option<Arc<dyn Bucket>> {
        self.by_id.get(id).cloned()
    }

    fn purge_single(&self, store_url: &str) -> Result<()> {
        let id = Id::new(store_url);
        let bucket = self
            .selector
            .select(&id)
            .ok_or_else(|| anyhow!("no bucket for object"))?;
        bucket.discard(&id)
    }

    fn purge_dir(&self, store_url: &str, control: PurgeControl) -> Result<()> {
        let mut processed = 0usize;
        for bucket in &self.buckets {
            let prefix = inverted_index_key(bucket.id(), store_url);
            let mut hashes: Vec<IdHash> = Vec::new();
            let _ = self.shared_kv.iterate_prefix(prefix.as_bytes(), &mut |_, val| {
                if val.len() >= ID_HASH_SIZE {
                    let mut raw = [0u8; ID_HASH_SIZE];
                    raw.copy_from_slice(&val[..ID_HASH_SIZE]);
                    hashes.push(IdHash(raw));
                }
                Ok(())
            });
            for hash in hashes {
                if bucket.discard_with_hash(hash).is_ok() {
                    processed += 1;
                }
            }
        }

        // Fallback scan for records the index lost track of.
        if processed == 0 {
            for bucket in &self.buckets {
                bucket.iterate(&mut |meta| {
                    if meta.id.path().starts_with(store_url) {
                        if control.mark_expired {
                            let mut meta = meta.clone();
                            meta.expires_at = unix_now() - 1;
                            let _ = bucket.store(&meta);
                        } else {
                            let _ = bucket.discard_with_metadata(meta);
                        }
                        processed += 1;
                    }
                    Ok(())
                })?;
            }
        }

        if processed == 0 {
            return Err(anyhow!("key not found"));
        }
        Ok(())
    }
}

impl Storage for NativeStorage {
    fn buckets(&self) -> Vec<Arc<dyn Bucket>> {
        self.buckets.clone()
    }

    fn shared_kv(&self) -> Arc<dyn SharedKV> {
        Arc::clone(&self.shared_kv)
    }

    fn selector(&self) -> Arc<dyn Selector> {
        Arc::clone(&self.selector)
    }

    fn purge(&self, store_url: &str, control: PurgeControl) -> Result<()> {
        if control.dir {
            return self.purge_dir(store_url, control);
        }
        self.purge_single(store_url)
    }

    fn flush(&self) {
        for bucket in &self.buckets {
            if let Err(err) = bucket.flush() {
                log::warn!("bucket {} flush failed: {err}", bucket.id());
            }
        }
    }
}

fn build_shared_kv(cfg: &config::Storage) -> Arc<dyn SharedKV> {
    if cfg.db_path.trim().is_empty() {
        return MemSharedKV::new();
    }
    let path = PathBuf::from(&cfg.db_path).join("sharedkv");
    match SledSharedKV::open(&path) {
        Ok(kv) => kv,
        Err(err) => {
            log::warn!("shared kv open failed: {err}, using in-memory fallback");
            MemSharedKV::new()
        }
    }
}

// Referenced here so the helper is exercised from native storage paths too.
pub fn domain_count(shared_kv: &dyn SharedKV, host: &str) -> u32 {
    shared_kv
        .get(domain_counter_key(host).as_bytes())
        .ok()
        .map(|v| {
            v.get(0..4)
                .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                .unwrap_or(0)
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::object::Metadata;

    fn storage_in(dir: &std::path::Path) -> Arc<NativeStorage> {
        let cfg = config::Storage {
            db_type: "memory".to_string(),
            buckets: vec![config::BucketConfig {
                path: dir.join("b0").to_string_lossy().to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        NativeStorage::new(&cfg).unwrap()
    }

    fn put(storage: &NativeStorage, url: &str) -> Id {
        let id = Id::new(url);
        let bucket = storage.selector().select(&id).unwrap();
        let mut md = Metadata::new(id.clone(), 8, 1);
        md.size = 8;
        bucket.write_block(&id, 0, b"01234567").unwrap();
        md.chunks.set(0);
        bucket.store(&md).unwrap();
        id
    }

    #[test]
    fn purge_single_removes_one_object() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());
        let id = put(&storage, "http://h/a/x");
        storage.purge("http://h/a/x", PurgeControl::default()).unwrap();
        let bucket = storage.selector().select(&id).unwrap();
        assert!(bucket.lookup(&id).unwrap().is_none());
        assert!(storage
            .purge("http://h/a/x", PurgeControl::default())
            .is_err());
    }

    #[test]
    fn purge_dir_removes_prefix_and_decrements_counters() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());
        put(&storage, "http://h/a/x");
        put(&storage, "http://h/a/y");
        let keep = put(&storage, "http://h/b/z");
        assert_eq!(domain_count(storage.shared_kv().as_ref(), "h"), 3);

        storage
            .purge(
                "http://h/a/",
                PurgeControl { dir: true, mark_expired: false },
            )
            .unwrap();

        let bucket = storage.selector().select(&keep).unwrap();
        assert!(bucket.lookup(&keep).unwrap().is_some());
        assert!(bucket.lookup(&Id::new("http://h/a/x")).unwrap().is_none());
        assert!(bucket.lookup(&Id::new("http://h/a/y")).unwrap().is_none());
        assert_eq!(domain_count(storage.shared_kv().as_ref(), "h"), 1);
    }
}
