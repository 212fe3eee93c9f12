//! Disk bucket: owns a directory tree and one metadata store, tracks
//! accesses in an LRU seeded from existing records, and evicts through a
//! dedicated consumer so request paths never pay for file removal.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::metrics;
use crate::storage::bucket::lru::{pack_mark, LruIndex};
use crate::storage::indexdb::IndexDB;
use crate::storage::object::{Id, IdHash, Metadata};
use crate::storage::{domain_counter_key, inverted_index_key, unix_now, Bucket, SharedKV};

const EVICT_QUEUE: usize = 1024;

pub struct DiskBucket {
    id: String,
    path: PathBuf,
    indexdb: Arc<dyn IndexDB>,
    shared_kv: Arc<dyn SharedKV>,
    lru: Mutex<LruIndex>,
    evict_tx: SyncSender<(IdHash, u64)>,
    store_type: String,
}

impl DiskBucket {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: PathBuf,
        id: &str,
        indexdb: Arc<dyn IndexDB>,
        shared_kv: Arc<dyn SharedKV>,
        async_load: bool,
        max_objects: Option<usize>,
        store_type: String,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(&path).with_context(|| format!("create bucket dir {}", path.display()))?;

        let (evict_tx, evict_rx) = sync_channel::<(IdHash, u64)>(EVICT_QUEUE);
        let bucket = Arc::new(Self {
            id: id.to_string(),
            path,
            indexdb,
            shared_kv,
            lru: Mutex::new(LruIndex::new(max_objects)),
            evict_tx,
            store_type,
        });

        // The consumer holds a weak handle so dropping the bucket closes
        // the channel and ends the thread.
        let weak = Arc::downgrade(&bucket);
        std::thread::spawn(move || {
            for (hash, mark) in evict_rx {
                let Some(bucket) = weak.upgrade() else { break };
                bucket.apply_touch(hash, mark);
            }
        });

        let seeding = Arc::clone(&bucket);
        if async_load {
            std::thread::spawn(move || seeding.load_records());
        } else {
            bucket.load_records();
        }
        Ok(bucket)
    }

    fn load_records(&self) {
        let mut seeded = 0usize;
        let _ = self.indexdb.iterate(None, &mut |_, meta| {
            {
                let mut lru = self.lru.lock().expect("bucket lru");
                lru.seed(meta.id.hash(), pack_mark(meta.last_ref_unix, meta.refs as u16));
            }
            self.index_shared_kv(meta);
            seeded += 1;
            true
        });
        let overflow = {
            let mut lru = self.lru.lock().expect("bucket lru");
            lru.evict_overflow()
        };
        for hash in overflow {
            if let Err(err) = self.evict_hash(hash) {
                log::warn!("bucket {} seed eviction failed: {err}", self.id);
            }
        }
        log::info!("bucket {} loaded {seeded} records", self.id);
    }

    fn index_shared_kv(&self, meta: &Metadata) {
        if let Some(host) = host_of(meta.id.path()) {
            let _ = self.shared_kv.incr(domain_counter_key(&host).as_bytes(), 1);
        }
        let key = inverted_index_key(&self.id, &meta.id.key());
        let _ = self.shared_kv.set(key.as_bytes(), &meta.id.hash().0);
    }

    fn unindex_shared_kv(&self, meta: &Metadata) {
        let key = inverted_index_key(&self.id, &meta.id.key());
        let _ = self.shared_kv.delete(key.as_bytes());
        if let Some(host) = host_of(meta.id.path()) {
            let _ = self.shared_kv.decr(domain_counter_key(&host).as_bytes(), 1);
        }
    }

    fn queue_touch(&self, hash: IdHash) {
        let mark = pack_mark(unix_now(), 0);
        match self.evict_tx.try_send((hash, mark)) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn apply_touch(&self, hash: IdHash, mark: u64) {
        let evicted = {
            let mut lru = self.lru.lock().expect("bucket lru");
            lru.touch(hash, mark)
        };
        for hash in evicted {
            if let Err(err) = self.evict_hash(hash) {
                log::warn!("bucket {} eviction failed: {err}", self.id);
            }
        }
    }

    fn evict_hash(&self, hash: IdHash) -> Result<()> {
        if let Some(meta) = self.indexdb.get(&hash.0)? {
            self.discard_with_metadata(&meta)?;
        }
        Ok(())
    }

    fn remove_files(&self, meta: &Metadata) {
        meta.chunks.range(|index| {
            let _ = fs::remove_file(meta.id.wpath_slice(&self.path, index));
        });
        if !meta.parts.is_empty() {
            let _ = fs::remove_file(meta.id.wpath(&self.path));
        }
    }
}

impl Bucket for DiskBucket {
    fn id(&self) -> &str {
        &self.id
    }

    fn store_type(&self) -> &str {
        &self.store_type
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn objects(&self) -> u64 {
        self.indexdb.len().unwrap_or(0) as u64
    }

    fn lookup(&self, id: &Id) -> Result<Option<Metadata>> {
        let meta = self.indexdb.get(&id.hash().0)?;
        if meta.is_some() {
            self.queue_touch(id.hash());
        }
        Ok(meta)
    }

    fn store(&self, meta: &Metadata) -> Result<()> {
        let first_seen = !self.exists(&meta.id.hash());
        let mut record = meta.clone();
        record.headers.retain(|(name, _)| !is_internal_header(name));
        self.indexdb.set(&record.id.hash().0, &record)?;
        self.queue_touch(record.id.hash());
        if first_seen {
            self.index_shared_kv(&record);
        }
        Ok(())
    }

    fn exists(&self, hash: &IdHash) -> bool {
        self.indexdb.exists(&hash.0).unwrap_or(false)
    }

    fn discard(&self, id: &Id) -> Result<()> {
        match self.indexdb.get(&id.hash().0)? {
            Some(meta) => self.discard_with_metadata(&meta),
            None => Err(anyhow::anyhow!("key not found")),
        }
    }

    fn discard_with_hash(&self, hash: IdHash) -> Result<()> {
        match self.indexdb.get(&hash.0)? {
            Some(meta) => self.discard_with_metadata(&meta),
            None => Err(anyhow::anyhow!("key not found")),
        }
    }

    fn discard_with_metadata(&self, meta: &Metadata) -> Result<()> {
        // A vary index owns its variants.
        if meta.is_vary_index() {
            for vkey in &meta.virtual_key {
                let vid = Id::new_virtual(meta.id.path(), vkey);
                if let Ok(Some(vmeta)) = self.indexdb.get(&vid.hash().0) {
                    let _ = self.discard_with_metadata(&vmeta);
                }
            }
        }
        {
            let mut lru = self.lru.lock().expect("bucket lru");
            lru.remove(&meta.id.hash());
        }
        // Metadata goes first so a crash can never leave a readable
        // record pointing at missing bytes the other way around.
        self.indexdb.delete(&meta.id.hash().0)?;
        self.remove_files(meta);
        self.unindex_shared_kv(meta);
        Ok(())
    }

    fn iterate(&self, f: &mut dyn FnMut(&Metadata) -> Result<()>) -> Result<()> {
        self.indexdb.iterate(None, &mut |_, meta| f(meta).is_ok())
    }

    fn write_block(&self, id: &Id, index: u32, data: &[u8]) -> Result<PathBuf> {
        let path = id.wpath_slice(&self.path, index);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data).with_context(|| format!("write slice {}", path.display()))?;
        metrics::record_disk_write(&self.id, data.len());
        Ok(path)
    }

    fn flush(&self) -> Result<()> {
        self.indexdb.flush()
    }
}

fn is_internal_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "x-cache" || lower == "x-prefetch" || lower.starts_with("i-x-")
}

fn host_of(url: &str) -> Option<String> {
    url.parse::<http::Uri>()
        .ok()
        .and_then(|uri| uri.host().map(|h| h.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::indexdb::SledIndexDB;
    use crate::storage::sharedkv::MemSharedKV;

    fn new_bucket(dir: &Path) -> Arc<DiskBucket> {
        let db = SledIndexDB::temporary().unwrap();
        DiskBucket::new(
            dir.to_path_buf(),
            "disk-0",
            db,
            MemSharedKV::new(),
            false,
            None,
            "normal".to_string(),
        )
        .unwrap()
    }

    fn stored(bucket: &DiskBucket, url: &str, blocks: &[(u32, &[u8])]) -> Metadata {
        let id = Id::new(url);
        let mut md = Metadata::new(id.clone(), 8, 1);
        md.size = blocks.iter().map(|(_, d)| d.len() as u64).sum();
        for (index, data) in blocks {
            bucket.write_block(&id, *index, data).unwrap();
            md.chunks.set(*index);
            md.parts.set(*index);
        }
        bucket.store(&md).unwrap();
        md
    }

    #[test]
    fn store_lookup_discard_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = new_bucket(dir.path());
        let md = stored(&bucket, "http://h/a", &[(0, b"12345678"), (1, b"1234")]);

        let found = bucket.lookup(&md.id).unwrap().unwrap();
        assert_eq!(found.size, 12);
        assert!(found.has_complete());

        let slice0 = md.id.wpath_slice(bucket.path(), 0);
        assert_eq!(std::fs::read(&slice0).unwrap(), b"12345678");

        bucket.discard(&md.id).unwrap();
        assert!(bucket.lookup(&md.id).unwrap().is_none());
        assert!(!slice0.exists());
        // discarding again reports the missing key
        assert!(bucket.discard(&md.id).is_err());
    }

    #[test]
    fn vary_index_discard_recurses_into_variants() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = new_bucket(dir.path());

        let variant = stored(&bucket, "http://h/a", &[(0, b"bbbbbbbb")]);
        // rebuild the variant under its discriminated id
        let vid = Id::new_virtual("http://h/a", "accept-encoding=br");
        let mut vmd = variant.clone();
        vmd.id = vid.clone();
        vmd.flags = crate::storage::object::CacheFlag::VARY_CACHE;
        bucket.write_block(&vid, 0, b"bbbbbbbb").unwrap();
        bucket.store(&vmd).unwrap();

        let mut index = Metadata::new(Id::new("http://h/a"), 8, 1);
        index.flags = crate::storage::object::CacheFlag::VARY_INDEX;
        index.virtual_key = vec!["accept-encoding=br".to_string()];
        bucket.store(&index).unwrap();

        bucket.discard(&index.id).unwrap();
        assert!(bucket.lookup(&vid).unwrap().is_none());
        assert!(!vid.wpath_slice(bucket.path(), 0).exists());
    }

    #[test]
    fn capacity_overflow_discards_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let db = SledIndexDB::temporary().unwrap();
        let bucket = DiskBucket::new(
            dir.path().to_path_buf(),
            "disk-small",
            db,
            MemSharedKV::new(),
            false,
            Some(2),
            "normal".to_string(),
        )
        .unwrap();

        let first = stored(&bucket, "http://h/1", &[(0, b"aaaaaaaa")]);
        let _second = stored(&bucket, "http://h/2", &[(0, b"bbbbbbbb")]);
        let _third = stored(&bucket, "http://h/3", &[(0, b"cccccccc")]);

        // the consumer thread applies evictions asynchronously
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(bucket.lookup(&first.id).unwrap().is_none());
        assert_eq!(bucket.objects(), 2);
    }
}
