use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;

pub mod bitmap;
pub mod bucket;
pub mod indexdb;
pub mod native;
pub mod object;
pub mod selector;
pub mod sharedkv;

use object::{Id, IdHash, Metadata};

#[derive(Clone, Copy, Debug, Default)]
pub struct PurgeControl {
    /// Prefix purge through the inverted index.
    pub dir: bool,
    /// Mark records expired instead of removing them.
    pub mark_expired: bool,
}

pub trait Selector: Send + Sync {
    fn select(&self, id: &Id) -> Option<Arc<dyn Bucket>>;
    fn rebuild(&self, _buckets: Vec<Arc<dyn Bucket>>) -> Result<()> {
        Ok(())
    }
}

/// A storage partition: one directory tree, one metadata store, one LRU.
pub trait Bucket: Send + Sync {
    fn id(&self) -> &str;
    fn store_type(&self) -> &str;
    fn path(&self) -> &Path;
    fn objects(&self) -> u64;

    fn lookup(&self, id: &Id) -> Result<Option<Metadata>>;
    fn store(&self, meta: &Metadata) -> Result<()>;
    fn exists(&self, hash: &IdHash) -> bool;
    fn discard(&self, id: &Id) -> Result<()>;
    fn discard_with_hash(&self, hash: IdHash) -> Result<()>;
    fn discard_with_metadata(&self, meta: &Metadata) -> Result<()>;
    fn iterate(&self, f: &mut dyn FnMut(&Metadata) -> Result<()>) -> Result<()>;

    /// Persist one block as a slice file. Returns the file path.
    fn write_block(&self, id: &Id, index: u32, data: &[u8]) -> Result<std::path::PathBuf>;

    /// Flush the metadata store to disk; called on shutdown.
    fn flush(&self) -> Result<()>;
}

/// Best-effort process-wide KV used for sharded counters and the inverted
/// index. Never on the critical path; callers log and swallow errors.
pub trait SharedKV: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;
    fn set(&self, key: &[u8], val: &[u8]) -> Result<()>;
    fn incr(&self, key: &[u8], delta: u32) -> Result<u32>;
    fn decr(&self, key: &[u8], delta: u32) -> Result<u32>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    fn drop_prefix(&self, prefix: &[u8]) -> Result<()>;
    fn iterate_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()>;
}

pub trait Storage: Send + Sync {
    fn buckets(&self) -> Vec<Arc<dyn Bucket>>;
    fn shared_kv(&self) -> Arc<dyn SharedKV>;
    fn selector(&self) -> Arc<dyn Selector>;
    fn purge(&self, store_url: &str, control: PurgeControl) -> Result<()>;
    fn flush(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    Miss,
    Hit,
    PartHit,
    PartMiss,
    RevalidateHit,
    RevalidateMiss,
    HotHit,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Miss => "MISS",
            CacheStatus::Hit => "HIT",
            CacheStatus::PartHit => "PART_HIT",
            CacheStatus::PartMiss => "PART_MISS",
            CacheStatus::RevalidateHit => "REVALIDATE_HIT",
            CacheStatus::RevalidateMiss => "REVALIDATE_MISS",
            CacheStatus::HotHit => "HOT_HIT",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64
}

/// Shared-KV key of the per-host object counter.
pub fn domain_counter_key(host: &str) -> String {
    format!("if/domain/{host}")
}

/// Shared-KV key of an inverted-index entry.
pub fn inverted_index_key(bucket_id: &str, display_key: &str) -> String {
    format!("ix/{bucket_id}/{display_key}")
}

static DEFAULT_STORAGE: OnceLock<Arc<dyn Storage>> = OnceLock::new();

pub fn set_default(storage: Arc<dyn Storage>) {
    let _ = DEFAULT_STORAGE.set(storage);
}

pub fn current() -> Arc<dyn Storage> {
    DEFAULT_STORAGE
        .get()
        .expect("storage not initialized")
        .clone()
}

pub fn initialized() -> bool {
    DEFAULT_STORAGE.get().is_some()
}
