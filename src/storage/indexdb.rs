//! Per-bucket metadata store: an ordered KV of object hash to serialized
//! record. `sled` is the reference backend, `redb` an alternative behind
//! the same trait; both serialize with JSON so records tolerate unknown
//! and missing fields across versions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once, OnceLock};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use redb::{ReadableTable, ReadableTableMetadata};

use crate::storage::object::Metadata;

pub trait IndexDB: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Metadata>>;
    fn set(&self, key: &[u8], val: &Metadata) -> Result<()>;
    fn exists(&self, key: &[u8]) -> Result<bool>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    /// Ordered walk; `prefix = None` visits everything. The callback
    /// returns `false` to stop early.
    fn iterate(
        &self,
        prefix: Option<&[u8]>,
        f: &mut dyn FnMut(&[u8], &Metadata) -> bool,
    ) -> Result<()>;
    fn flush(&self) -> Result<()>;
    fn len(&self) -> Result<usize>;
}

type Opener = fn(&Path) -> Result<Arc<dyn IndexDB>>;

fn registry() -> &'static Mutex<HashMap<String, Opener>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Opener>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn register(name: &str, opener: Opener) {
    let mut reg = registry().lock().expect("indexdb registry");
    reg.insert(name.trim().to_ascii_lowercase(), opener);
}

fn ensure_builtin() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        register("sled", open_sled);
        register("redb", open_redb);
    });
}

pub fn open(path: &Path, db_type: &str) -> Result<Arc<dyn IndexDB>> {
    ensure_builtin();
    let name = db_type.trim().to_ascii_lowercase();
    if name == "memory" || name == "mem" {
        return SledIndexDB::temporary().map(|db| db as Arc<dyn IndexDB>);
    }
    if name.is_empty() {
        return open_sled(path);
    }
    let reg = registry().lock().expect("indexdb registry");
    if let Some(opener) = reg.get(&name) {
        return opener(path);
    }
    log::warn!("indexdb type {name} not supported, falling back to sled");
    open_sled(path)
}

fn open_sled(path: &Path) -> Result<Arc<dyn IndexDB>> {
    SledIndexDB::open(path).map(|db| db as Arc<dyn IndexDB>)
}

fn open_redb(path: &Path) -> Result<Arc<dyn IndexDB>> {
    RedbIndexDB::open(path).map(|db| db as Arc<dyn IndexDB>)
}

fn encode(meta: &Metadata) -> Result<Vec<u8>> {
    serde_json::to_vec(meta).map_err(|err| anyhow!("encode metadata: {err}"))
}

fn decode(raw: &[u8]) -> Result<Metadata> {
    serde_json::from_slice(raw).map_err(|err| anyhow!("decode metadata: {err}"))
}

pub struct SledIndexDB {
    db: sled::Db,
}

impl SledIndexDB {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let db = sled::open(path)?;
        Ok(Arc::new(Self { db }))
    }

    pub fn temporary() -> Result<Arc<Self>> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Arc::new(Self { db }))
    }
}

impl IndexDB for SledIndexDB {
    fn get(&self, key: &[u8]) -> Result<Option<Metadata>> {
        match self.db.get(key)? {
            Some(val) => Ok(Some(decode(&val)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &[u8], val: &Metadata) -> Result<()> {
        self.db.insert(key, encode(val)?)?;
        Ok(())
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.db.contains_key(key)?)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    fn iterate(
        &self,
        prefix: Option<&[u8]>,
        f: &mut dyn FnMut(&[u8], &Metadata) -> bool,
    ) -> Result<()> {
        let iter: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> = match prefix {
            Some(prefix) => Box::new(self.db.scan_prefix(prefix)),
            None => Box::new(self.db.iter()),
        };
        for item in iter {
            let (key, val) = item?;
            let meta = match decode(&val) {
                Ok(meta) => meta,
                Err(err) => {
                    log::warn!("skipping undecodable record: {err}");
                    continue;
                }
            };
            if !f(&key, &meta) {
                break;
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.db.len())
    }
}

const METADATA_TABLE: redb::TableDefinition<&[u8], &[u8]> = redb::TableDefinition::new("metadata");

pub struct RedbIndexDB {
    db: redb::Database,
}

impl RedbIndexDB {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let path = file_path(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = redb::Database::create(&path)?;
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(METADATA_TABLE)?;
        }
        txn.commit()?;
        Ok(Arc::new(Self { db }))
    }
}

impl IndexDB for RedbIndexDB {
    fn get(&self, key: &[u8]) -> Result<Option<Metadata>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(METADATA_TABLE)?;
        match table.get(key)? {
            Some(val) => Ok(Some(decode(val.value())?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &[u8], val: &Metadata) -> Result<()> {
        let raw = encode(val)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(METADATA_TABLE)?;
            table.insert(key, raw.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(METADATA_TABLE)?;
        Ok(table.get(key)?.is_some())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(METADATA_TABLE)?;
            table.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn iterate(
        &self,
        prefix: Option<&[u8]>,
        f: &mut dyn FnMut(&[u8], &Metadata) -> bool,
    ) -> Result<()> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(METADATA_TABLE)?;
        for item in table.iter()? {
            let (key, val) = item?;
            let key = key.value();
            if let Some(prefix) = prefix {
                if !key.starts_with(prefix) {
                    continue;
                }
            }
            let meta = match decode(val.value()) {
                Ok(meta) => meta,
                Err(err) => {
                    log::warn!("skipping undecodable record: {err}");
                    continue;
                }
            };
            if !f(key, &meta) {
                break;
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(METADATA_TABLE)?;
        Ok(table.len()? as usize)
    }
}

fn file_path(path: &Path) -> PathBuf {
    if path.extension().is_some() {
        path.to_path_buf()
    } else {
        path.join("metadata.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::object::{Id, Metadata};

    fn sample(url: &str) -> Metadata {
        let mut md = Metadata::new(Id::new(url), 4096, 1);
        md.size = 4096;
        md.chunks.set(0);
        md
    }

    #[test]
    fn sled_get_set_delete() {
        let db = SledIndexDB::temporary().unwrap();
        let md = sample("http://h/a");
        let key = md.id.hash().0;
        assert!(db.get(&key).unwrap().is_none());
        db.set(&key, &md).unwrap();
        assert!(db.exists(&key).unwrap());
        let back = db.get(&key).unwrap().unwrap();
        assert_eq!(back.size, 4096);
        db.delete(&key).unwrap();
        assert!(!db.exists(&key).unwrap());
    }

    #[test]
    fn sled_iterate_visits_all() {
        let db = SledIndexDB::temporary().unwrap();
        for url in ["http://h/a", "http://h/b", "http://h/c"] {
            let md = sample(url);
            db.set(&md.id.hash().0, &md).unwrap();
        }
        let mut count = 0;
        db.iterate(None, &mut |_, _| {
            count += 1;
            true
        })
        .unwrap();
        assert_eq!(count, 3);
        assert_eq!(db.len().unwrap(), 3);
    }

    #[test]
    fn redb_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = RedbIndexDB::open(dir.path()).unwrap();
        let md = sample("http://h/r");
        let key = md.id.hash().0;
        db.set(&key, &md).unwrap();
        assert!(db.exists(&key).unwrap());
        assert_eq!(db.len().unwrap(), 1);
        let back = db.get(&key).unwrap().unwrap();
        assert_eq!(back.id.key(), "http://h/r");
        db.delete(&key).unwrap();
        assert!(db.get(&key).unwrap().is_none());
    }
}
