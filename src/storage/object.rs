//! Object identity and the persisted metadata record.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::storage::bitmap::Bitmap;

pub const ID_HASH_SIZE: usize = 20;

/// Fixed-width SHA-1 fingerprint of `display key` = path + variant key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdHash(pub [u8; ID_HASH_SIZE]);

impl IdHash {
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Legacy single-file location: `{root}/{h[0]}/{h[2:4]}/{h}`.
    pub fn wpath(&self, root: &Path) -> PathBuf {
        let hash = hex::encode(self.0);
        root.join(&hash[0..1]).join(&hash[2..4]).join(&hash)
    }
}

impl fmt::Debug for IdHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdHash({})", self.to_hex())
    }
}

/// Immutable object identity. `path` is the canonical URL, `ext` the
/// optional variant discriminator; the hash covers their concatenation.
#[derive(Clone)]
pub struct Id {
    path: String,
    ext: String,
    hash: IdHash,
    display: String,
}

impl Id {
    pub fn new(path: &str) -> Self {
        Self::new_virtual(path, "")
    }

    pub fn new_virtual(path: &str, virtual_key: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(path.as_bytes());
        hasher.update(virtual_key.as_bytes());
        let digest = hasher.finalize();
        let mut hash = [0u8; ID_HASH_SIZE];
        hash.copy_from_slice(&digest);
        let hash = IdHash(hash);
        let display = format!("{{{}:{}{}}}", hash.to_hex(), path, virtual_key);
        Self {
            path: path.to_string(),
            ext: virtual_key.to_string(),
            hash,
            display,
        }
    }

    /// Display key used by inverted indexes.
    pub fn key(&self) -> String {
        format!("{}{}", self.path, self.ext)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn ext(&self) -> &str {
        &self.ext
    }

    pub fn hash(&self) -> IdHash {
        self.hash
    }

    pub fn hash_str(&self) -> String {
        self.hash.to_hex()
    }

    pub fn wpath(&self, root: &Path) -> PathBuf {
        self.hash.wpath(root)
    }

    /// Slice-file location: `{root}/{h[0]}/{h[2:4]}/{h}-{index:06}`.
    pub fn wpath_slice(&self, root: &Path, index: u32) -> PathBuf {
        let hash = self.hash.to_hex();
        root.join(&hash[0..1])
            .join(&hash[2..4])
            .join(format!("{hash}-{index:06}"))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

// Persisted as `[path, ext]`; the hash is recomputed on load so the record
// stays valid even if the fingerprint scheme gains fields.
impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&self.path)?;
        seq.serialize_element(&self.ext)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;
        impl<'de> Visitor<'de> for IdVisitor {
            type Value = Id;
            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("[path, variant_key]")
            }
            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Id, A::Error> {
                let path: String = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(0, &self))?;
                let ext: String = seq.next_element()?.unwrap_or_default();
                Ok(Id::new_virtual(&path, &ext))
            }
        }
        deserializer.deserialize_seq(IdVisitor)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CacheFlag(u8);

impl CacheFlag {
    pub const CACHE: CacheFlag = CacheFlag(0);
    pub const VARY_INDEX: CacheFlag = CacheFlag(1);
    pub const VARY_CACHE: CacheFlag = CacheFlag(1 << 1);
    pub const CHUNKED: CacheFlag = CacheFlag(1 << 2);

    pub fn insert(&mut self, other: CacheFlag) {
        self.0 |= other.0;
    }

    pub fn contains(self, other: CacheFlag) -> bool {
        self.0 & other.0 != 0
    }
}

impl Default for CacheFlag {
    fn default() -> Self {
        CacheFlag::CACHE
    }
}

/// One record per logical object, serialized with the JSON reference
/// serializer. New fields must be additive and `#[serde(default)]` so old
/// records keep decoding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub flags: CacheFlag,
    pub id: Id,
    #[serde(rename = "bsize")]
    pub block_size: u64,
    /// Completed blocks of the legacy single-file layout.
    #[serde(default)]
    pub parts: Bitmap,
    /// Completed slice files of the sliced layout.
    #[serde(default)]
    pub chunks: Bitmap,
    pub code: u16,
    pub size: u64,
    pub resp_unix: i64,
    pub last_ref_unix: i64,
    #[serde(default)]
    pub refs: i64,
    pub expires_at: i64,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, rename = "vkey", skip_serializing_if = "Vec::is_empty")]
    pub virtual_key: Vec<String>,
}

impl Metadata {
    pub fn new(id: Id, block_size: u64, now: i64) -> Self {
        Self {
            flags: CacheFlag::CACHE,
            id,
            block_size,
            parts: Bitmap::new(),
            chunks: Bitmap::new(),
            code: 200,
            size: 0,
            resp_unix: now,
            last_ref_unix: now,
            refs: 0,
            expires_at: 0,
            headers: Vec::new(),
            virtual_key: Vec::new(),
        }
    }

    pub fn is_vary_index(&self) -> bool {
        self.flags == CacheFlag::VARY_INDEX
    }

    pub fn is_vary_cache(&self) -> bool {
        self.flags.contains(CacheFlag::VARY_CACHE)
    }

    pub fn is_chunked(&self) -> bool {
        self.flags.contains(CacheFlag::CHUNKED)
    }

    /// Present blocks regardless of layout: the sliced bitmap first, the
    /// legacy bitmap as fallback.
    pub fn has_block(&self, index: u32) -> bool {
        self.chunks.contains(index) || self.parts.contains(index)
    }

    /// Union of both layout bitmaps.
    pub fn present_blocks(&self) -> Bitmap {
        let mut all = self.chunks.clone();
        all.union(&self.parts);
        all
    }

    pub fn block_count(&self) -> u64 {
        if self.block_size == 0 || self.size == 0 {
            return 0;
        }
        self.size.div_ceil(self.block_size)
    }

    /// Expected on-disk length of block `index`.
    pub fn block_len(&self, index: u32) -> u64 {
        let total = self.block_count();
        if u64::from(index) + 1 == total && self.size % self.block_size != 0 {
            self.size % self.block_size
        } else {
            self.block_size
        }
    }

    pub fn has_complete(&self) -> bool {
        if self.is_vary_index() || self.size == 0 || self.block_size == 0 {
            return false;
        }
        self.present_blocks().count() as u64 == self.block_count()
    }

    pub fn expired(&self, now: i64) -> bool {
        self.expires_at > 0 && self.expires_at <= now
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            slot.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn id_paths_are_sharded_by_hash() {
        let id = Id::new("http://h/a/x");
        let hex = id.hash_str();
        let p = id.wpath(Path::new("/cache"));
        assert_eq!(
            p,
            Path::new("/cache")
                .join(&hex[0..1])
                .join(&hex[2..4])
                .join(&hex)
        );
        let s = id.wpath_slice(Path::new("/cache"), 7);
        assert!(s.to_string_lossy().ends_with(&format!("{hex}-000007")));
    }

    #[test]
    fn virtual_id_differs_from_root() {
        let root = Id::new("http://h/a");
        let variant = Id::new_virtual("http://h/a", "accept-encoding=br");
        assert_ne!(root.hash().0, variant.hash().0);
        assert_eq!(variant.key(), "http://h/aaccept-encoding=br");
    }

    #[test]
    fn metadata_completion_counts_blocks() {
        let mut md = Metadata::new(Id::new("http://h/a"), 1_048_576, 0);
        md.size = 3_145_728;
        assert_eq!(md.block_count(), 3);
        assert!(!md.has_complete());
        md.chunks.set(0);
        md.chunks.set(2);
        assert!(!md.has_complete());
        // a legacy parts bit fills the hole
        md.parts.set(1);
        assert!(md.has_complete());
    }

    #[test]
    fn last_block_len_handles_remainder() {
        let mut md = Metadata::new(Id::new("http://h/a"), 1000, 0);
        md.size = 2500;
        assert_eq!(md.block_len(0), 1000);
        assert_eq!(md.block_len(1), 1000);
        assert_eq!(md.block_len(2), 500);
        md.size = 2000;
        assert_eq!(md.block_len(1), 1000);
    }

    #[test]
    fn vary_index_is_never_complete() {
        let mut md = Metadata::new(Id::new("http://h/a"), 1000, 0);
        md.size = 1000;
        md.chunks.set(0);
        assert!(md.has_complete());
        md.flags = CacheFlag::VARY_INDEX;
        assert!(!md.has_complete());
    }

    #[test]
    fn record_json_survives_unknown_fields() {
        let mut md = Metadata::new(Id::new("http://h/a"), 4096, 100);
        md.size = 8192;
        md.chunks.set(0);
        md.chunks.set(1);
        md.set_header("ETag", "\"v1\"");
        let mut value: serde_json::Value = serde_json::to_value(&md).unwrap();
        value["some_future_field"] = serde_json::json!({"x": 1});
        let back: Metadata = serde_json::from_value(value).unwrap();
        assert_eq!(back.size, 8192);
        assert_eq!(back.id.hash().0, md.id.hash().0);
        assert_eq!(back.header("etag"), Some("\"v1\""));
        assert!(back.has_complete());
    }
}
