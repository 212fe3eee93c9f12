//! Maps an object to its bucket. The hash ring is the default: CRC32 over
//! replica labels, binary search over the sorted ring, so the mapping is
//! stable as long as the bucket set is.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::storage::{object, Bucket, Selector};

const DEFAULT_REPLICAS: usize = 20;

struct RingEntry {
    point: u32,
    bucket: usize,
}

struct RingState {
    buckets: Vec<Arc<dyn Bucket>>,
    ring: Vec<RingEntry>,
}

pub struct HashRingSelector {
    replicas: usize,
    state: RwLock<RingState>,
}

impl HashRingSelector {
    pub fn new(buckets: Vec<Arc<dyn Bucket>>) -> Self {
        Self::with_replicas(buckets, DEFAULT_REPLICAS)
    }

    pub fn with_replicas(buckets: Vec<Arc<dyn Bucket>>, replicas: usize) -> Self {
        let ring = build_ring(&buckets, replicas);
        Self {
            replicas,
            state: RwLock::new(RingState { buckets, ring }),
        }
    }
}

impl Selector for HashRingSelector {
    fn select(&self, id: &object::Id) -> Option<Arc<dyn Bucket>> {
        let state = self.state.read().expect("selector");
        if state.ring.is_empty() {
            return None;
        }
        let point = crc32(&id.hash().0);
        let idx = match state.ring.binary_search_by(|e| e.point.cmp(&point)) {
            Ok(pos) => pos,
            Err(pos) if pos >= state.ring.len() => 0,
            Err(pos) => pos,
        };
        Some(Arc::clone(&state.buckets[state.ring[idx].bucket]))
    }

    fn rebuild(&self, buckets: Vec<Arc<dyn Bucket>>) -> anyhow::Result<()> {
        let mut state = self.state.write().expect("selector");
        state.ring = build_ring(&buckets, self.replicas);
        state.buckets = buckets;
        Ok(())
    }
}

pub struct RoundRobinSelector {
    buckets: RwLock<Vec<Arc<dyn Bucket>>>,
    cursor: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new(buckets: Vec<Arc<dyn Bucket>>) -> Self {
        Self {
            buckets: RwLock::new(buckets),
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Selector for RoundRobinSelector {
    fn select(&self, _id: &object::Id) -> Option<Arc<dyn Bucket>> {
        let buckets = self.buckets.read().expect("selector");
        if buckets.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % buckets.len();
        Some(Arc::clone(&buckets[idx]))
    }

    fn rebuild(&self, buckets: Vec<Arc<dyn Bucket>>) -> anyhow::Result<()> {
        let mut guard = self.buckets.write().expect("selector");
        *guard = buckets;
        self.cursor.store(0, Ordering::Relaxed);
        Ok(())
    }
}

fn build_ring(buckets: &[Arc<dyn Bucket>], replicas: usize) -> Vec<RingEntry> {
    let mut ring = Vec::with_capacity(buckets.len() * replicas);
    for (idx, bucket) in buckets.iter().enumerate() {
        for replica in 0..replicas {
            let label = format!("{}-{replica}", bucket.id());
            ring.push(RingEntry {
                point: crc32(label.as_bytes()),
                bucket: idx,
            });
        }
    }
    ring.sort_by(|a, b| a.point.cmp(&b.point));
    ring
}

fn crc32(input: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(input);
    hasher.finalize()
}
