//! Dense bitmap over block indices plus the range helpers the range
//! composer is built on.

use serde::de::{SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
}

impl Bitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, index: u32) {
        let word = (index / 64) as usize;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (index % 64);
    }

    pub fn contains(&self, index: u32) -> bool {
        let word = (index / 64) as usize;
        match self.words.get(word) {
            Some(bits) => bits & (1u64 << (index % 64)) != 0,
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Visit every set bit in ascending order.
    pub fn range(&self, mut f: impl FnMut(u32)) {
        for (wi, word) in self.words.iter().enumerate() {
            let mut bits = *word;
            while bits != 0 {
                let bit = bits.trailing_zeros();
                f(wi as u32 * 64 + bit);
                bits &= bits - 1;
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.count());
        self.range(|i| out.push(i));
        out
    }

    pub fn and(&mut self, other: &Bitmap) {
        for (wi, word) in self.words.iter_mut().enumerate() {
            *word &= other.words.get(wi).copied().unwrap_or(0);
        }
    }

    pub fn andnot(&mut self, other: &Bitmap) {
        for (wi, word) in self.words.iter_mut().enumerate() {
            *word &= !other.words.get(wi).copied().unwrap_or(0);
        }
    }

    pub fn union(&mut self, other: &Bitmap) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (wi, word) in other.words.iter().enumerate() {
            self.words[wi] |= word;
        }
    }
}

impl FromIterator<u32> for Bitmap {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        let mut bm = Bitmap::new();
        for i in iter {
            bm.set(i);
        }
        bm
    }
}

// Persisted as the sorted list of set indices; keeps the JSON stable and
// readable and tolerates any future width change.
impl Serialize for Bitmap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.to_vec())
    }
}

impl<'de> Deserialize<'de> for Bitmap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BitsVisitor;
        impl<'de> Visitor<'de> for BitsVisitor {
            type Value = Bitmap;
            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a sequence of block indices")
            }
            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Bitmap, A::Error> {
                let mut bm = Bitmap::new();
                while let Some(i) = seq.next_element::<u32>()? {
                    bm.set(i);
                }
                Ok(bm)
            }
        }
        deserializer.deserialize_seq(BitsVisitor)
    }
}

/// Block indices covered by the byte span `[start, end]`.
pub fn block_span(start: u64, end: u64, block_size: u64) -> (u32, u32) {
    ((start / block_size) as u32, (end / block_size) as u32)
}

pub fn full_hit(first: u32, last: u32, bm: &Bitmap) -> bool {
    (first..=last).all(|i| bm.contains(i))
}

pub fn part_hit(first: u32, last: u32, bm: &Bitmap) -> bool {
    (first..=last).any(|i| bm.contains(i))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockGroup {
    pub hit: bool,
    pub first: u32,
    pub last: u32,
}

/// Partition `want` into maximal runs of consecutive indices, each run
/// labelled by whether its members are present in `have`. Runs come back
/// ordered by first index and their union is exactly `want`.
pub fn block_groups(have: &Bitmap, want: &Bitmap) -> Vec<BlockGroup> {
    let mut groups: Vec<BlockGroup> = Vec::new();
    want.range(|i| {
        let hit = have.contains(i);
        match groups.last_mut() {
            Some(group) if group.hit == hit && group.last + 1 == i => group.last = i,
            _ => groups.push(BlockGroup { hit, first: i, last: i }),
        }
    });
    groups
}
