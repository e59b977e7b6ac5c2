//! Content-addressed string interning, grounded in `intern.c`'s
//! `string_from_db` and `murmur`.

use std::collections::HashMap;

use crate::heap::Arena;
use crate::value::StrId;

/// An interned, immutable byte buffer with its precomputed hash. Strings
/// are byte buffers, not Unicode text, matching the distilled spec's
/// non-goal of Unicode-aware string operations.
pub struct SuString {
    pub hash: u32,
    pub bytes: Vec<u8>,
}

impl SuString {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// MurmurHash2, seed 0, matching `core.c`'s `murmur()` exactly: 4-byte
/// little-endian mixing with `m = 0x5bd1e995`, `r = 24`, and the textbook
/// finalization shift/mix/shift.
pub fn murmur2(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0x5bd1e995;
    const R: u32 = 24;

    let len = data.len();
    let mut h: u32 = seed ^ (len as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);

        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u32 = 0;
        for (i, b) in tail.iter().enumerate().rev() {
            k ^= (*b as u32) << (8 * i);
        }
        h ^= k;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Hash-bucketed interning table. Kept separate from the string arena's
/// generational ids so lookups don't need to walk every live string.
#[derive(Default)]
pub struct StringTable {
    buckets: HashMap<u32, Vec<StrId>>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `bytes`, returning the existing id on a content match or
    /// allocating a fresh slot in `arena` on a miss.
    pub fn intern(&mut self, arena: &mut Arena<SuString>, bytes: &[u8]) -> StrId {
        let hash = murmur2(bytes, 0);
        if let Some(candidates) = self.buckets.get(&hash) {
            for &id in candidates {
                if let Some(s) = arena.get(id) {
                    if s.bytes == bytes {
                        return id;
                    }
                }
            }
        }
        let id = arena.insert(SuString {
            hash,
            bytes: bytes.to_vec(),
        });
        self.buckets.entry(hash).or_default().push(id);
        id
    }

    /// Drops ids whose arena slot is no longer live (called after a GC
    /// sweep so stale bucket entries don't accumulate forever).
    pub fn retain_live(&mut self, arena: &Arena<SuString>) {
        for ids in self.buckets.values_mut() {
            ids.retain(|id| arena.get(*id).is_some());
        }
        self.buckets.retain(|_, ids| !ids.is_empty());
    }

    /// Every currently-bucketed id; used by the GC root walk, which treats
    /// the whole interning table as permanently live.
    pub fn all_ids(&self) -> impl Iterator<Item = StrId> + '_ {
        self.buckets.values().flatten().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_same_bytes_is_pointer_identical() {
        let mut arena = Arena::new();
        let mut table = StringTable::new();
        let a = table.intern(&mut arena, b"hello");
        let b = table.intern(&mut arena, b"hello");
        assert_eq!(a, b);
        assert_eq!(arena.live_count(), 1);
    }

    #[test]
    fn distinct_bytes_intern_distinctly() {
        let mut arena = Arena::new();
        let mut table = StringTable::new();
        let a = table.intern(&mut arena, b"hello");
        let b = table.intern(&mut arena, b"world");
        assert_ne!(a, b);
    }

    #[test]
    fn murmur2_known_vector_is_deterministic() {
        let h1 = murmur2(b"hello", 0);
        let h2 = murmur2(b"hello", 0);
        assert_eq!(h1, h2);
        assert_ne!(h1, murmur2(b"world", 0));
    }
}
