//! Deterministic FNV-1a hashing for destination selection.
//!
//! `std`'s default hasher is randomly seeded per process, so two workers
//! would disagree on where a key belongs.

use std::hash::{Hash, Hasher};

const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const PRIME: u64 = 0x100000001b3;

#[derive(Debug, Clone, Copy)]
pub struct Fnv1aHasher(u64);

impl Default for Fnv1aHasher {
    fn default() -> Self {
        Self(OFFSET_BASIS)
    }
}

impl Hasher for Fnv1aHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(PRIME);
        }
    }
}

/// FNV-1a hash of `key` through its `Hash` impl.
pub fn fnv1a<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut h = Fnv1aHasher::default();
    key.hash(&mut h);
    h.finish()
}
