//! Signature verification cache.
//!
//! ECDSA verification dominates script-checking cost and the same
//! `(message, signature, pubkey)` triple is routinely checked more than once
//! (mempool acceptance, then block connection). The cache remembers triples
//! that verified successfully; a miss proves nothing and is re-verified.
//!
//! The cache is a plain value injected into the interpreter rather than a
//! process-wide singleton, so callers control sharing and tests can supply a
//! deterministic instance.

use std::collections::HashSet;
use std::sync::RwLock;

use bitcoin::hashes::{sha256, Hash, HashEngine};

pub(crate) const DEFAULT_SIG_CACHE_CAPACITY: usize = 1 << 16;

/// A bounded set of signature triples proven valid.
///
/// Reads take a shared lock, so concurrent verification threads can probe the
/// cache in parallel; inserts take the exclusive lock and evict an arbitrary
/// entry once the capacity is reached.
#[derive(Debug)]
pub struct SigCache {
    entries: RwLock<HashSet<[u8; 32]>>,
    capacity: usize,
}

impl SigCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashSet::new()),
            capacity,
        }
    }

    /// Whether the triple is known to verify.
    pub fn contains(&self, msg32: &[u8; 32], sig: &[u8], pubkey: &[u8]) -> bool {
        let key = Self::key(msg32, sig, pubkey);
        self.entries
            .read()
            .map(|entries| entries.contains(&key))
            .unwrap_or(false)
    }

    /// Records a triple that verified successfully.
    pub fn insert(&self, msg32: &[u8; 32], sig: &[u8], pubkey: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        let key = Self::key(msg32, sig, pubkey);
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        if entries.len() >= self.capacity && !entries.contains(&key) {
            let victim = entries.iter().next().copied();
            if let Some(victim) = victim {
                entries.remove(&victim);
            }
        }
        entries.insert(key);
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key(msg32: &[u8; 32], sig: &[u8], pubkey: &[u8]) -> [u8; 32] {
        let mut engine = sha256::Hash::engine();
        engine.input(msg32);
        engine.input(&(sig.len() as u32).to_le_bytes());
        engine.input(sig);
        engine.input(pubkey);
        sha256::Hash::from_engine(engine).to_byte_array()
    }
}

impl Default for SigCache {
    fn default() -> Self {
        Self::new(DEFAULT_SIG_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_hit() {
        let cache = SigCache::new(16);
        let msg = [7u8; 32];
        assert!(!cache.contains(&msg, &[1, 2, 3], &[4, 5]));
        cache.insert(&msg, &[1, 2, 3], &[4, 5]);
        assert!(cache.contains(&msg, &[1, 2, 3], &[4, 5]));
        // Any component change misses.
        assert!(!cache.contains(&msg, &[1, 2, 3], &[4, 6]));
        assert!(!cache.contains(&[8u8; 32], &[1, 2, 3], &[4, 5]));
    }

    #[test]
    fn capacity_is_respected() {
        let cache = SigCache::new(4);
        for i in 0u8..32 {
            cache.insert(&[i; 32], &[i], &[i]);
        }
        assert!(cache.len() <= 4);
    }

    #[test]
    fn zero_capacity_never_stores() {
        let cache = SigCache::new(0);
        cache.insert(&[1u8; 32], &[2], &[3]);
        assert!(cache.is_empty());
    }
}
