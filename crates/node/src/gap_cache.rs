//! Parking lots for blocks missing a dependency.
//!
//! A gap cache holds one block per missing hash. When the missing hash
//! commits, the parked block is released back into the admit queue; entries
//! that never resolve age out.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_types::{Block, BlockHash};

struct Entry {
    block: Arc<Block>,
    arrived: Instant,
}

/// Bounded, aged map from a missing hash to the block waiting on it.
pub struct GapCache {
    entries: Mutex<HashMap<BlockHash, Entry>>,
    max_entries: usize,
    max_age: Duration,
}

impl GapCache {
    pub const DEFAULT_MAX: usize = 16 * 1024;
    pub const DEFAULT_AGE: Duration = Duration::from_secs(300);

    pub fn new(max_entries: usize, max_age: Duration) -> Self {
        GapCache {
            entries: Mutex::new(HashMap::new()),
            max_entries,
            max_age,
        }
    }

    /// Parks `block` until `missing` appears. A newer block for the same gap
    /// replaces the old one; a full cache drops the insert.
    pub fn insert(&self, missing: BlockHash, block: Arc<Block>) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries && !entries.contains_key(&missing) {
            return;
        }
        entries.insert(
            missing,
            Entry {
                block,
                arrived: Instant::now(),
            },
        );
    }

    /// Releases the block waiting on `hash`, if any.
    pub fn take(&self, hash: &BlockHash) -> Option<Arc<Block>> {
        self.entries.lock().remove(hash).map(|e| e.block)
    }

    /// Drops entries older than the age bound.
    pub fn age(&self) {
        let cutoff = Instant::now() - self.max_age;
        self.entries.lock().retain(|_, e| e.arrived >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for GapCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX, Self::DEFAULT_AGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_crypto::KeyPair;
    use strand_types::block::{BlockOpcode, Note, TxBlock};
    use strand_types::params;
    use strand_types::{Amount, U256};

    fn block() -> Arc<Block> {
        let key = KeyPair::generate();
        Arc::new(Block::Tx(TxBlock::new(
            BlockOpcode::Send,
            1,
            1,
            params::EPOCH_TIMESTAMP,
            1,
            key.public_key,
            U256::from_u64(1),
            U256::from_u64(2),
            Amount(1),
            U256::from_u64(3),
            Note::empty(),
            &key.private_key.signing_key(),
        )))
    }

    #[test]
    fn park_and_release() {
        let cache = GapCache::default();
        let missing = U256::from_u64(77);
        let parked = block();
        cache.insert(missing, parked.clone());
        assert_eq!(cache.len(), 1);
        assert!(cache.take(&U256::from_u64(78)).is_none());
        let released = cache.take(&missing).unwrap();
        assert_eq!(released.hash(), parked.hash());
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_bound() {
        let cache = GapCache::new(2, Duration::from_secs(300));
        cache.insert(U256::from_u64(1), block());
        cache.insert(U256::from_u64(2), block());
        cache.insert(U256::from_u64(3), block());
        assert_eq!(cache.len(), 2);

        // Replacing an existing gap is allowed at capacity.
        let replacement = block();
        cache.insert(U256::from_u64(1), replacement.clone());
        assert_eq!(cache.take(&U256::from_u64(1)).unwrap().hash(), replacement.hash());
    }

    #[test]
    fn aging_evicts() {
        let cache = GapCache::new(10, Duration::from_millis(0));
        cache.insert(U256::from_u64(1), block());
        std::thread::sleep(Duration::from_millis(5));
        cache.age();
        assert!(cache.is_empty());
    }
}
