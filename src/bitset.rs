//! Concurrent bitset used for slot selection.
//!
//! Scheduled slots of each execution kind are tracked by one of these, as is
//! the group's free pool. The set is partitioned into 64-bit blocks; a
//! publisher sets a bit, and a selector picks a non-empty block and
//! CAS-clears one bit out of it, claiming that slot index. Selection starts
//! from a per-caller rotating cursor so concurrent selectors spread across
//! blocks instead of contending on the first non-empty one.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

pub(crate) const BITS_PER_BLOCK: usize = 64;

pub(crate) struct AtomicBitSet {
    blocks: Box<[CachePadded<AtomicU64>]>,
}

impl AtomicBitSet {
    /// Creates a set holding `bits` bits, all clear. `bits` must be a whole
    /// number of blocks; the group rounds its capacity up to guarantee this.
    pub(crate) fn new(bits: usize) -> Self {
        debug_assert!(bits % BITS_PER_BLOCK == 0);
        let blocks = (0..bits / BITS_PER_BLOCK)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect();
        Self { blocks }
    }

    /// Creates a set holding `bits` bits with the first `set` of them set.
    /// Used for the free pool, where the tail of the last block pads the
    /// capacity out to a whole block but never names a slot.
    pub(crate) fn new_first_set(bits: usize, set: usize) -> Self {
        debug_assert!(bits % BITS_PER_BLOCK == 0);
        debug_assert!(set <= bits);
        let blocks = (0..bits / BITS_PER_BLOCK)
            .map(|block| {
                let low = block * BITS_PER_BLOCK;
                let in_block = set.saturating_sub(low).min(BITS_PER_BLOCK);
                let word = if in_block == BITS_PER_BLOCK {
                    u64::MAX
                } else {
                    (1u64 << in_block) - 1
                };
                CachePadded::new(AtomicU64::new(word))
            })
            .collect();
        Self { blocks }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.blocks.len() * BITS_PER_BLOCK
    }

    /// Sets `index`, returning true if this call changed it from clear to set.
    pub(crate) fn set(&self, index: usize) -> bool {
        let mask = 1u64 << (index % BITS_PER_BLOCK);
        let prior = self.blocks[index / BITS_PER_BLOCK].fetch_or(mask, Ordering::AcqRel);
        prior & mask == 0
    }

    /// Clears `index`, returning true if this call changed it from set to clear.
    pub(crate) fn clear(&self, index: usize) -> bool {
        let mask = 1u64 << (index % BITS_PER_BLOCK);
        let prior = self.blocks[index / BITS_PER_BLOCK].fetch_and(!mask, Ordering::AcqRel);
        prior & mask != 0
    }

    /// True when no bit is set. A racing publisher may flip this immediately
    /// afterwards; callers treat it as a snapshot.
    pub(crate) fn is_empty(&self) -> bool {
        self.blocks
            .iter()
            .all(|block| block.load(Ordering::Acquire) == 0)
    }

    /// Claims one set bit and returns its index, or `None` when the set is
    /// observed empty. Wait-free in the empty case; under contention the CAS
    /// retries only while the chosen block stays non-empty.
    ///
    /// `cursor` picks the starting block and should rotate per caller.
    pub(crate) fn try_acquire(&self, cursor: usize) -> Option<usize> {
        let num_blocks = self.blocks.len();
        if num_blocks == 0 {
            return None;
        }
        let start = cursor % num_blocks;
        for offset in 0..num_blocks {
            let block_index = (start + offset) % num_blocks;
            if let Some(bit) = self.acquire_in_block(block_index) {
                return Some(block_index * BITS_PER_BLOCK + bit);
            }
        }
        None
    }

    fn acquire_in_block(&self, block_index: usize) -> Option<usize> {
        let block = &self.blocks[block_index];
        let backoff = Backoff::new();
        let mut current = block.load(Ordering::Acquire);
        while current != 0 {
            let bit = current.trailing_zeros() as usize;
            let mask = 1u64 << bit;
            match block.compare_exchange_weak(
                current,
                current & !mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(bit),
                Err(observed) => {
                    current = observed;
                    backoff.spin();
                }
            }
        }
        None
    }
}
