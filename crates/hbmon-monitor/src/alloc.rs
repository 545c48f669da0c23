//! Counter slot allocation.
//!
//! First-fit bitmap over the group's slot capacity. The index handed
//! out is stable for the producer's lifetime and fixes its counter's
//! byte offset in the counters region, so the lowest free index is
//! always preferred and released indices are reused.

use core::sync::atomic::{AtomicU64, Ordering};

use hbmon_core::error::{MonitorError, MonitorResult};

const BITS_PER_BLOCK: usize = 64;

/// First-fit bitmap allocator for counter slot indices.
pub struct SlotBitmap {
    blocks: Box<[AtomicU64]>,
    capacity: usize,
}

impl SlotBitmap {
    pub fn new(capacity: usize) -> Self {
        let num_blocks = (capacity + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK;
        let blocks: Vec<AtomicU64> = (0..num_blocks).map(|_| AtomicU64::new(0)).collect();
        SlotBitmap {
            blocks: blocks.into_boxed_slice(),
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bits beyond `capacity` in the last block are never allocatable.
    fn valid_mask(&self, block_idx: usize) -> u64 {
        let remaining = self.capacity - block_idx * BITS_PER_BLOCK;
        if remaining >= BITS_PER_BLOCK {
            u64::MAX
        } else {
            (1u64 << remaining) - 1
        }
    }

    /// Claim the lowest free index.
    pub fn allocate(&self) -> MonitorResult<usize> {
        for (block_idx, block) in self.blocks.iter().enumerate() {
            let mask = self.valid_mask(block_idx);
            loop {
                let current = block.load(Ordering::Acquire);
                let free = !current & mask;
                if free == 0 {
                    break;
                }
                let bit = free.trailing_zeros() as usize;
                match block.compare_exchange_weak(
                    current,
                    current | (1u64 << bit),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok(block_idx * BITS_PER_BLOCK + bit),
                    Err(_) => continue,
                }
            }
        }
        Err(MonitorError::CapacityExhausted)
    }

    /// Return `index` to the pool. Callers must not release twice.
    pub fn release(&self, index: usize) {
        debug_assert!(index < self.capacity);
        let block = index / BITS_PER_BLOCK;
        let bit = index % BITS_PER_BLOCK;
        self.blocks[block].fetch_and(!(1u64 << bit), Ordering::AcqRel);
    }

    #[cfg(test)]
    fn is_allocated(&self, index: usize) -> bool {
        let block = index / BITS_PER_BLOCK;
        let bit = index % BITS_PER_BLOCK;
        self.blocks[block].load(Ordering::Acquire) & (1u64 << bit) != 0
    }
}
