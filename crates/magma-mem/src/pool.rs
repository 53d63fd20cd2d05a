//! # Slot Pool
//!
//! Fixed-stride slot allocation over a bitmap. The lowest free slot is always
//! handed out first, so a pool that drains back to empty lays its next slots
//! out exactly as before. Slots are addressed by byte offset from the pool
//! base, which lets a pool be laid out before it is mapped into any GPU VM.

use alloc::vec;
use alloc::vec::Vec;

use magma_core::{ByteSize, Error, Result};

const WORD_BITS: u32 = u64::BITS;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Slot pool layout
#[derive(Debug, Clone)]
pub struct SlotConfig {
    /// Bytes used by one slot
    pub slot_size: ByteSize,
    /// Number of slots
    pub slots: u32,
    /// Slot alignment in bytes
    pub alignment: u64,
}

impl SlotConfig {
    /// Layout for 16-byte hardware semaphores
    pub const fn semaphores(slots: u32) -> Self {
        Self {
            slot_size: ByteSize::from_bytes(16),
            slots,
            alignment: 16,
        }
    }

    /// Distance between consecutive slots
    pub const fn stride(&self) -> u64 {
        (self.slot_size.as_bytes() + self.alignment - 1) & !(self.alignment - 1)
    }

    /// Bytes covered by the whole pool
    pub const fn span(&self) -> ByteSize {
        ByteSize::from_bytes(self.slots as u64 * self.stride())
    }
}

// =============================================================================
// SLOT POOL
// =============================================================================

/// A slot handed out by [`SlotPool::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Slot number
    pub index: u32,
    /// Byte offset from the pool base
    pub offset: u64,
}

/// Slot pool counters
#[derive(Debug, Clone, Default)]
pub struct SlotStats {
    /// Slots handed out
    pub allocs: u64,
    /// Slots returned
    pub frees: u64,
    /// Most slots in use at once
    pub peak_used: u32,
}

/// Bitmap-backed slot allocator
#[derive(Debug)]
pub struct SlotPool {
    config: SlotConfig,
    /// One bit per slot, set while in use
    bitmap: Vec<u64>,
    used: u32,
    stats: SlotStats,
}

impl SlotPool {
    /// Create an empty pool
    pub fn new(config: SlotConfig) -> Self {
        let words = config.slots.div_ceil(WORD_BITS) as usize;
        Self {
            config,
            bitmap: vec![0; words],
            used: 0,
            stats: SlotStats::default(),
        }
    }

    /// Take the lowest free slot
    pub fn allocate(&mut self) -> Result<Slot> {
        let index = self.first_free().ok_or(Error::OutOfMemory)?;

        self.bitmap[(index / WORD_BITS) as usize] |= 1 << (index % WORD_BITS);
        self.used += 1;
        self.stats.allocs += 1;
        self.stats.peak_used = self.stats.peak_used.max(self.used);

        Ok(Slot {
            index,
            offset: u64::from(index) * self.config.stride(),
        })
    }

    /// Return a slot
    ///
    /// Freeing a slot that is not in use is rejected.
    pub fn free(&mut self, slot: Slot) -> Result<()> {
        if slot.index >= self.config.slots {
            return Err(Error::InvalidParameter);
        }

        let word = &mut self.bitmap[(slot.index / WORD_BITS) as usize];
        let bit = 1u64 << (slot.index % WORD_BITS);
        if *word & bit == 0 {
            return Err(Error::InvalidParameter);
        }

        *word &= !bit;
        self.used -= 1;
        self.stats.frees += 1;
        Ok(())
    }

    fn first_free(&self) -> Option<u32> {
        self.bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(i, word)| i as u32 * WORD_BITS + word.trailing_ones())
            .filter(|index| *index < self.config.slots)
    }

    /// Counters
    pub fn stats(&self) -> &SlotStats {
        &self.stats
    }

    /// Slots available
    pub fn free_count(&self) -> u32 {
        self.config.slots - self.used
    }

    /// Slots in use
    pub fn used_count(&self) -> u32 {
        self.used
    }

    /// Bytes covered by the pool
    pub fn span(&self) -> ByteSize {
        self.config.span()
    }
}
