//! # Private Command Buffer
//!
//! Per-channel scratch ring the sync backends stage their method words in.
//!
//! The ring hands out contiguous regions. A request that does not fit before
//! the end of the ring wraps to offset 0 and the tail is skipped. Regions are
//! reclaimed strictly in allocation order: freeing a newer region before an
//! older one only marks it done, and `get` advances once every older region
//! is done as well.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use magma_core::{Error, GpuAddr, Result};
use spin::Mutex;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Private command buffer configuration
#[derive(Debug, Clone)]
pub struct PrivCmdConfig {
    /// Ring size in 32-bit words
    pub size_words: u32,
    /// GPU address of the ring
    pub gpu_va: GpuAddr,
}

impl Default for PrivCmdConfig {
    fn default() -> Self {
        Self {
            size_words: 4096,
            gpu_va: GpuAddr::null(),
        }
    }
}

// =============================================================================
// ENTRY
// =============================================================================

type CmdMemory = Mutex<Vec<u32>>;

/// A region of the private command buffer
///
/// Owned exclusively by the caller. Dropping the entry hands the region back
/// to the ring; [`PrivCmdBuffer::free`] does the same and reports misuse.
#[derive(Debug)]
pub struct PrivCmdEntry {
    mem: Arc<CmdMemory>,
    ring: Weak<Mutex<RingState>>,
    seq: u64,
    off: u32,
    size: u32,
    gpu_va: GpuAddr,
    retired: bool,
}

impl PrivCmdEntry {
    /// Offset into the ring, in words
    pub fn off(&self) -> u32 {
        self.off
    }

    /// Size in words
    pub fn size(&self) -> u32 {
        self.size
    }

    /// GPU address of the first word
    pub fn gpu_va(&self) -> GpuAddr {
        self.gpu_va
    }

    /// Write `words` starting `at` words into the region
    pub fn write(&mut self, at: u32, words: &[u32]) -> Result<()> {
        let end = at as usize + words.len();
        if end > self.size as usize {
            log::error!(
                "priv cmdbuf: write of {} words at {} overflows entry of {}",
                words.len(),
                at,
                self.size
            );
            return Err(Error::InvalidParameter);
        }

        let base = (self.off + at) as usize;
        self.mem.lock()[base..base + words.len()].copy_from_slice(words);
        Ok(())
    }

    /// Zero `len` words starting `at` words into the region
    pub fn zero(&mut self, at: u32, len: u32) -> Result<()> {
        if at + len > self.size {
            return Err(Error::InvalidParameter);
        }

        let base = (self.off + at) as usize;
        self.mem.lock()[base..base + len as usize].fill(0);
        Ok(())
    }

    /// Snapshot of the region's words
    pub fn words(&self) -> Vec<u32> {
        let base = self.off as usize;
        self.mem.lock()[base..base + self.size as usize].to_vec()
    }
}

impl Drop for PrivCmdEntry {
    fn drop(&mut self) {
        if self.retired {
            return;
        }
        // A ring torn down first has nothing left to reclaim.
        if let Some(ring) = self.ring.upgrade() {
            if let Err(e) = ring.lock().retire(self.seq) {
                log::error!("priv cmdbuf: drop of entry {}: {}", self.seq, e);
            }
        }
    }
}

// =============================================================================
// PRIVATE COMMAND BUFFER
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    seq: u64,
    /// Value of `put` right after this region was allocated
    end: u32,
    done: bool,
}

/// Private command buffer statistics
#[derive(Debug, Clone, Default)]
pub struct PrivCmdStats {
    /// Total allocations
    pub allocs: u64,
    /// Total regions reclaimed
    pub frees: u64,
    /// Allocations that wrapped to the start of the ring
    pub wraps: u64,
    /// Allocations refused for lack of space
    pub stalls: u64,
}

/// put/get bookkeeping shared with live entries
#[derive(Debug)]
struct RingState {
    size: u32,
    /// Next free word (host-side)
    put: u32,
    /// Oldest word still owned by an entry
    get: u32,
    next_seq: u64,
    outstanding: VecDeque<Outstanding>,
    stats: PrivCmdStats,
}

impl RingState {
    fn free_words(&self) -> u32 {
        if self.put >= self.get {
            self.size - (self.put - self.get) - 1
        } else {
            self.get - self.put - 1
        }
    }

    /// Reserve `size` words, returning (seq, offset)
    fn reserve(&mut self, size: u32) -> Result<(u64, u32)> {
        let ring = self.size;
        if size == 0 || size >= ring {
            return Err(Error::InvalidParameter);
        }

        // An idle ring starts over at 0, so no tail is skipped.
        if self.outstanding.is_empty() {
            self.put = 0;
            self.get = 0;
        }

        let wraps = self.put + size > ring;
        let needed = if wraps { size + (ring - self.put) } else { size };

        if needed > self.free_words() {
            self.stats.stalls += 1;
            log::debug!(
                "priv cmdbuf: {} words requested, {} free (put={} get={})",
                size,
                self.free_words(),
                self.put,
                self.get
            );
            return Err(Error::CommandBufferFull);
        }

        let off = if wraps { 0 } else { self.put };
        self.put = (off + size) % ring;
        if wraps {
            self.stats.wraps += 1;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.outstanding.push_back(Outstanding {
            seq,
            end: self.put,
            done: false,
        });
        self.stats.allocs += 1;
        Ok((seq, off))
    }

    /// Mark a region done and reclaim the done prefix
    fn retire(&mut self, seq: u64) -> Result<()> {
        let slot = self
            .outstanding
            .iter_mut()
            .find(|o| o.seq == seq && !o.done)
            .ok_or(Error::NotFound)?;
        slot.done = true;

        while let Some(front) = self.outstanding.front().copied() {
            if !front.done {
                break;
            }
            self.get = front.end;
            self.outstanding.pop_front();
            self.stats.frees += 1;
        }
        Ok(())
    }
}

/// Per-channel FIFO ring of command words
#[derive(Debug)]
pub struct PrivCmdBuffer {
    config: PrivCmdConfig,
    mem: Arc<CmdMemory>,
    state: Arc<Mutex<RingState>>,
}

impl PrivCmdBuffer {
    /// Create a new ring
    pub fn new(config: PrivCmdConfig) -> Self {
        let mem = Arc::new(Mutex::new(alloc::vec![0; config.size_words as usize]));
        let state = Arc::new(Mutex::new(RingState {
            size: config.size_words,
            put: 0,
            get: 0,
            next_seq: 0,
            outstanding: VecDeque::new(),
            stats: PrivCmdStats::default(),
        }));
        Self { config, mem, state }
    }

    /// Ring capacity in words
    pub fn capacity(&self) -> u32 {
        self.config.size_words
    }

    /// Words available to new allocations
    ///
    /// One word is kept back so that `put == get` always means empty.
    pub fn free_words(&self) -> u32 {
        self.state.lock().free_words()
    }

    /// Number of regions not yet reclaimed
    pub fn outstanding_count(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Allocate a region of `size` words
    pub fn alloc(&mut self, size: u32) -> Result<PrivCmdEntry> {
        let (seq, off) = self.state.lock().reserve(size)?;

        Ok(PrivCmdEntry {
            mem: self.mem.clone(),
            ring: Arc::downgrade(&self.state),
            seq,
            off,
            size,
            gpu_va: self.config.gpu_va + off as u64 * 4,
            retired: false,
        })
    }

    /// Hand a region back once the GPU has consumed it
    pub fn free(&mut self, mut entry: PrivCmdEntry) -> Result<()> {
        if !Arc::ptr_eq(&self.mem, &entry.mem) {
            log::error!("priv cmdbuf: entry freed to foreign buffer");
            return Err(Error::InvalidParameter);
        }

        entry.retired = true;
        self.state.lock().retire(entry.seq)
    }

    /// Get statistics
    pub fn stats(&self) -> PrivCmdStats {
        self.state.lock().stats.clone()
    }
}
