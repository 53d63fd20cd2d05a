//! # Semaphore Pool
//!
//! GPU-visible semaphore slots, one pool per channel.
//!
//! A slot is `Free` in the pool, `Acquired` once handed out, and `Released`
//! once the payload has been written (by the GPU or by the host). Ownership
//! is an `Arc<Semaphore>`: the slot goes back to the pool when the last
//! owner drops it.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use magma_core::{Error, GpuAddr, GpuVm, MapFlags, PAGE_SIZE, Result};
use magma_mem::{Slot, SlotConfig, SlotPool};
use spin::Mutex;

const SEMA_ACQUIRED: u32 = 0;
const SEMA_RELEASED: u32 = 1;

// =============================================================================
// POOL
// =============================================================================

struct PoolInner {
    slots: SlotPool,
    mapping: Option<(Arc<dyn GpuVm>, GpuAddr)>,
}

/// Semaphore pool statistics
#[derive(Debug, Clone, Default)]
pub struct SemaphorePoolStats {
    /// Slots handed out
    pub allocs: u64,
    /// Slots returned
    pub frees: u64,
    /// Releases observed
    pub releases: u64,
    /// High water mark
    pub peak_used: u32,
}

/// A pool of semaphore slots
pub struct SemaphorePool {
    name: String,
    inner: Mutex<PoolInner>,
    values: Vec<AtomicU32>,
    releases: AtomicU64,
}

impl SemaphorePool {
    /// Create a pool of `slots` semaphores
    pub fn new(name: impl Into<String>, slots: u32) -> Arc<Self> {
        let name = name.into();
        log::debug!("sema pool '{}': {} slots", name, slots);
        Arc::new(Self {
            name,
            inner: Mutex::new(PoolInner {
                slots: SlotPool::new(SlotConfig::semaphores(slots)),
                mapping: None,
            }),
            values: (0..slots).map(|_| AtomicU32::new(SEMA_ACQUIRED)).collect(),
            releases: AtomicU64::new(0),
        })
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Map the pool into a channel VM
    pub fn map(&self, vm: Arc<dyn GpuVm>, flags: MapFlags) -> Result<GpuAddr> {
        let mut inner = self.inner.lock();
        if inner.mapping.is_some() {
            return Err(Error::InvalidState);
        }

        let size = inner.slots.span().align_up(PAGE_SIZE);
        let va = vm.map(size, flags)?;
        log::debug!("sema pool '{}': mapped {} at {}", self.name, size, va);
        inner.mapping = Some((vm, va));
        Ok(va)
    }

    /// Unmap the pool
    pub fn unmap(&self) -> Result<()> {
        let (vm, va) = self.inner.lock().mapping.take().ok_or(Error::NotMapped)?;
        log::debug!("sema pool '{}': unmapped {}", self.name, va);
        vm.unmap(va)
    }

    /// Base address in the mapped VM
    pub fn gpu_va(&self) -> Option<GpuAddr> {
        self.inner.lock().mapping.as_ref().map(|(_, va)| *va)
    }

    /// Hand out a free slot
    pub fn alloc(self: &Arc<Self>) -> Result<Arc<Semaphore>> {
        let slot = self.inner.lock().slots.allocate().map_err(|_| {
            log::error!("sema pool '{}': ran out of semaphores", self.name);
            Error::OutOfSemaphores
        })?;

        self.values[slot.index as usize].store(SEMA_ACQUIRED, Ordering::Release);
        log::trace!("sema pool '{}': acquired slot {}", self.name, slot.index);
        Ok(Arc::new(Semaphore {
            pool: self.clone(),
            slot,
        }))
    }

    /// Slots available
    pub fn free_count(&self) -> u32 {
        self.inner.lock().slots.free_count()
    }

    /// Get statistics
    pub fn stats(&self) -> SemaphorePoolStats {
        let inner = self.inner.lock();
        let slots = inner.slots.stats();
        SemaphorePoolStats {
            allocs: slots.allocs,
            frees: slots.frees,
            releases: self.releases.load(Ordering::Relaxed),
            peak_used: slots.peak_used,
        }
    }

    fn free(&self, slot: Slot) {
        if let Err(e) = self.inner.lock().slots.free(slot) {
            log::error!("sema pool '{}': free of slot {}: {}", self.name, slot.index, e);
        }
    }
}

impl Drop for SemaphorePool {
    fn drop(&mut self) {
        if self.inner.get_mut().mapping.is_some() {
            if let Err(e) = self.unmap() {
                log::error!("sema pool '{}': unmap on drop: {}", self.name, e);
            }
        }
    }
}

impl fmt::Debug for SemaphorePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphorePool")
            .field("name", &self.name)
            .field("gpu_va", &self.gpu_va())
            .field("free", &self.free_count())
            .finish()
    }
}

// =============================================================================
// SEMAPHORE
// =============================================================================

/// One semaphore slot
pub struct Semaphore {
    pool: Arc<SemaphorePool>,
    slot: Slot,
}

impl Semaphore {
    /// Slot index within the pool
    pub fn index(&self) -> u32 {
        self.slot.index
    }

    /// Owning pool
    pub fn pool(&self) -> &Arc<SemaphorePool> {
        &self.pool
    }

    /// GPU address of the slot, if the pool is mapped
    pub fn gpu_va(&self) -> Option<GpuAddr> {
        self.pool.gpu_va().map(|base| base + self.slot.offset)
    }

    /// Write the release payload
    ///
    /// Each acquired slot is released exactly once.
    pub fn release(&self) {
        let prev = self.pool.values[self.slot.index as usize].swap(SEMA_RELEASED, Ordering::AcqRel);
        if prev == SEMA_RELEASED {
            log::error!("sema pool '{}': slot {} released twice", self.pool.name, self.slot.index);
            debug_assert!(false, "semaphore released twice");
            return;
        }
        self.pool.releases.fetch_add(1, Ordering::Relaxed);
        log::trace!("sema pool '{}': released slot {}", self.pool.name, self.slot.index);
    }

    /// Check if the payload has been written
    pub fn is_released(&self) -> bool {
        self.pool.values[self.slot.index as usize].load(Ordering::Acquire) == SEMA_RELEASED
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.pool.free(self.slot);
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("pool", &self.pool.name)
            .field("index", &self.slot.index)
            .field("released", &self.is_released())
            .finish()
    }
}

static_assertions::assert_impl_all!(Semaphore: Send, Sync);
static_assertions::assert_impl_all!(SemaphorePool: Send, Sync);
