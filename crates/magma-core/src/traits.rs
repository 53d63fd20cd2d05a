//! # MAGMA Core Traits
//!
//! Seams to the hardware collaborators the sync stack consumes but does not
//! implement.
//!
//! ## Trait Hierarchy
//!
//! ```text
//! Channel Sync Backend
//!    │
//!    ├── SyncpointHost (counter pool, expiry, interrupt notifiers)
//!    │
//!    └── GpuVm (map/unmap semaphore pools into a channel VM)
//! ```
//!
//! Both traits are object safe; backends hold them as `Arc<dyn ...>` so that
//! completion callbacks can outlive the channel that registered them.

use alloc::boxed::Box;

use crate::error::Result;
use crate::types::*;

// =============================================================================
// SYNCPOINT HOST
// =============================================================================

/// Callback run when a syncpoint reaches a registered threshold.
///
/// The argument is the number of notifiers completed in the same pass.
pub type NotifierFn = Box<dyn FnOnce(u32) + Send + 'static>;

/// Hardware syncpoint host (the host1x block on Tegra parts)
///
/// Each syncpoint keeps two values: `min`, the last value observed from the
/// hardware counter, and `max`, the highest threshold promised to software.
/// The GPU is the only writer of `min` during normal operation.
pub trait SyncpointHost: Send + Sync {
    /// Allocate a host-managed syncpoint keyed by the owning channel
    fn alloc_host_managed(&self, owner: ChannelId, name: &str) -> Result<SyncpointId>;

    /// Return a syncpoint to the global pool
    fn put_ref(&self, id: SyncpointId);

    /// Check that `id` names a syncpoint of this host
    fn is_valid(&self, id: SyncpointId) -> bool;

    /// Check if the observed value has reached `thresh`
    fn is_expired(&self, id: SyncpointId, thresh: u32) -> bool;

    /// Last observed value
    fn read_min(&self, id: SyncpointId) -> u32;

    /// Highest promised value
    fn read_max(&self, id: SyncpointId) -> u32;

    /// Reserve `incrs` future increments, returning the new max
    fn incr_max(&self, id: SyncpointId, incrs: u32) -> u32;

    /// Force the observed value up to max
    fn set_min_eq_max(&self, id: SyncpointId);

    /// Run `callback` once the syncpoint reaches `thresh`
    ///
    /// If the threshold has already been reached the callback runs before
    /// this returns.
    fn register_notifier(&self, id: SyncpointId, thresh: u32, callback: NotifierFn)
        -> Result<()>;
}

// =============================================================================
// GPU VIRTUAL MEMORY
// =============================================================================

bitflags::bitflags! {
    /// Flags for mapping memory into a GPU address space
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Map read-only (non-owner channels)
        const READ_ONLY = 1 << 0;
    }
}

/// A channel's GPU virtual address space
pub trait GpuVm: Send + Sync {
    /// Address space id, if the VM is shared through an AS handle
    fn asid(&self) -> Option<u32>;

    /// Reserve and map `size` bytes, returning the GPU VA
    fn map(&self, size: ByteSize, flags: MapFlags) -> Result<GpuAddr>;

    /// Unmap a range previously returned by [`GpuVm::map`]
    fn unmap(&self, addr: GpuAddr) -> Result<()>;
}

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::assert_impl_all!(GpuAddr: Send, Sync, Copy);
static_assertions::assert_impl_all!(ByteSize: Send, Sync, Copy);
static_assertions::assert_impl_all!(SyncpointId: Send, Sync, Copy);
static_assertions::assert_obj_safe!(SyncpointHost, GpuVm);
