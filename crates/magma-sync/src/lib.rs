//! # MAGMA Channel Sync
//!
//! Lets a submission path express "wait until X" and "signal that this batch
//! is done" as method words in a channel's command stream, and carries GPU
//! completion back to host-visible fences.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        dyn ChannelSync                            │
//! │                                                                   │
//! │   ┌──────────────────────┐        ┌────────────────────────────┐  │
//! │   │    ChannelSyncpt     │        │     ChannelSemaphore       │  │
//! │   │  one host1x counter  │        │  SemaphorePool + Timeline  │  │
//! │   │  +2 per increment    │        │  WaitFenceWork bridges     │  │
//! │   └──────────┬───────────┘        └─────────────┬──────────────┘  │
//! │              │                                  │                 │
//! │              └────────────┬─────────────────────┘                 │
//! │                           ▼                                       │
//! │           ┌────────────────────────┐    ┌──────────────┐          │
//! │           │ encoder → PrivCmdEntry │───▶│  Arc<Fence>  │          │
//! │           └────────────────────────┘    └──────────────┘          │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The backend is chosen once per channel by [`create`]: syncpoints when the
//! platform has a syncpoint host, semaphores otherwise.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod bridge;
pub mod channel;
pub mod config;
pub mod external;
pub mod fence;
pub mod host1x;
pub mod sema;
pub mod semaphore;
pub mod syncpt;
pub mod timeline;

use alloc::boxed::Box;
use alloc::sync::Arc;

use magma_cmd::PrivCmdEntry;
use magma_core::{Result, SyncpointId};

// Re-exports
pub use bridge::{BridgeState, WaitFenceWork};
pub use channel::Channel;
pub use config::{Capabilities, SyncConfig, SyncPlatform};
pub use external::{AsyncWait, ExternalFence, FenceStatus, SyncFdTable, SyncFence, SyncPoint};
pub use fence::Fence;
pub use host1x::{Host1x, Host1xConfig};
pub use sema::ChannelSemaphore;
pub use semaphore::{Semaphore, SemaphorePool};
pub use syncpt::ChannelSyncpt;
pub use timeline::SyncTimeline;

// =============================================================================
// COMMANDS
// =============================================================================

/// Output of a wait operation
///
/// Both fields are `None` when there is nothing to wait for.
#[derive(Debug)]
pub struct WaitCmd {
    /// Region holding the wait methods
    pub entry: Option<PrivCmdEntry>,
    /// Fence keeping wait resources alive while the GPU runs the entry
    pub fence: Option<Arc<Fence>>,
}

impl WaitCmd {
    /// Nothing to wait for
    pub const fn empty() -> Self {
        Self {
            entry: None,
            fence: None,
        }
    }

    /// Check if there is nothing to submit
    pub fn is_empty(&self) -> bool {
        self.entry.is_none() && self.fence.is_none()
    }
}

/// Output of an increment operation
#[derive(Debug)]
pub struct IncrCmd {
    /// Region holding the increment methods
    pub entry: PrivCmdEntry,
    /// Fence completing when the GPU runs the entry
    pub fence: Arc<Fence>,
}

// =============================================================================
// CHANNEL SYNC
// =============================================================================

/// Sync backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// Host1x syncpoint
    Syncpoint,
    /// Semaphore pool
    Semaphore,
}

/// Per-channel synchronization backend
pub trait ChannelSync: Send + Sync + core::fmt::Debug {
    /// Backend kind
    fn kind(&self) -> SyncKind;

    /// Wait until syncpoint `id` reaches `thresh`
    fn wait_syncpt(&self, id: SyncpointId, thresh: u32) -> Result<WaitCmd>;

    /// Wait for an external fence
    fn wait_fence(&self, source: &dyn ExternalFence) -> Result<WaitCmd>;

    /// Wait for the fence behind a sync fd
    fn wait_fd(&self, fd: i32) -> Result<WaitCmd>;

    /// Increment without wait-for-idle, notifying the channel on completion
    fn incr(&self, need_sync_fence: bool) -> Result<IncrCmd>;

    /// Increment after wait-for-idle, without a completion notifier
    fn incr_wfi(&self) -> Result<IncrCmd>;

    /// Increment for a fence handed back to user space
    ///
    /// `wait_fence_fd` names the fence the submitted work was ordered after.
    fn incr_user(&self, wait_fence_fd: Option<i32>, wfi: bool, need_sync_fence: bool) -> Result<IncrCmd>;

    /// Force every outstanding threshold to read as reached
    fn set_min_eq_max(&self);

    /// Notify host observers of released semaphores
    fn signal_timeline(&self);

    /// Syncpoint in use, if any
    fn syncpt_id(&self) -> Option<SyncpointId>;
}

/// Create the sync backend for `channel`
pub fn create(channel: &Arc<Channel>, platform: &SyncPlatform) -> Result<Box<dyn ChannelSync>> {
    if platform.has_syncpoints() {
        return Ok(Box::new(ChannelSyncpt::new(channel.clone(), platform)?));
    }
    Ok(Box::new(ChannelSemaphore::new(channel.clone(), platform)?))
}

/// Tear down a sync backend
///
/// Outstanding fences and pending bridges stay valid; they hold their own
/// references to what they touch.
pub fn destroy(sync: Box<dyn ChannelSync>) {
    log::debug!("destroying {:?} sync", sync.kind());
    drop(sync);
}

static_assertions::assert_obj_safe!(ChannelSync);
static_assertions::assert_impl_all!(ChannelSyncpt: Send, Sync);
static_assertions::assert_impl_all!(ChannelSemaphore: Send, Sync);

// =============================================================================
// TEST SUPPORT
// =============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use std::thread;

    use magma_core::{Error, SyncpointHost};

    #[test]
    fn test_create_prefers_syncpoints() {
        let host = Arc::new(Host1x::new(Host1xConfig::default()));
        let sync = create(&testing::channel(0, 64), &testing::syncpt_platform(host.clone())).unwrap();
        assert_eq!(sync.kind(), SyncKind::Syncpoint);
        let id = sync.syncpt_id().unwrap();
        assert_eq!(host.allocated(), 1);
        destroy(sync);
        assert_eq!(host.allocated(), 0);
        assert_eq!(host.read_min(id), host.read_max(id));
    }

    #[test]
    fn test_create_falls_back_to_semaphores() {
        let mut platform = testing::sema_platform(8);
        platform.config.capabilities.insert(Capabilities::SYNCPOINTS);
        let sync = create(&testing::channel_with_vm(1, 64, Some(0)), &platform).unwrap();
        assert_eq!(sync.kind(), SyncKind::Semaphore);
        assert_eq!(sync.syncpt_id(), None);
    }

    #[test]
    fn test_create_fails_without_host_or_vm() {
        let platform = testing::sema_platform(8);
        assert_eq!(create(&testing::channel(2, 64), &platform).err(), Some(Error::InvalidState));
    }

    #[test]
    fn test_cross_channel_wait_through_fd() {
        let host = Arc::new(Host1x::new(Host1xConfig::default()));
        let sp_platform = testing::syncpt_platform(host.clone());
        let producer = create(&testing::channel(0, 64), &sp_platform).unwrap();

        let mut sema_platform = testing::sema_platform(4);
        sema_platform.fds = sp_platform.fds.clone();
        let consumer = create(&testing::channel_with_vm(1, 64, Some(1)), &sema_platform).unwrap();

        let done = producer.incr_user(None, true, true).unwrap();
        let fd = done.fence.install_fd(&sp_platform.fds).unwrap();
        let wait = consumer.wait_fd(fd).unwrap();
        let gate = wait.fence.unwrap();
        assert!(!gate.is_expired());

        host.gpu_incr(producer.syncpt_id().unwrap(), 2);
        assert!(done.fence.is_expired());
        assert!(gate.is_expired());
    }

    #[test]
    fn test_concurrent_semaphore_increments() {
        let sync: Arc<dyn ChannelSync> =
            Arc::from(create(&testing::channel_with_vm(0, 1024, None), &testing::sema_platform(4)).unwrap());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let sync = sync.clone();
                thread::spawn(move || sync.incr(false))
            })
            .collect();
        let held: Vec<IncrCmd> = workers.into_iter().map(|w| w.join().unwrap().unwrap()).collect();

        assert_eq!(sync.incr(false).err(), Some(Error::OutOfSemaphores));
        drop(held);
        assert!(sync.incr(false).is_ok());
    }

    #[test]
    fn test_concurrent_syncpt_thresholds_follow_buffer_order() {
        let host = Arc::new(Host1x::new(Host1xConfig::default()));
        let sync: Arc<dyn ChannelSync> =
            Arc::from(create(&testing::channel(0, 4096), &testing::syncpt_platform(host)).unwrap());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let sync = sync.clone();
                thread::spawn(move || (0..16).map(|_| sync.incr_wfi().unwrap()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<IncrCmd> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();

        // Entries are held, so the ring never wraps and offsets give GPU order.
        all.sort_unstable_by_key(|cmd| cmd.entry.off());
        let thresholds: Vec<u32> = all.iter().map(|cmd| cmd.fence.syncpt().unwrap().thresh).collect();
        let expected: Vec<u32> = (1..=64).map(|i| i * 2).collect();
        assert_eq!(thresholds, expected);
    }

    #[test]
    fn test_concurrent_semaphore_seqnos_follow_buffer_order() {
        let sync: Arc<dyn ChannelSync> =
            Arc::from(create(&testing::channel_with_vm(0, 4096, None), &testing::sema_platform(64)).unwrap());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let sync = sync.clone();
                thread::spawn(move || (0..8).map(|_| sync.incr(false).unwrap()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<IncrCmd> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();

        all.sort_unstable_by_key(|cmd| cmd.entry.off());
        let seqnos: Vec<u64> = all.iter().map(|cmd| cmd.fence.seqno().unwrap()).collect();
        assert_eq!(seqnos.len(), 32);
        assert!(seqnos.windows(2).all(|w| w[0] < w[1]));
    }
}
