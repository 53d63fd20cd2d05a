//! # Semaphore Backend
//!
//! Channel sync on semaphore slots in the channel's own pool. Increments
//! release a fresh slot; waits on external fences acquire a fresh slot that
//! a [`WaitFenceWork`] releases once the fence completes.

use alloc::format;
use alloc::sync::Arc;
use core::fmt;

use magma_cmd::encoder::{self, SemaOp};
use magma_cmd::PrivCmdEntry;
use magma_core::{Error, MapFlags, Result, SyncpointId};

use crate::bridge::WaitFenceWork;
use crate::channel::Channel;
use crate::config::{Capabilities, SyncPlatform};
use crate::external::{ExternalFence, SyncFdTable};
use crate::fence::Fence;
use crate::semaphore::{Semaphore, SemaphorePool};
use crate::timeline::SyncTimeline;
use crate::{ChannelSync, IncrCmd, SyncKind, WaitCmd};

/// Semaphore-backed channel sync
pub struct ChannelSemaphore {
    channel: Arc<Channel>,
    pool: Arc<SemaphorePool>,
    timeline: Option<Arc<SyncTimeline>>,
    fds: Arc<SyncFdTable>,
    caps: Capabilities,
    nonstall_irq: bool,
}

impl ChannelSemaphore {
    /// Create the pool and timeline for `channel`
    pub fn new(channel: Arc<Channel>, platform: &SyncPlatform) -> Result<Self> {
        let Some(vm) = channel.vm().cloned() else {
            log::error!("ch {}: semaphore sync needs a channel vm", channel.hw_chid());
            return Err(Error::InvalidState);
        };
        let config = &platform.config;
        let chid = channel.hw_chid();

        let pool = SemaphorePool::new(format!("semaphore_pool-{}", chid), config.semaphore_pool_slots);
        // Read-write for the owner; other channels map it read-only.
        pool.map(vm.clone(), MapFlags::empty())?;

        let timeline = if config.capabilities.contains(Capabilities::SYNC_FENCE) {
            let asid = vm.asid().map_or(-1, |id| id as i64);
            Some(SyncTimeline::new(format!("{}_ch{}_as{}", config.device_name, chid, asid)))
        } else {
            None
        };

        log::debug!("ch {}: semaphore sync on '{}'", chid, pool.name());
        Ok(Self {
            channel,
            pool,
            timeline,
            fds: platform.fds.clone(),
            caps: config.capabilities,
            nonstall_irq: config.nonstall_irq,
        })
    }

    /// Semaphore pool
    pub fn pool(&self) -> &Arc<SemaphorePool> {
        &self.pool
    }

    /// Host timeline, if sync fences are enabled
    pub fn timeline(&self) -> Option<&Arc<SyncTimeline>> {
        self.timeline.as_ref()
    }

    fn require_sync_fence(&self) -> Result<()> {
        if self.caps.contains(Capabilities::SYNC_FENCE) {
            return Ok(());
        }
        log::error!(
            "ch {}: trying to use sync fds with sync fence support disabled",
            self.channel.hw_chid()
        );
        Err(Error::NotSupported)
    }

    /// Allocate and fill a region with one semaphore operation
    ///
    /// `then` runs while the region is still being reserved, so whatever it
    /// records is ordered the same way as the regions.
    fn emit<T>(&self, sema: &Semaphore, op: SemaOp, then: impl FnOnce() -> T) -> Result<(PrivCmdEntry, T)> {
        let va = sema.gpu_va().ok_or(Error::NotMapped)?;
        self.channel.with_priv_cmdbuf(op.words(), |entry| {
            let written = encoder::add_sema_cmd(entry, va, 1, op)?;
            if written != entry.size() {
                log::error!("sema cmd: wrote {} of {} words", written, entry.size());
            }
            Ok(then())
        })
    }

    fn add_point(&self, sema: &Arc<Semaphore>) -> Option<(Arc<SyncTimeline>, u64)> {
        self.timeline
            .as_ref()
            .map(|timeline| (timeline.clone(), timeline.add_point(sema)))
    }

    fn incr_inner(&self, wfi: bool, dependency: Option<Arc<dyn ExternalFence>>) -> Result<IncrCmd> {
        let sema = self.pool.alloc()?;
        let op = SemaOp::Release {
            wfi,
            nonstall_irq: self.nonstall_irq,
        };
        let (entry, point) = self.emit(&sema, op, || self.add_point(&sema))?;

        Ok(IncrCmd {
            entry,
            fence: Arc::new(Fence::Semaphore {
                sema,
                point,
                dependency,
                wfi,
            }),
        })
    }
}

impl ChannelSync for ChannelSemaphore {
    fn kind(&self) -> SyncKind {
        SyncKind::Semaphore
    }

    fn wait_syncpt(&self, _id: SyncpointId, _thresh: u32) -> Result<WaitCmd> {
        log::error!("ch {}: trying to use syncpoint synchronization", self.channel.hw_chid());
        Err(Error::NotSupported)
    }

    fn wait_fence(&self, source: &dyn ExternalFence) -> Result<WaitCmd> {
        self.require_sync_fence()?;

        let sema = self.pool.alloc()?;
        // The GPU is unblocked once the slot holds 1.
        let (entry, point) = self.emit(&sema, SemaOp::Acquire, || self.add_point(&sema))?;

        if let Err(e) = WaitFenceWork::register(source, sema.clone()) {
            log::error!("ch {}: wait on '{}' failed: {}", self.channel.hw_chid(), source.name(), e);
            self.channel.free_priv_cmdbuf(entry)?;
            return Err(e);
        }

        // Keeps the slot alive while the acquire is in flight.
        Ok(WaitCmd {
            entry: Some(entry),
            fence: Some(Arc::new(Fence::Semaphore {
                sema,
                point,
                dependency: None,
                wfi: false,
            })),
        })
    }

    fn wait_fd(&self, fd: i32) -> Result<WaitCmd> {
        self.require_sync_fence()?;
        let source = self.fds.get(fd)?;
        self.wait_fence(&*source)
    }

    fn incr(&self, _need_sync_fence: bool) -> Result<IncrCmd> {
        self.incr_inner(false, None)
    }

    fn incr_wfi(&self) -> Result<IncrCmd> {
        self.incr_inner(true, None)
    }

    fn incr_user(&self, wait_fence_fd: Option<i32>, wfi: bool, _need_sync_fence: bool) -> Result<IncrCmd> {
        self.require_sync_fence()?;
        let dependency = wait_fence_fd.map(|fd| self.fds.get(fd)).transpose()?;
        self.incr_inner(wfi, dependency)
    }

    fn set_min_eq_max(&self) {}

    fn signal_timeline(&self) {
        if let Some(timeline) = &self.timeline {
            timeline.signal();
        }
    }

    fn syncpt_id(&self) -> Option<SyncpointId> {
        None
    }
}

impl Drop for ChannelSemaphore {
    fn drop(&mut self) {
        if let Some(timeline) = &self.timeline {
            timeline.destroy();
        }
        if let Err(e) = self.pool.unmap() {
            log::error!("ch {}: unmap of '{}': {}", self.channel.hw_chid(), self.pool.name(), e);
        }
        log::debug!("ch {}: semaphore sync destroyed", self.channel.hw_chid());
    }
}

impl fmt::Debug for ChannelSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSemaphore")
            .field("channel", &self.channel.hw_chid())
            .field("pool", &self.pool)
            .field("timeline", &self.timeline)
            .finish()
    }
}
