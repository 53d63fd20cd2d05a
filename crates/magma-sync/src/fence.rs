//! # Fences
//!
//! Completion tokens returned by channel sync backends. A fence never
//! changes after creation; polling it reads hardware or slot state only.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use magma_core::{Error, Result, SyncpointHost, SyncpointId};

use crate::external::{
    AsyncWait, ExternalFence, FenceCallback, FenceStatus, SyncFdTable, SyncPoint,
};
use crate::semaphore::Semaphore;
use crate::timeline::SyncTimeline;

/// A fence produced by a channel sync backend
pub enum Fence {
    /// Satisfied when the syncpoint reaches `thresh`
    Syncpt {
        /// Host owning the syncpoint
        host: Arc<dyn SyncpointHost>,
        /// Syncpoint id
        id: SyncpointId,
        /// Threshold
        thresh: u32,
        /// Work drained before the increment
        wfi: bool,
        /// Exportable as a sync fence
        sync_fence: bool,
    },
    /// Satisfied when the slot is released
    Semaphore {
        /// Slot written on completion
        sema: Arc<Semaphore>,
        /// Host timeline point tracking the slot
        point: Option<(Arc<SyncTimeline>, u64)>,
        /// Fence this work was ordered after
        dependency: Option<Arc<dyn ExternalFence>>,
        /// Work drained before the release
        wfi: bool,
    },
}

impl Fence {
    /// Check if the work has completed
    pub fn is_expired(&self) -> bool {
        match self {
            Fence::Syncpt { host, id, thresh, .. } => host.is_expired(*id, *thresh),
            Fence::Semaphore { sema, .. } => sema.is_released(),
        }
    }

    /// Whether the producing work waited for idle
    pub fn wfi(&self) -> bool {
        match self {
            Fence::Syncpt { wfi, .. } | Fence::Semaphore { wfi, .. } => *wfi,
        }
    }

    /// (id, threshold) for syncpoint fences
    pub fn syncpt(&self) -> Option<SyncPoint> {
        match self {
            Fence::Syncpt { id, thresh, .. } => Some(SyncPoint::new(*id, *thresh)),
            Fence::Semaphore { .. } => None,
        }
    }

    /// Slot for semaphore fences
    pub fn semaphore(&self) -> Option<&Arc<Semaphore>> {
        match self {
            Fence::Semaphore { sema, .. } => Some(sema),
            Fence::Syncpt { .. } => None,
        }
    }

    /// Timeline sequence number for semaphore fences
    pub fn seqno(&self) -> Option<u64> {
        match self {
            Fence::Semaphore { point, .. } => point.as_ref().map(|(_, seqno)| *seqno),
            Fence::Syncpt { .. } => None,
        }
    }

    /// Fence this work was ordered after
    pub fn dependency(&self) -> Option<&Arc<dyn ExternalFence>> {
        match self {
            Fence::Semaphore { dependency, .. } => dependency.as_ref(),
            Fence::Syncpt { .. } => None,
        }
    }

    /// Check if the fence can be shared as a sync fence
    pub fn has_sync_fence(&self) -> bool {
        match self {
            Fence::Syncpt { sync_fence, .. } => *sync_fence,
            Fence::Semaphore { point, .. } => point.is_some(),
        }
    }

    /// Export the fence through a descriptor table
    pub fn install_fd(self: &Arc<Self>, fds: &SyncFdTable) -> Result<i32> {
        if !self.has_sync_fence() {
            return Err(Error::NotSupported);
        }
        Ok(fds.install(self.clone()))
    }
}

impl ExternalFence for Fence {
    fn name(&self) -> &str {
        match self {
            Fence::Syncpt { .. } => "fence-syncpt",
            Fence::Semaphore { .. } => "fence-sema",
        }
    }

    fn syncpoints(&self) -> Option<Vec<SyncPoint>> {
        self.syncpt().map(|pt| vec![pt])
    }

    fn is_signaled(&self) -> bool {
        self.is_expired()
    }

    fn wait_async(&self, callback: FenceCallback) -> Result<AsyncWait> {
        match self {
            Fence::Syncpt { host, id, thresh, .. } => {
                if host.is_expired(*id, *thresh) {
                    return Ok(AsyncWait::Signaled(FenceStatus::Signaled));
                }
                // Runs inline if the threshold is crossed before registration.
                host.register_notifier(*id, *thresh, Box::new(move |_| {
                    callback(FenceStatus::Signaled)
                }))?;
                Ok(AsyncWait::Pending)
            },
            Fence::Semaphore { point: Some((timeline, seqno)), .. } => {
                timeline.wait(*seqno, callback)
            },
            Fence::Semaphore { point: None, .. } => Err(Error::NotSupported),
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fence::Syncpt { id, thresh, wfi, .. } => f
                .debug_struct("Fence::Syncpt")
                .field("id", id)
                .field("thresh", thresh)
                .field("wfi", wfi)
                .finish(),
            Fence::Semaphore { sema, point, dependency, wfi } => f
                .debug_struct("Fence::Semaphore")
                .field("sema", sema)
                .field("seqno", &point.as_ref().map(|(_, s)| *s))
                .field("dependency", &dependency.as_ref().map(|d| d.name()))
                .field("wfi", wfi)
                .finish(),
        }
    }
}

static_assertions::assert_impl_all!(Fence: Send, Sync);
