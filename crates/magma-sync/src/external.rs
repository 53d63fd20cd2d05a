//! # External Completion Sources
//!
//! Fences produced outside a channel's own backend: another engine's
//! syncpoint, another process's sync fence, or a fence exported by a
//! different channel. Sources are looked up by descriptor through
//! [`SyncFdTable`].

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicI32, Ordering};

use hashbrown::HashMap;
use magma_core::{Error, Result, SyncpointId};
use spin::Mutex;

// =============================================================================
// TYPES
// =============================================================================

/// One (syncpoint, threshold) part of a multi-part fence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPoint {
    /// Syncpoint id
    pub id: SyncpointId,
    /// Threshold
    pub thresh: u32,
}

impl SyncPoint {
    /// Create a sync point
    pub const fn new(id: SyncpointId, thresh: u32) -> Self {
        Self { id, thresh }
    }
}

/// How a fence completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// Signaled normally
    Signaled,
    /// Torn down or errored before signaling
    Aborted,
}

/// Callback run once when a fence completes
pub type FenceCallback = Box<dyn FnOnce(FenceStatus) + Send + 'static>;

/// Outcome of [`ExternalFence::wait_async`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncWait {
    /// Already complete; the callback was dropped without running
    Signaled(FenceStatus),
    /// The callback will run exactly once when the fence completes
    Pending,
}

/// A completion source a channel can wait on
pub trait ExternalFence: Send + Sync {
    /// Fence name, for diagnostics
    fn name(&self) -> &str;

    /// Syncpoint parts of the fence
    ///
    /// `None` if any part is not backed by a syncpoint.
    fn syncpoints(&self) -> Option<Vec<SyncPoint>>;

    /// Check whether the fence has completed
    fn is_signaled(&self) -> bool;

    /// Run `callback` when the fence completes
    ///
    /// The completion check and the registration are one critical section:
    /// either `Signaled` is returned and `callback` is dropped, or `Pending`
    /// is returned and `callback` runs exactly once, possibly before this
    /// returns.
    fn wait_async(&self, callback: FenceCallback) -> Result<AsyncWait>;
}

// =============================================================================
// SYNC FENCE
// =============================================================================

struct SyncFenceState {
    status: Option<FenceStatus>,
    waiters: Vec<FenceCallback>,
}

/// Host-signaled fence
pub struct SyncFence {
    name: String,
    points: Option<Vec<SyncPoint>>,
    state: Mutex<SyncFenceState>,
}

impl SyncFence {
    /// Fence with no syncpoint backing
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            points: None,
            state: Mutex::new(SyncFenceState {
                status: None,
                waiters: Vec::new(),
            }),
        }
    }

    /// Fence made of syncpoint parts
    pub fn with_syncpoints(name: impl Into<String>, points: Vec<SyncPoint>) -> Self {
        Self {
            points: Some(points),
            ..Self::new(name)
        }
    }

    /// Complete the fence, running every waiter
    ///
    /// Returns the number of waiters run; 0 if already complete.
    pub fn signal(&self, status: FenceStatus) -> usize {
        let waiters = {
            let mut state = self.state.lock();
            if state.status.is_some() {
                return 0;
            }
            state.status = Some(status);
            core::mem::take(&mut state.waiters)
        };

        let count = waiters.len();
        for waiter in waiters {
            waiter(status);
        }
        count
    }

    /// Waiters registered and not yet run
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl ExternalFence for SyncFence {
    fn name(&self) -> &str {
        &self.name
    }

    fn syncpoints(&self) -> Option<Vec<SyncPoint>> {
        self.points.clone()
    }

    fn is_signaled(&self) -> bool {
        self.state.lock().status.is_some()
    }

    fn wait_async(&self, callback: FenceCallback) -> Result<AsyncWait> {
        let mut state = self.state.lock();
        if let Some(status) = state.status {
            return Ok(AsyncWait::Signaled(status));
        }
        state.waiters.push(callback);
        Ok(AsyncWait::Pending)
    }
}

impl fmt::Debug for SyncFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SyncFence")
            .field("name", &self.name)
            .field("points", &self.points)
            .field("status", &state.status)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

// =============================================================================
// DESCRIPTOR TABLE
// =============================================================================

/// Descriptor table for sync fences shared with user space
pub struct SyncFdTable {
    next_fd: AtomicI32,
    fences: Mutex<HashMap<i32, Arc<dyn ExternalFence>>>,
}

impl SyncFdTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            next_fd: AtomicI32::new(3),
            fences: Mutex::new(HashMap::new()),
        }
    }

    /// Install a fence, returning its descriptor
    pub fn install(&self, fence: Arc<dyn ExternalFence>) -> i32 {
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        log::trace!("sync fd {} -> '{}'", fd, fence.name());
        self.fences.lock().insert(fd, fence);
        fd
    }

    /// Look up a descriptor
    pub fn get(&self, fd: i32) -> Result<Arc<dyn ExternalFence>> {
        self.fences
            .lock()
            .get(&fd)
            .cloned()
            .ok_or(Error::InvalidParameter)
    }

    /// Close a descriptor
    pub fn close(&self, fd: i32) -> Result<()> {
        self.fences
            .lock()
            .remove(&fd)
            .map(|_| ())
            .ok_or(Error::InvalidParameter)
    }

    /// Open descriptors
    pub fn len(&self) -> usize {
        self.fences.lock().len()
    }

    /// Check if no descriptor is open
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SyncFdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SyncFdTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncFdTable").field("open", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    #[test]
    fn test_wait_async_pending_then_signal() {
        let fence = SyncFence::new("pre");
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        let r = fence
            .wait_async(Box::new(move |s| {
                assert_eq!(s, FenceStatus::Signaled);
                hits2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(r, AsyncWait::Pending);
        assert_eq!(fence.waiter_count(), 1);
        assert_eq!(fence.signal(FenceStatus::Signaled), 1);
        assert_eq!(fence.waiter_count(), 0);
        assert_eq!(fence.signal(FenceStatus::Signaled), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_async_already_signaled_drops_callback() {
        let fence = SyncFence::new("done");
        fence.signal(FenceStatus::Aborted);
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        let r = fence
            .wait_async(Box::new(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(r, AsyncWait::Signaled(FenceStatus::Aborted));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(Arc::strong_count(&hits), 1);
    }

    #[test]
    fn test_fd_table() {
        let table = SyncFdTable::new();
        let fd = table.install(Arc::new(SyncFence::new("a")));
        assert_eq!(table.get(fd).unwrap().name(), "a");
        assert_eq!(table.get(fd + 1).err(), Some(Error::InvalidParameter));
        table.close(fd).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_syncpoint_parts() {
        let pts = alloc::vec![SyncPoint::new(SyncpointId::new(3), 10)];
        let fence = SyncFence::with_syncpoints("sp", pts.clone());
        assert_eq!(fence.syncpoints(), Some(pts));
        assert_eq!(SyncFence::new("sw").syncpoints(), None);
    }
}
