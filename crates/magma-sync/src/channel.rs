//! # GPU Channel
//!
//! The slice of a GPU channel (FIFO context) the sync backends need: its
//! hardware id, VM, private command buffer, and the progress hook run when
//! submitted work completes.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use magma_cmd::{PrivCmdBuffer, PrivCmdConfig, PrivCmdEntry, PrivCmdStats};
use magma_core::{ChannelId, GpuVm, Result};
use spin::Mutex;

/// Hook run with the number of completed jobs
pub type ProgressHook = Box<dyn Fn(u32) + Send + Sync>;

/// A GPU channel
pub struct Channel {
    /// Hardware channel id
    hw_chid: ChannelId,
    /// Channel VM
    vm: Option<Arc<dyn GpuVm>>,
    /// Private command buffer
    priv_cmdbuf: Mutex<PrivCmdBuffer>,
    /// Completion hook
    progress: Option<ProgressHook>,
    /// Jobs reported complete
    completed: AtomicU64,
    /// Set once teardown has started
    dying: AtomicBool,
}

impl Channel {
    /// Create a new channel
    pub fn new(hw_chid: ChannelId, vm: Option<Arc<dyn GpuVm>>, cmdbuf: PrivCmdConfig) -> Self {
        Self {
            hw_chid,
            vm,
            priv_cmdbuf: Mutex::new(PrivCmdBuffer::new(cmdbuf)),
            progress: None,
            completed: AtomicU64::new(0),
            dying: AtomicBool::new(false),
        }
    }

    /// Install the completion hook
    pub fn with_progress_hook(mut self, hook: ProgressHook) -> Self {
        self.progress = Some(hook);
        self
    }

    /// Get hardware channel id
    pub fn hw_chid(&self) -> ChannelId {
        self.hw_chid
    }

    /// Get channel VM
    pub fn vm(&self) -> Option<&Arc<dyn GpuVm>> {
        self.vm.as_ref()
    }

    /// Take a reference for deferred work
    ///
    /// Returns `None` once teardown has started.
    pub fn get(self: &Arc<Self>) -> Option<Arc<Self>> {
        if self.dying.load(Ordering::Acquire) {
            return None;
        }
        Some(self.clone())
    }

    /// Start teardown
    pub fn mark_dying(&self) {
        self.dying.store(true, Ordering::Release);
    }

    /// Check if teardown has started
    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    /// Allocate a region of the private command buffer
    pub fn alloc_priv_cmdbuf(&self, words: u32) -> Result<PrivCmdEntry> {
        self.with_priv_cmdbuf(words, |_| Ok(())).map(|(entry, ())| entry)
    }

    /// Allocate a region and fill it before any other region can be allocated
    ///
    /// Whatever `fill` reserves is ordered exactly like the regions the GPU
    /// consumes. On error the region is handed back.
    pub fn with_priv_cmdbuf<T>(
        &self,
        words: u32,
        fill: impl FnOnce(&mut PrivCmdEntry) -> Result<T>,
    ) -> Result<(PrivCmdEntry, T)> {
        let mut cmdbuf = self.priv_cmdbuf.lock();
        let mut entry = cmdbuf.alloc(words).inspect_err(|_| {
            log::error!("ch {}: not enough priv cmd buffer space", self.hw_chid);
        })?;

        match fill(&mut entry) {
            Ok(value) => Ok((entry, value)),
            Err(e) => {
                cmdbuf.free(entry)?;
                Err(e)
            },
        }
    }

    /// Return a region once the GPU has consumed it
    pub fn free_priv_cmdbuf(&self, entry: PrivCmdEntry) -> Result<()> {
        self.priv_cmdbuf.lock().free(entry)
    }

    /// Private command buffer statistics
    pub fn priv_cmdbuf_stats(&self) -> PrivCmdStats {
        self.priv_cmdbuf.lock().stats()
    }

    /// Report completed jobs
    pub fn update(&self, nr_completed: u32) {
        self.completed.fetch_add(u64::from(nr_completed), Ordering::AcqRel);
        log::trace!("ch {}: {} jobs completed", self.hw_chid, nr_completed);
        if let Some(hook) = &self.progress {
            hook(nr_completed);
        }
    }

    /// Total jobs reported complete
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("hw_chid", &self.hw_chid)
            .field("vm", &self.vm.as_ref().map(|vm| vm.asid()))
            .field("completed", &self.completed())
            .field("dying", &self.is_dying())
            .finish()
    }
}
