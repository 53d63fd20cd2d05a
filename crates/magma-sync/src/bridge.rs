//! # Async Wait Bridge
//!
//! Releases a semaphore slot when an external fence completes, so that a
//! semaphore acquire already queued on the GPU can proceed.
//!
//! ```text
//! Registered ──┬──▶ ImmediateRelease ──┐
//!              │                       ├──▶ Released
//!              └──▶ Pending ──▶ Fired ─┘
//! ```
//!
//! Both paths end in [`WaitFenceWork::release`], which takes the slot out of
//! the work item under its lock; only one caller can ever find it there.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::fmt;

use magma_core::Result;
use spin::Mutex;

use crate::external::{AsyncWait, ExternalFence, FenceStatus};
use crate::semaphore::Semaphore;

/// Bridge state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Created, not yet attached to the source
    Registered,
    /// The source was already complete at registration
    ImmediateRelease,
    /// Waiting for the source
    Pending,
    /// The source completed
    Fired,
    /// The slot has been released
    Released,
}

struct WorkInner {
    state: BridgeState,
    sema: Option<Arc<Semaphore>>,
}

/// A wait registered against an external fence
pub struct WaitFenceWork {
    source: String,
    inner: Mutex<WorkInner>,
}

impl WaitFenceWork {
    /// Bind `sema` to `source`
    ///
    /// The work item holds its own reference to `sema` until it releases it.
    pub fn register(source: &dyn ExternalFence, sema: Arc<Semaphore>) -> Result<Arc<Self>> {
        let work = Arc::new(Self {
            source: source.name().to_string(),
            inner: Mutex::new(WorkInner {
                state: BridgeState::Registered,
                sema: Some(sema),
            }),
        });

        let fired = work.clone();
        let outcome = source.wait_async(Box::new(move |status| {
            fired.transition(BridgeState::Fired);
            fired.release(status);
        }))?;

        match outcome {
            AsyncWait::Signaled(status) => {
                work.transition(BridgeState::ImmediateRelease);
                work.release(status);
            },
            AsyncWait::Pending => {
                let mut inner = work.inner.lock();
                if inner.state == BridgeState::Registered {
                    inner.state = BridgeState::Pending;
                }
            },
        }

        log::trace!("wait on '{}': {:?}", work.source, work.state());
        Ok(work)
    }

    /// Current state
    pub fn state(&self) -> BridgeState {
        self.inner.lock().state
    }

    /// Source fence name
    pub fn source(&self) -> &str {
        &self.source
    }

    fn transition(&self, state: BridgeState) {
        let mut inner = self.inner.lock();
        if inner.state != BridgeState::Released {
            inner.state = state;
        }
    }

    fn release(&self, status: FenceStatus) {
        let sema = {
            let mut inner = self.inner.lock();
            let sema = inner.sema.take();
            if sema.is_some() {
                inner.state = BridgeState::Released;
            }
            sema
        };

        let Some(sema) = sema else {
            log::error!("wait on '{}': released twice", self.source);
            debug_assert!(false, "wait fence work released twice");
            return;
        };

        if status == FenceStatus::Aborted {
            log::error!("error waiting pre-fence '{}'", self.source);
        }
        log::debug!("wait on '{}' completed, triggering gpu work", self.source);
        sema.release();
    }
}

impl fmt::Debug for WaitFenceWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitFenceWork")
            .field("source", &self.source)
            .field("state", &self.state())
            .finish()
    }
}
