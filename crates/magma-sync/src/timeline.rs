//! # Host Sync Timeline
//!
//! A per-channel monotonic sequence that lets host observers wait on
//! semaphore-backed work. Each fence adds a point bound to its semaphore;
//! [`SyncTimeline::signal`] advances the timeline over every leading point
//! whose semaphore has been released.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;

use magma_core::{Error, Result};
use spin::Mutex;

use crate::external::{AsyncWait, FenceCallback, FenceStatus};
use crate::semaphore::Semaphore;

struct TimelinePoint {
    seqno: u64,
    sema: Weak<Semaphore>,
}

impl TimelinePoint {
    /// A point whose semaphore is gone can no longer be observed
    fn is_done(&self) -> bool {
        self.sema.upgrade().is_none_or(|sema| sema.is_released())
    }
}

struct TimelineInner {
    next_seqno: u64,
    signaled: u64,
    points: VecDeque<TimelinePoint>,
    waiters: Vec<(u64, FenceCallback)>,
    destroyed: bool,
}

/// Host-observable completion timeline
pub struct SyncTimeline {
    name: String,
    inner: Mutex<TimelineInner>,
}

impl SyncTimeline {
    /// Create a timeline
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        log::debug!("timeline '{}': created", name);
        Arc::new(Self {
            name,
            inner: Mutex::new(TimelineInner {
                next_seqno: 1,
                signaled: 0,
                points: VecDeque::new(),
                waiters: Vec::new(),
                destroyed: false,
            }),
        })
    }

    /// Timeline name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a point that completes when `sema` is released
    pub fn add_point(&self, sema: &Arc<Semaphore>) -> u64 {
        let mut inner = self.inner.lock();
        let seqno = inner.next_seqno;
        inner.next_seqno += 1;
        inner.points.push_back(TimelinePoint {
            seqno,
            sema: Arc::downgrade(sema),
        });
        seqno
    }

    /// Last signaled sequence number
    pub fn signaled_seqno(&self) -> u64 {
        self.inner.lock().signaled
    }

    /// Check if a point has been signaled
    pub fn is_signaled(&self, seqno: u64) -> bool {
        seqno <= self.signaled_seqno()
    }

    /// Points not yet signaled
    pub fn pending_points(&self) -> usize {
        self.inner.lock().points.len()
    }

    /// Advance over released points and wake their waiters
    ///
    /// Returns the number of points signaled. Calling again without an
    /// intervening release changes nothing.
    pub fn signal(&self) -> usize {
        let (advanced, ready) = {
            let mut inner = self.inner.lock();
            let mut advanced = 0;
            while inner.points.front().is_some_and(TimelinePoint::is_done) {
                if let Some(point) = inner.points.pop_front() {
                    inner.signaled = point.seqno;
                    advanced += 1;
                }
            }
            if advanced == 0 {
                return 0;
            }

            let signaled = inner.signaled;
            let (ready, pending): (Vec<_>, Vec<_>) = core::mem::take(&mut inner.waiters)
                .into_iter()
                .partition(|(seqno, _)| *seqno <= signaled);
            inner.waiters = pending;
            (advanced, ready)
        };

        log::trace!("timeline '{}': signaled {} points", self.name, advanced);
        for (_, waiter) in ready {
            waiter(FenceStatus::Signaled);
        }
        advanced
    }

    /// Run `callback` once `seqno` is signaled
    pub fn wait(&self, seqno: u64, callback: FenceCallback) -> Result<AsyncWait> {
        let mut inner = self.inner.lock();
        if seqno == 0 || seqno >= inner.next_seqno {
            return Err(Error::InvalidParameter);
        }
        if seqno <= inner.signaled {
            return Ok(AsyncWait::Signaled(FenceStatus::Signaled));
        }
        if inner.destroyed {
            return Ok(AsyncWait::Signaled(FenceStatus::Aborted));
        }
        inner.waiters.push((seqno, callback));
        Ok(AsyncWait::Pending)
    }

    /// Tear down, aborting every remaining waiter
    pub fn destroy(&self) {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.destroyed = true;
            inner.points.clear();
            core::mem::take(&mut inner.waiters)
        };

        log::debug!("timeline '{}': destroyed, {} waiters aborted", self.name, waiters.len());
        for (_, waiter) in waiters {
            waiter(FenceStatus::Aborted);
        }
    }
}

impl fmt::Debug for SyncTimeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SyncTimeline")
            .field("name", &self.name)
            .field("signaled", &inner.signaled)
            .field("pending", &inner.points.len())
            .field("destroyed", &inner.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semaphore::SemaphorePool;
    use alloc::boxed::Box;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_signal_is_monotonic_and_idempotent() {
        let pool = SemaphorePool::new("p", 4);
        let tl = SyncTimeline::new("gk20a_ch0_as-1");
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let pa = tl.add_point(&a);
        let pb = tl.add_point(&b);

        // b released first does not skip a.
        b.release();
        assert_eq!(tl.signal(), 0);
        assert!(!tl.is_signaled(pb));

        a.release();
        assert_eq!(tl.signal(), 2);
        assert!(tl.is_signaled(pa) && tl.is_signaled(pb));
        assert_eq!(tl.signal(), 0);
        assert_eq!(tl.signaled_seqno(), pb);
    }

    #[test]
    fn test_wait_fires_on_signal() {
        let pool = SemaphorePool::new("p", 1);
        let tl = SyncTimeline::new("t");
        let s = pool.alloc().unwrap();
        let seqno = tl.add_point(&s);

        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        let r = tl
            .wait(seqno, Box::new(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(r, AsyncWait::Pending);

        s.release();
        tl.signal();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            tl.wait(seqno, Box::new(|_| {})).unwrap(),
            AsyncWait::Signaled(FenceStatus::Signaled)
        );
    }

    #[test]
    fn test_dropped_semaphore_counts_as_done() {
        let pool = SemaphorePool::new("p", 1);
        let tl = SyncTimeline::new("t");
        let s = pool.alloc().unwrap();
        tl.add_point(&s);
        drop(s);
        assert_eq!(tl.signal(), 1);
    }

    #[test]
    fn test_destroy_aborts_waiters() {
        let pool = SemaphorePool::new("p", 1);
        let tl = SyncTimeline::new("t");
        let s = pool.alloc().unwrap();
        let seqno = tl.add_point(&s);

        let aborted = Arc::new(AtomicU32::new(0));
        let aborted2 = aborted.clone();
        tl.wait(seqno, Box::new(move |status| {
            if status == FenceStatus::Aborted {
                aborted2.fetch_add(1, Ordering::SeqCst);
            }
        }))
        .unwrap();

        tl.destroy();
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
        assert_eq!(tl.pending_points(), 0);
    }

    #[test]
    fn test_wait_unknown_seqno() {
        let tl = SyncTimeline::new("t");
        assert_eq!(tl.wait(1, Box::new(|_| {})).err(), Some(Error::InvalidParameter));
    }
}
