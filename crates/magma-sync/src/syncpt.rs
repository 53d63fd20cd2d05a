//! # Syncpoint Backend
//!
//! Channel sync on a host-managed syncpoint. Every increment block bumps the
//! counter twice (hardware erratum), so each fence threshold is the previous
//! one plus two.

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;

use magma_cmd::encoder;
use magma_core::{Error, Result, SyncpointHost, SyncpointId};

use crate::channel::Channel;
use crate::config::{Capabilities, SyncPlatform};
use crate::external::{ExternalFence, SyncFdTable};
use crate::fence::Fence;
use crate::{ChannelSync, IncrCmd, SyncKind, WaitCmd};

/// Syncpoint-backed channel sync
pub struct ChannelSyncpt {
    channel: Arc<Channel>,
    host: Arc<dyn SyncpointHost>,
    id: SyncpointId,
    fds: Arc<SyncFdTable>,
    caps: Capabilities,
}

impl ChannelSyncpt {
    /// Allocate a syncpoint for `channel`
    pub fn new(channel: Arc<Channel>, platform: &SyncPlatform) -> Result<Self> {
        let host = platform.host.clone().ok_or(Error::NotSupported)?;
        let name = format!("{}_{}", platform.config.device_name, channel.hw_chid());

        let id = host.alloc_host_managed(channel.hw_chid(), &name).inspect_err(|_| {
            log::error!("ch {}: failed to get free syncpt", channel.hw_chid());
        })?;
        host.set_min_eq_max(id);

        log::debug!("ch {}: syncpt sync on {} ('{}')", channel.hw_chid(), id, name);
        Ok(Self {
            channel,
            host,
            id,
            fds: platform.fds.clone(),
            caps: platform.config.capabilities,
        })
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

    fn incr_inner(&self, wfi: bool, register_irq: bool, need_sync_fence: bool) -> Result<IncrCmd> {
        // The threshold is reserved under the buffer lock so that thresholds
        // increase in the order the GPU consumes the regions.
        let (entry, thresh) = self.channel.with_priv_cmdbuf(encoder::syncpt_incr_len(wfi), |entry| {
            let written = encoder::add_syncpt_incr(entry, self.id, wfi)?;
            if written != entry.size() {
                log::error!("syncpt incr: wrote {} of {} words", written, entry.size());
            }
            Ok(self.host.incr_max(self.id, 2))
        })?;

        if register_irq {
            self.register_completion(thresh);
        }

        Ok(IncrCmd {
            entry,
            fence: Arc::new(Fence::Syncpt {
                host: self.host.clone(),
                id: self.id,
                thresh,
                wfi,
                sync_fence: need_sync_fence && self.caps.contains(Capabilities::SYNC_FENCE),
            }),
        })
    }

    /// Run the channel's progress hook once `thresh` is reached
    ///
    /// The notifier owns a channel reference until it runs. A failure here
    /// leaves `thresh` allocated with nothing watching it.
    fn register_completion(&self, thresh: u32) {
        let Some(channel) = self.channel.get() else {
            log::error!("ch {}: no channel ref for completion notifier", self.channel.hw_chid());
            return;
        };

        let notify = Box::new(move |nr_completed: u32| channel.update(nr_completed));
        if let Err(e) = self.host.register_notifier(self.id, thresh, notify) {
            log::error!(
                "ch {}: failed to set submit complete interrupt at {}: {}",
                self.channel.hw_chid(),
                thresh,
                e
            );
        }
    }
}

impl ChannelSync for ChannelSyncpt {
    fn kind(&self) -> SyncKind {
        SyncKind::Syncpoint
    }

    fn wait_syncpt(&self, id: SyncpointId, thresh: u32) -> Result<WaitCmd> {
        if !self.host.is_valid(id) {
            log::warn!("ch {}: invalid wait id in gpfifo submit, elided", self.channel.hw_chid());
            return Ok(WaitCmd::empty());
        }

        if self.host.is_expired(id, thresh) {
            return Ok(WaitCmd::empty());
        }

        let mut entry = self.channel.alloc_priv_cmdbuf(encoder::WAIT_CMD_WORDS)?;
        if let Err(e) = encoder::add_wait_cmd(&mut entry, 0, id, thresh) {
            self.channel.free_priv_cmdbuf(entry)?;
            return Err(e);
        }

        Ok(WaitCmd {
            entry: Some(entry),
            fence: None,
        })
    }

    fn wait_fence(&self, source: &dyn ExternalFence) -> Result<WaitCmd> {
        self.require_sync_fence()?;

        let points = source.syncpoints().ok_or(Error::InvalidParameter)?;
        if points.iter().any(|pt| pt.id.is_invalid() || !self.host.is_valid(pt.id)) {
            return Err(Error::InvalidParameter);
        }
        if points.is_empty() {
            return Ok(WaitCmd::empty());
        }

        let mut entry = self
            .channel
            .alloc_priv_cmdbuf(encoder::WAIT_CMD_WORDS * points.len() as u32)?;

        let encoded = points.iter().enumerate().try_for_each(|(i, pt)| {
            let at = i as u32 * encoder::WAIT_CMD_WORDS;
            if self.host.is_expired(pt.id, pt.thresh) {
                encoder::add_noop_wait(&mut entry, at)
            } else {
                encoder::add_wait_cmd(&mut entry, at, pt.id, pt.thresh)
            }
        });
        if let Err(e) = encoded {
            self.channel.free_priv_cmdbuf(entry)?;
            return Err(e);
        }

        Ok(WaitCmd {
            entry: Some(entry),
            fence: None,
        })
    }

    fn wait_fd(&self, fd: i32) -> Result<WaitCmd> {
        self.require_sync_fence()?;
        let source = self.fds.get(fd)?;
        self.wait_fence(&*source)
    }

    fn incr(&self, need_sync_fence: bool) -> Result<IncrCmd> {
        self.incr_inner(false, true, need_sync_fence)
    }

    fn incr_wfi(&self) -> Result<IncrCmd> {
        self.incr_inner(true, false, true)
    }

    fn incr_user(&self, _wait_fence_fd: Option<i32>, wfi: bool, need_sync_fence: bool) -> Result<IncrCmd> {
        // The fence goes back to user space, so completion must be observable.
        self.incr_inner(wfi, true, need_sync_fence)
    }

    fn set_min_eq_max(&self) {
        self.host.set_min_eq_max(self.id);
    }

    fn signal_timeline(&self) {}

    fn syncpt_id(&self) -> Option<SyncpointId> {
        Some(self.id)
    }
}

impl core::fmt::Debug for ChannelSyncpt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelSyncpt")
            .field("channel", &self.channel.hw_chid())
            .field("id", &self.id)
            .field("max", &self.host.read_max(self.id))
            .finish()
    }
}

impl Drop for ChannelSyncpt {
    fn drop(&mut self) {
        self.host.set_min_eq_max(self.id);
        self.host.put_ref(self.id);
        log::debug!("ch {}: syncpt {} returned", self.channel.hw_chid(), self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{SyncFence, SyncPoint};
    use crate::host1x::{Host1x, Host1xConfig};
    use crate::testing;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, Ordering};

    fn setup() -> (Arc<Host1x>, Arc<Channel>, ChannelSyncpt) {
        let host = Arc::new(Host1x::new(Host1xConfig::default()));
        let platform = testing::syncpt_platform(host.clone());
        let channel = testing::channel(3, 64);
        let sync = ChannelSyncpt::new(channel.clone(), &platform).unwrap();
        (host, channel, sync)
    }

    #[test]
    fn test_create_names_and_owns_syncpt() {
        let (host, _ch, sync) = setup();
        let id = sync.syncpt_id().unwrap();
        assert_eq!(host.name(id).as_deref(), Some("gk20a_3"));
        assert_eq!(host.owner(id), Some(magma_core::ChannelId::new(3)));
        drop(sync);
        assert_eq!(host.owner(id), None);
    }

    #[test]
    fn test_incr_thresholds_step_by_two() {
        let (host, _ch, sync) = setup();
        let id = sync.syncpt_id().unwrap();
        let base = host.read_max(id);

        let mut last = base;
        for _ in 0..5 {
            let cmd = sync.incr(false).unwrap();
            let pt = cmd.fence.syncpt().unwrap();
            assert_eq!(pt.thresh, last.wrapping_add(2));
            last = pt.thresh;
        }
    }

    #[test]
    fn test_incr_from_100_registers_notifiers() {
        let (host, ch, sync) = setup();
        let id = sync.syncpt_id().unwrap();
        host.incr_max(id, 100);
        host.set_min_eq_max(id);

        let a = sync.incr(false).unwrap();
        let b = sync.incr(false).unwrap();
        assert_eq!(a.fence.syncpt(), Some(SyncPoint::new(id, 102)));
        assert_eq!(b.fence.syncpt(), Some(SyncPoint::new(id, 104)));
        assert_eq!((a.entry.size(), b.entry.size()), (6, 6));
        assert_eq!(host.pending_notifiers(), 2);

        host.gpu_incr(id, 2);
        assert_eq!(ch.completed(), 1);
        assert!(a.fence.is_expired() && !b.fence.is_expired());
        host.gpu_incr(id, 2);
        assert_eq!(ch.completed(), 2);
        assert_eq!(host.pending_notifiers(), 0);
    }

    #[test]
    fn test_incr_wfi_has_prefix_and_no_notifier() {
        let (host, _ch, sync) = setup();
        let cmd = sync.incr_wfi().unwrap();
        assert_eq!(cmd.entry.size(), 8);
        assert_eq!(&cmd.entry.words()[..2], &[0x2001_001E, 0]);
        assert!(cmd.fence.wfi());
        assert_eq!(host.pending_notifiers(), 0);
    }

    #[test]
    fn test_notifier_holds_channel_ref() {
        let (host, ch, sync) = setup();
        let before = Arc::strong_count(&ch);
        let cmd = sync.incr(false).unwrap();
        assert_eq!(Arc::strong_count(&ch), before + 1);
        host.gpu_incr(sync.syncpt_id().unwrap(), 2);
        assert!(cmd.fence.is_expired());
        assert_eq!(Arc::strong_count(&ch), before);
    }

    #[test]
    fn test_dying_channel_skips_notifier() {
        let (host, ch, sync) = setup();
        ch.mark_dying();
        assert!(sync.incr(false).is_ok());
        assert_eq!(host.pending_notifiers(), 0);
    }

    #[test]
    fn test_wait_syncpt_expired_is_empty() {
        let (host, ch, sync) = setup();
        let other = host.alloc_host_managed(magma_core::ChannelId::new(9), "other").unwrap();
        host.incr_max(other, 10);
        host.gpu_incr(other, 10);

        let cmd = sync.wait_syncpt(other, 10).unwrap();
        assert!(cmd.is_empty());
        assert_eq!(ch.priv_cmdbuf_stats().allocs, 0);

        let cmd = sync.wait_syncpt(other, 11).unwrap();
        let entry = cmd.entry.unwrap();
        assert_eq!(entry.words(), [0x2001_001C, 11, 0x2001_001D, (other.raw() << 8) | 0x10]);
        assert!(cmd.fence.is_none());
    }

    #[test]
    fn test_wait_syncpt_invalid_id_elided() {
        let (_host, ch, sync) = setup();
        let cmd = sync.wait_syncpt(SyncpointId::new(10_000), 1).unwrap();
        assert!(cmd.is_empty());
        assert_eq!(ch.priv_cmdbuf_stats().allocs, 0);
    }

    #[test]
    fn test_wait_fence_mixed_expiry_keeps_order() {
        let (host, _ch, sync) = setup();
        let ids: Vec<SyncpointId> = (0..3)
            .map(|i| host.alloc_host_managed(magma_core::ChannelId::new(10 + i), "dep").unwrap())
            .collect();
        host.incr_max(ids[1], 4);
        host.gpu_incr(ids[1], 4);

        let fence = SyncFence::with_syncpoints("deps", vec![
            SyncPoint::new(ids[0], 5),
            SyncPoint::new(ids[1], 4),
            SyncPoint::new(ids[2], 7),
        ]);
        let cmd = sync.wait_fence(&fence).unwrap();
        let words = cmd.entry.unwrap().words();
        assert_eq!(words.len(), 12);
        assert_eq!(&words[0..4], &[0x2001_001C, 5, 0x2001_001D, (ids[0].raw() << 8) | 0x10]);
        assert_eq!(&words[4..8], &[0, 0, 0, 0]);
        assert_eq!(&words[8..12], &[0x2001_001C, 7, 0x2001_001D, (ids[2].raw() << 8) | 0x10]);
    }

    #[test]
    fn test_wait_fence_rejects_invalid_and_opaque_sources() {
        let (_host, _ch, sync) = setup();
        let bad = SyncFence::with_syncpoints("bad", vec![SyncPoint::new(SyncpointId::INVALID, 1)]);
        assert_eq!(sync.wait_fence(&bad).err(), Some(Error::InvalidParameter));
        let opaque = SyncFence::new("sw");
        assert_eq!(sync.wait_fence(&opaque).err(), Some(Error::InvalidParameter));
    }

    #[test]
    fn test_wait_fence_empty_source() {
        let (_host, ch, sync) = setup();
        let empty = SyncFence::with_syncpoints("empty", Vec::new());
        assert!(sync.wait_fence(&empty).unwrap().is_empty());
        assert_eq!(ch.priv_cmdbuf_stats().allocs, 0);
    }

    #[test]
    fn test_wait_fd_lookup() {
        let host = Arc::new(Host1x::new(Host1xConfig::default()));
        let platform = testing::syncpt_platform(host.clone());
        let sync = ChannelSyncpt::new(testing::channel(0, 64), &platform).unwrap();
        assert_eq!(sync.wait_fd(42).err(), Some(Error::InvalidParameter));

        let other = ChannelSyncpt::new(testing::channel(1, 64), &platform).unwrap();
        let cmd = other.incr(true).unwrap();
        let fd = cmd.fence.install_fd(&platform.fds).unwrap();
        let wait = sync.wait_fd(fd).unwrap();
        assert_eq!(wait.entry.unwrap().size(), 4);
    }

    #[test]
    fn test_destroy_forces_min_eq_max() {
        let (host, _ch, sync) = setup();
        let id = sync.syncpt_id().unwrap();
        let cmd = sync.incr(false).unwrap();
        drop(sync);
        assert!(cmd.fence.is_expired());
        assert_eq!(host.read_min(id), host.read_max(id));
    }

    #[test]
    fn test_cmdbuf_full_propagates() {
        let host = Arc::new(Host1x::new(Host1xConfig::default()));
        let platform = testing::syncpt_platform(host.clone());
        let sync = ChannelSyncpt::new(testing::channel(0, 8), &platform).unwrap();
        let id = sync.syncpt_id().unwrap();
        let max = host.read_max(id);
        let _held = sync.incr(false).unwrap();
        assert_eq!(sync.incr(false).err(), Some(Error::CommandBufferFull));
        assert_eq!(host.read_max(id), max.wrapping_add(2));
    }

    #[test]
    fn test_dropped_increments_recycle_buffer() {
        let (host, channel, sync) = setup();
        let id = sync.syncpt_id().unwrap();
        for _ in 0..40 {
            let cmd = sync.incr_wfi().unwrap();
            drop(cmd);
        }
        let stats = channel.priv_cmdbuf_stats();
        assert_eq!(stats.allocs, 40);
        assert_eq!(stats.frees, 40);
        assert_eq!(stats.stalls, 0);
        assert_eq!(host.read_max(id), 80);
    }

    #[test]
    fn test_notifier_failure_keeps_threshold() {
        let host = Arc::new(Host1x::new(Host1xConfig {
            max_notifiers: 0,
            ..Host1xConfig::default()
        }));
        let platform = testing::syncpt_platform(host.clone());
        let channel = testing::channel(4, 64);
        let sync = ChannelSyncpt::new(channel.clone(), &platform).unwrap();
        let id = sync.syncpt_id().unwrap();
        let max = host.read_max(id);
        let refs = Arc::strong_count(&channel);

        let cmd = sync.incr(false).unwrap();
        assert_eq!(cmd.fence.syncpt().unwrap().thresh, max.wrapping_add(2));
        assert_eq!(host.read_max(id), max.wrapping_add(2));
        assert_eq!(host.pending_notifiers(), 0);
        assert_eq!(Arc::strong_count(&channel), refs);
    }

    /// Host whose `incr_max` blocks until the gate opens
    struct GatedHost {
        inner: Host1x,
        entered: AtomicBool,
        open: AtomicBool,
    }

    impl GatedHost {
        fn wait_entered(&self) {
            while !self.entered.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
        }
    }

    impl SyncpointHost for GatedHost {
        fn alloc_host_managed(&self, owner: magma_core::ChannelId, name: &str) -> Result<SyncpointId> {
            self.inner.alloc_host_managed(owner, name)
        }
        fn put_ref(&self, id: SyncpointId) {
            self.inner.put_ref(id)
        }
        fn is_valid(&self, id: SyncpointId) -> bool {
            self.inner.is_valid(id)
        }
        fn is_expired(&self, id: SyncpointId, thresh: u32) -> bool {
            self.inner.is_expired(id, thresh)
        }
        fn read_min(&self, id: SyncpointId) -> u32 {
            self.inner.read_min(id)
        }
        fn read_max(&self, id: SyncpointId) -> u32 {
            self.inner.read_max(id)
        }
        fn incr_max(&self, id: SyncpointId, incrs: u32) -> u32 {
            if !self.entered.swap(true, Ordering::AcqRel) {
                while !self.open.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
            }
            self.inner.incr_max(id, incrs)
        }
        fn set_min_eq_max(&self, id: SyncpointId) {
            self.inner.set_min_eq_max(id)
        }
        fn register_notifier(
            &self,
            id: SyncpointId,
            thresh: u32,
            callback: magma_core::NotifierFn,
        ) -> Result<()> {
            self.inner.register_notifier(id, thresh, callback)
        }
    }

    #[test]
    fn test_thresholds_follow_region_order() {
        use std::thread;
        use std::time::Duration;

        let host = Arc::new(GatedHost {
            inner: Host1x::new(Host1xConfig::default()),
            entered: AtomicBool::new(false),
            open: AtomicBool::new(false),
        });
        let platform = SyncPlatform::new(crate::config::SyncConfig {
            capabilities: Capabilities::all(),
            ..Default::default()
        })
        .with_host(host.clone());
        let sync = Arc::new(ChannelSyncpt::new(testing::channel(0, 64), &platform).unwrap());

        let first = {
            let sync = sync.clone();
            thread::spawn(move || sync.incr_wfi().unwrap())
        };
        host.wait_entered();
        let second = {
            let sync = sync.clone();
            thread::spawn(move || sync.incr_wfi().unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        host.open.store(true, Ordering::Release);

        let a = first.join().unwrap();
        let b = second.join().unwrap();
        assert!(a.entry.off() < b.entry.off());
        assert!(a.fence.syncpt().unwrap().thresh < b.fence.syncpt().unwrap().thresh);

        // Running only the first region completes only the first fence.
        let id = sync.syncpt_id().unwrap();
        host.inner.gpu_incr(id, 2);
        assert!(a.fence.is_expired());
        assert!(!b.fence.is_expired());
    }
}
