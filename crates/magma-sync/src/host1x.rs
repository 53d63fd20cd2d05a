//! # Software Host1x
//!
//! A syncpoint host kept entirely in memory. Each syncpoint tracks the value
//! last observed from the counter (`min`) and the highest value promised to
//! software (`max`). [`Host1x::gpu_incr`] stands in for the engine executing
//! increment methods.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashMap;
use magma_core::{
    ChannelId, Error, NotifierFn, Result, SyncpointHost, SyncpointId, syncpoint_reached,
};
use spin::Mutex;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Host configuration
#[derive(Debug, Clone)]
pub struct Host1xConfig {
    /// Number of syncpoints, including the reserved id 0
    pub num_syncpts: u32,
    /// Maximum outstanding interrupt notifiers
    pub max_notifiers: usize,
}

impl Default for Host1xConfig {
    fn default() -> Self {
        Self {
            num_syncpts: 192,
            max_notifiers: 256,
        }
    }
}

// =============================================================================
// HOST
// =============================================================================

#[derive(Debug, Default)]
struct Syncpt {
    min: AtomicU32,
    max: AtomicU32,
}

#[derive(Debug, Clone)]
struct Owner {
    channel: ChannelId,
    name: String,
}

struct Notifier {
    id: SyncpointId,
    thresh: u32,
    callback: NotifierFn,
}

/// In-memory syncpoint host
pub struct Host1x {
    config: Host1xConfig,
    syncpts: Vec<Syncpt>,
    owners: Mutex<HashMap<SyncpointId, Owner>>,
    notifiers: Mutex<Vec<Notifier>>,
}

impl Host1x {
    /// Create a host
    pub fn new(config: Host1xConfig) -> Self {
        let syncpts = (0..config.num_syncpts).map(|_| Syncpt::default()).collect();
        Self {
            config,
            syncpts,
            owners: Mutex::new(HashMap::new()),
            notifiers: Mutex::new(Vec::new()),
        }
    }

    fn syncpt(&self, id: SyncpointId) -> Option<&Syncpt> {
        if id.is_invalid() {
            return None;
        }
        self.syncpts.get(id.raw() as usize)
    }

    /// Advance a syncpoint as the engine would, firing due notifiers
    pub fn gpu_incr(&self, id: SyncpointId, incrs: u32) {
        let Some(sp) = self.syncpt(id) else {
            log::warn!("host1x: increment of invalid syncpt {}", id);
            return;
        };
        sp.min.fetch_add(incrs, Ordering::AcqRel);
        self.run_notifiers(id);
    }

    /// Channel owning a syncpoint
    pub fn owner(&self, id: SyncpointId) -> Option<ChannelId> {
        self.owners.lock().get(&id).map(|o| o.channel)
    }

    /// Name a syncpoint was allocated under
    pub fn name(&self, id: SyncpointId) -> Option<String> {
        self.owners.lock().get(&id).map(|o| o.name.clone())
    }

    /// Syncpoints currently allocated
    pub fn allocated(&self) -> usize {
        self.owners.lock().len()
    }

    /// Notifiers still waiting for their threshold
    pub fn pending_notifiers(&self) -> usize {
        self.notifiers.lock().len()
    }

    fn run_notifiers(&self, id: SyncpointId) {
        let value = self.read_min(id);
        let ready: Vec<Notifier> = {
            let mut list = self.notifiers.lock();
            let (ready, pending) = core::mem::take(&mut *list)
                .into_iter()
                .partition(|n| n.id == id && syncpoint_reached(value, n.thresh));
            *list = pending;
            ready
        };

        // Callbacks may register new notifiers; the lock is not held here.
        let count = ready.len() as u32;
        for notifier in ready {
            (notifier.callback)(count);
        }
    }
}

impl SyncpointHost for Host1x {
    fn alloc_host_managed(&self, owner: ChannelId, name: &str) -> Result<SyncpointId> {
        let mut owners = self.owners.lock();
        let id = (1..self.config.num_syncpts)
            .map(SyncpointId::new)
            .find(|id| !owners.contains_key(id))
            .ok_or(Error::OutOfSyncpoints)?;

        owners.insert(id, Owner {
            channel: owner,
            name: name.to_string(),
        });
        log::debug!("host1x: syncpt {} -> {} ({})", id, name, owner);
        Ok(id)
    }

    fn put_ref(&self, id: SyncpointId) {
        if self.owners.lock().remove(&id).is_none() {
            log::warn!("host1x: put of unallocated syncpt {}", id);
        }
    }

    fn is_valid(&self, id: SyncpointId) -> bool {
        self.syncpt(id).is_some()
    }

    fn is_expired(&self, id: SyncpointId, thresh: u32) -> bool {
        syncpoint_reached(self.read_min(id), thresh)
    }

    fn read_min(&self, id: SyncpointId) -> u32 {
        self.syncpt(id)
            .map(|sp| sp.min.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn read_max(&self, id: SyncpointId) -> u32 {
        self.syncpt(id)
            .map(|sp| sp.max.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn incr_max(&self, id: SyncpointId, incrs: u32) -> u32 {
        match self.syncpt(id) {
            Some(sp) => sp.max.fetch_add(incrs, Ordering::AcqRel).wrapping_add(incrs),
            None => 0,
        }
    }

    fn set_min_eq_max(&self, id: SyncpointId) {
        let Some(sp) = self.syncpt(id) else {
            return;
        };
        sp.min.store(sp.max.load(Ordering::Acquire), Ordering::Release);
        self.run_notifiers(id);
    }

    fn register_notifier(&self, id: SyncpointId, thresh: u32, callback: NotifierFn) -> Result<()> {
        if !self.is_valid(id) {
            return Err(Error::InvalidSyncpoint);
        }

        {
            let mut list = self.notifiers.lock();
            if !self.is_expired(id, thresh) {
                if list.len() >= self.config.max_notifiers {
                    return Err(Error::NotificationRegistrationFailed);
                }
                list.push(Notifier {
                    id,
                    thresh,
                    callback,
                });
                return Ok(());
            }
        }

        callback(1);
        Ok(())
    }
}

impl core::fmt::Debug for Host1x {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Host1x")
            .field("config", &self.config)
            .field("allocated", &self.allocated())
            .field("pending_notifiers", &self.pending_notifiers())
            .finish()
    }
}
