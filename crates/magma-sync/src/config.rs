//! # Sync Configuration
//!
//! Platform capabilities and runtime knobs for channel sync creation.

use alloc::sync::Arc;

use magma_core::SyncpointHost;

use crate::external::SyncFdTable;

bitflags::bitflags! {
    /// Synchronization features available on the platform
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// Hardware syncpoints are present
        const SYNCPOINTS = 1 << 0;
        /// External sync fences are supported
        const SYNC_FENCE = 1 << 1;
    }
}

impl Capabilities {
    /// Capabilities compiled into this build
    pub fn from_build() -> Self {
        let mut caps = Self::empty();
        if cfg!(feature = "syncpoints") {
            caps |= Self::SYNCPOINTS;
        }
        if cfg!(feature = "sync-fence") {
            caps |= Self::SYNC_FENCE;
        }
        caps
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::from_build()
    }
}

/// Channel sync configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Enabled features
    pub capabilities: Capabilities,
    /// Slots per channel semaphore pool
    pub semaphore_pool_slots: u32,
    /// Device name used in syncpoint and timeline names
    pub device_name: &'static str,
    /// Raise a non-stall interrupt after each semaphore release
    pub nonstall_irq: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            capabilities: Capabilities::default(),
            semaphore_pool_slots: 1024,
            device_name: "gk20a",
            nonstall_irq: true,
        }
    }
}

// =============================================================================
// PLATFORM
// =============================================================================

/// Per-device state shared by every channel's sync backend
#[derive(Clone)]
pub struct SyncPlatform {
    /// Configuration
    pub config: SyncConfig,
    /// Syncpoint host, when the device sits behind one
    pub host: Option<Arc<dyn SyncpointHost>>,
    /// Sync fence descriptor table
    pub fds: Arc<SyncFdTable>,
}

impl SyncPlatform {
    /// Platform without a syncpoint host
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            host: None,
            fds: Arc::new(SyncFdTable::new()),
        }
    }

    /// Attach a syncpoint host
    pub fn with_host(mut self, host: Arc<dyn SyncpointHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Check if channels should use syncpoints
    pub fn has_syncpoints(&self) -> bool {
        self.config.capabilities.contains(Capabilities::SYNCPOINTS) && self.host.is_some()
    }

    /// Check if external sync fences are available
    pub fn has_sync_fence(&self) -> bool {
        self.config.capabilities.contains(Capabilities::SYNC_FENCE)
    }
}

impl core::fmt::Debug for SyncPlatform {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncPlatform")
            .field("config", &self.config)
            .field("host", &self.host.is_some())
            .field("fds", &self.fds.len())
            .finish()
    }
}
