//! # Sync Method Encoder
//!
//! Encode syncpoint and semaphore operations to host method words.
//!
//! Every block is a run of (method header, data) pairs. Blocks are staged in
//! a fixed-capacity buffer and copied into the private command buffer in one
//! write, so a partially encoded block is never visible to the GPU.

use arrayvec::ArrayVec;
use magma_core::{GpuAddr, Result, SyncpointId};

use crate::priv_cmdbuf::PrivCmdEntry;

// =============================================================================
// METHODS
// =============================================================================

/// Host methods used by the sync backends (incrementing, one data word)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Method {
    /// Semaphore address, upper bits
    SemaphoreA = 0x2001_0004,
    /// Semaphore address, lower bits
    SemaphoreB = 0x2001_0005,
    /// Semaphore payload
    SemaphoreC = 0x2001_0006,
    /// Semaphore operation
    SemaphoreD = 0x2001_0007,
    /// Raise a non-stalling interrupt
    NonStallInt = 0x2001_0008,
    /// Syncpoint payload
    SyncpointA = 0x2001_001C,
    /// Syncpoint operation
    SyncpointB = 0x2001_001D,
    /// Wait for the engine to go idle
    WaitForIdle = 0x2001_001E,
}

impl Method {
    /// Header word
    #[inline]
    pub const fn header(self) -> u32 {
        self as u32
    }
}

const SYNCPT_OP_WAIT: u32 = 0x10;
const SYNCPT_OP_INCR: u32 = 0x1;

const SEMA_OP_ACQ_GEQ: u32 = 0x4;
const SEMA_OP_RELEASE: u32 = 0x2;
const SEMA_ACQ_SWITCH_EN: u32 = 1 << 12;
const SEMA_RELEASE_NO_WFI: u32 = 1 << 20;

/// Words in a syncpoint wait block
pub const WAIT_CMD_WORDS: u32 = 4;
/// Words in a syncpoint increment block, without the idle prefix
pub const SYNCPT_INCR_WORDS: u32 = 6;
/// Words in the wait-for-idle prefix
pub const WFI_WORDS: u32 = 2;
/// Words in a semaphore acquire or release
pub const SEMA_WORDS: u32 = 8;
/// Words in the trailing non-stall interrupt
pub const NONSTALL_INT_WORDS: u32 = 2;

/// Largest block any encoder here produces
const MAX_BLOCK_WORDS: usize = 10;

// =============================================================================
// BLOCK STAGING
// =============================================================================

/// A method block staged for a single write
#[derive(Debug, Default)]
struct Block {
    words: ArrayVec<u32, MAX_BLOCK_WORDS>,
}

impl Block {
    fn push_single(&mut self, method: Method, data: u32) {
        self.words.push(method.header());
        self.words.push(data);
    }

    fn len(&self) -> u32 {
        self.words.len() as u32
    }

    fn write_to(&self, entry: &mut PrivCmdEntry, at: u32) -> Result<u32> {
        entry.write(at, &self.words)?;
        Ok(self.len())
    }
}

// =============================================================================
// SYNCPOINT ENCODING
// =============================================================================

/// Encode a syncpoint wait
pub fn syncpt_wait_words(id: SyncpointId, thresh: u32) -> [u32; 4] {
    [
        Method::SyncpointA.header(),
        thresh,
        Method::SyncpointB.header(),
        (id.raw() << 8) | SYNCPT_OP_WAIT,
    ]
}

/// Write a syncpoint wait at word offset `at`
pub fn add_wait_cmd(entry: &mut PrivCmdEntry, at: u32, id: SyncpointId, thresh: u32) -> Result<()> {
    entry.write(at, &syncpt_wait_words(id, thresh))
}

/// Write a zeroed wait block, for a dependency that has already expired
pub fn add_noop_wait(entry: &mut PrivCmdEntry, at: u32) -> Result<()> {
    entry.zero(at, WAIT_CMD_WORDS)
}

/// Size of a syncpoint increment
pub const fn syncpt_incr_len(wfi: bool) -> u32 {
    if wfi {
        SYNCPT_INCR_WORDS + WFI_WORDS
    } else {
        SYNCPT_INCR_WORDS
    }
}

/// Write a syncpoint increment at the start of `entry`
///
/// The increment is issued twice to work around a hardware erratum. Callers
/// must reserve two increments on the syncpoint for every block.
pub fn add_syncpt_incr(entry: &mut PrivCmdEntry, id: SyncpointId, wfi: bool) -> Result<u32> {
    let mut block = Block::default();

    if wfi {
        block.push_single(Method::WaitForIdle, 0);
    }
    block.push_single(Method::SyncpointA, 0);
    block.push_single(Method::SyncpointB, (id.raw() << 8) | SYNCPT_OP_INCR);
    block.push_single(Method::SyncpointB, (id.raw() << 8) | SYNCPT_OP_INCR);

    block.write_to(entry, 0)
}

// =============================================================================
// SEMAPHORE ENCODING
// =============================================================================

/// Semaphore operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaOp {
    /// Block the channel until the semaphore value is at least the payload
    Acquire,
    /// Write the payload to the semaphore
    Release {
        /// Wait for idle before writing
        wfi: bool,
        /// Raise a non-stall interrupt afterwards
        nonstall_irq: bool,
    },
}

impl SemaOp {
    /// Size of the encoded operation
    pub const fn words(self) -> u32 {
        match self {
            SemaOp::Acquire => SEMA_WORDS,
            SemaOp::Release { nonstall_irq: true, .. } => SEMA_WORDS + NONSTALL_INT_WORDS,
            SemaOp::Release { .. } => SEMA_WORDS,
        }
    }
}

/// Write a semaphore operation at the start of `entry`
///
/// Only the low 8 bits of the upper address half are encoded.
pub fn add_sema_cmd(entry: &mut PrivCmdEntry, va: GpuAddr, payload: u32, op: SemaOp) -> Result<u32> {
    let mut block = Block::default();

    block.push_single(Method::SemaphoreA, va.upper_32() & 0xff);
    block.push_single(Method::SemaphoreB, va.lower_32());
    block.push_single(Method::SemaphoreC, payload);

    match op {
        SemaOp::Acquire => {
            block.push_single(Method::SemaphoreD, SEMA_OP_ACQ_GEQ | SEMA_ACQ_SWITCH_EN);
        },
        SemaOp::Release { wfi, nonstall_irq } => {
            let no_wfi = if wfi { 0 } else { SEMA_RELEASE_NO_WFI };
            block.push_single(Method::SemaphoreD, SEMA_OP_RELEASE | no_wfi);
            if nonstall_irq {
                block.push_single(Method::NonStallInt, 0);
            }
        },
    }

    block.write_to(entry, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priv_cmdbuf::{PrivCmdBuffer, PrivCmdConfig};

    fn buffer() -> PrivCmdBuffer {
        PrivCmdBuffer::new(PrivCmdConfig {
            size_words: 64,
            gpu_va: GpuAddr::new(0x4000),
        })
    }

    #[test]
    fn test_wait_cmd_layout() {
        let mut q = buffer();
        let mut e = q.alloc(WAIT_CMD_WORDS * 2).unwrap();
        add_wait_cmd(&mut e, 0, SyncpointId::new(5), 100).unwrap();
        add_noop_wait(&mut e, WAIT_CMD_WORDS).unwrap();
        assert_eq!(
            e.words(),
            [0x2001_001C, 100, 0x2001_001D, (5 << 8) | 0x10, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_syncpt_incr_layout() {
        let mut q = buffer();
        let mut e = q.alloc(syncpt_incr_len(false)).unwrap();
        assert_eq!(add_syncpt_incr(&mut e, SyncpointId::new(7), false).unwrap(), 6);
        assert_eq!(
            e.words(),
            [0x2001_001C, 0, 0x2001_001D, 0x701, 0x2001_001D, 0x701]
        );
    }

    #[test]
    fn test_syncpt_incr_wfi_prefix() {
        let mut q = buffer();
        let mut e = q.alloc(syncpt_incr_len(true)).unwrap();
        assert_eq!(add_syncpt_incr(&mut e, SyncpointId::new(7), true).unwrap(), 8);
        assert_eq!(&e.words()[..2], &[0x2001_001E, 0]);
    }

    #[test]
    fn test_sema_acquire_layout() {
        let mut q = buffer();
        let mut e = q.alloc(SemaOp::Acquire.words()).unwrap();
        let va = GpuAddr::new(0x1_2345_6780);
        add_sema_cmd(&mut e, va, 9, SemaOp::Acquire).unwrap();
        assert_eq!(
            e.words(),
            [
                0x2001_0004, 0x1, 0x2001_0005, 0x2345_6780, 0x2001_0006, 9, 0x2001_0007,
                0x4 | (1 << 12),
            ]
        );
    }

    #[test]
    fn test_sema_release_wfi_bit() {
        let mut q = buffer();
        let op = SemaOp::Release { wfi: false, nonstall_irq: true };
        let mut e = q.alloc(op.words()).unwrap();
        assert_eq!(add_sema_cmd(&mut e, GpuAddr::new(0x1000), 1, op).unwrap(), 10);
        let words = e.words();
        assert_eq!(words[7], 0x2 | (1 << 20));
        assert_eq!(&words[8..], &[0x2001_0008, 0]);

        let op = SemaOp::Release { wfi: true, nonstall_irq: false };
        let mut e = q.alloc(op.words()).unwrap();
        assert_eq!(add_sema_cmd(&mut e, GpuAddr::new(0x1000), 1, op).unwrap(), 8);
        assert_eq!(e.words()[7], 0x2);
    }

    #[test]
    fn test_upper_address_truncated() {
        let mut q = buffer();
        let mut e = q.alloc(SEMA_WORDS).unwrap();
        add_sema_cmd(&mut e, GpuAddr::new(0xAB_0000_0000), 0, SemaOp::Acquire).unwrap();
        assert_eq!(e.words()[1], 0xAB);
        let mut e = q.alloc(SEMA_WORDS).unwrap();
        add_sema_cmd(&mut e, GpuAddr::new(0x1AB_0000_0000), 0, SemaOp::Acquire).unwrap();
        assert_eq!(e.words()[1], 0xAB);
    }
}
