//! # MAGMA Command System
//!
//! Private command buffers and the fixed-format method sequences used for
//! channel synchronization.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                    Sync Command Pipeline                          │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐     │
//! │  │  Sync        │    │  Encoder     │    │  PrivCmdBuffer   │     │
//! │  │  Backend     │───▶│ (wait/incr,  │───▶│  (FIFO ring of   │     │
//! │  │              │    │  acq/rel)    │    │   u32 words)     │     │
//! │  └──────────────┘    └──────────────┘    └────────┬─────────┘     │
//! │                                                    │              │
//! │                                           ┌────────▼─────────┐    │
//! │                                           │   GPFIFO entry   │    │
//! │                                           │  (gpu_va, size)  │    │
//! │                                           └──────────────────┘    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Allocation Flow
//!
//! 1. A backend reserves a region sized for the block it will emit
//! 2. The encoder stages the block and writes it in one pass
//! 3. The region is referenced from a GPFIFO entry
//! 4. Once the GPU has consumed it, the region is returned in FIFO order

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod encoder;
pub mod priv_cmdbuf;

// Re-exports
pub use encoder::{Method, SemaOp};
pub use priv_cmdbuf::{PrivCmdBuffer, PrivCmdConfig, PrivCmdEntry, PrivCmdStats};
