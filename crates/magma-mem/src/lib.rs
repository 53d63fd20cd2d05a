//! # MAGMA Memory Management
//!
//! Fixed-size slot pools for GPU-visible memory. Pools are laid out by
//! offset and know nothing about where they end up mapped.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      MAGMA Memory System                        │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                        SlotPool                           │  │
//! │  │              bitmap slots, lowest free first              │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                  │
//! │  ┌───────────────────────────┴───────────────────────────────┐  │
//! │  │                 GpuVm (provided by the caller)            │  │
//! │  │           maps the pool span into a channel VM            │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod pool;

// Re-exports
pub use pool::{Slot, SlotConfig, SlotPool, SlotStats};
