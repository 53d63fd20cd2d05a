//! # MAGMA Core
//!
//! Foundational traits, types, and abstractions shared by the MAGMA channel
//! synchronization stack.
//!
//! This crate provides the type-system foundations that the command, memory
//! and sync crates build on.
//!
//! ## Design Principles
//!
//! 1. **Strong Typing**: GPU addresses, sizes and syncpoint ids never mix
//! 2. **Narrow Seams**: hardware collaborators are reached through traits
//! 3. **No Panics**: every fallible operation returns [`Result`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      magma-core                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Traits    │  │   Types     │  │     Error           │  │
//! │  │ (Syncpoint  │  │ (GpuAddr,   │  │   Handling          │  │
//! │  │  Host, Vm)  │  │ SyncpointId)│  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use error::{Error, ErrorClass, Result};
pub use traits::*;
pub use types::*;
