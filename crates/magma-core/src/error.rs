//! # MAGMA Error Handling
//!
//! Error types for the channel synchronization stack.
//!
//! Error handling in MAGMA follows these principles:
//! - Errors are typed and categorized
//! - No panics in production code paths
//! - Exhaustion is an ordinary outcome, callers decide whether to retry
//! - Errors are `no_std` compatible

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// MAGMA Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// MAGMA unified error type
///
/// Variants are grouped by subsystem. Use [`Error::class`] to get the
/// coarse category a submission path acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Operation not supported by this backend or build
    NotSupported,
    /// Object is in the wrong state for the operation
    InvalidState,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Out of system memory or address space
    OutOfMemory,
    /// Memory mapping failed
    MappingFailed,
    /// Object is not mapped into a GPU address space
    NotMapped,

    // =========================================================================
    // Command Submission Errors
    // =========================================================================
    /// Private command buffer has no room for the request
    CommandBufferFull,

    // =========================================================================
    // Synchronization Errors
    // =========================================================================
    /// Every semaphore slot of the pool is in use
    OutOfSemaphores,
    /// No free hardware syncpoint
    OutOfSyncpoints,
    /// Syncpoint id is not owned by this host
    InvalidSyncpoint,
    /// Interrupt notifier could not be registered
    NotificationRegistrationFailed,
}

/// Coarse error category seen by submission callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Pool exhaustion; retry after reclamation
    ResourceExhausted,
    /// Foreign or malformed hardware resource id
    InvalidResource,
    /// Malformed argument or descriptor
    InvalidArgument,
    /// Operation not valid for the active backend or build
    Unsupported,
    /// Completion notifier registration failed
    NotificationRegistrationFailed,
    /// State or mapping failure
    Internal,
}

impl Error {
    /// Category of this error
    pub const fn class(self) -> ErrorClass {
        match self {
            Self::OutOfMemory
            | Self::CommandBufferFull
            | Self::OutOfSemaphores
            | Self::OutOfSyncpoints => ErrorClass::ResourceExhausted,
            Self::InvalidSyncpoint => ErrorClass::InvalidResource,
            Self::InvalidParameter | Self::NotFound => ErrorClass::InvalidArgument,
            Self::NotSupported => ErrorClass::Unsupported,
            Self::NotificationRegistrationFailed => ErrorClass::NotificationRegistrationFailed,
            Self::InvalidState | Self::MappingFailed | Self::NotMapped => ErrorClass::Internal,
        }
    }

    /// Check if retrying after reclamation may succeed
    #[inline]
    pub const fn is_retryable(self) -> bool {
        matches!(self.class(), ErrorClass::ResourceExhausted)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::InvalidState => write!(f, "invalid state"),

            // Memory
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::MappingFailed => write!(f, "memory mapping failed"),
            Self::NotMapped => write!(f, "not mapped"),

            // Command
            Self::CommandBufferFull => write!(f, "not enough priv cmd buffer space"),

            // Sync
            Self::OutOfSemaphores => write!(f, "ran out of semaphores"),
            Self::OutOfSyncpoints => write!(f, "failed to get free syncpt"),
            Self::InvalidSyncpoint => write!(f, "invalid syncpoint id"),
            Self::NotificationRegistrationFailed => {
                write!(f, "failed to register completion notifier")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
