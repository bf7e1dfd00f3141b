//! # Cinder Error Handling
//!
//! Recoverable error conditions of the submission stack.
//!
//! Error handling in Cinder follows these principles:
//! - Errors are typed and categorized by subsystem
//! - Violated invariants are not errors; they abort through
//!   [`unrecoverable_if!`](crate::unrecoverable_if)
//! - Errors are `no_std` compatible

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Cinder Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Cinder unified error type
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
    /// Resource already registered
    AlreadyExists,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Out of device memory
    OutOfMemory,
    /// Alignment is zero or not a power of two
    InvalidAlignment,
    /// Heap has no room for the request
    HeapExhausted,
    /// Allocation pool exhausted
    PoolExhausted,

    // =========================================================================
    // Command Submission Errors
    // =========================================================================
    /// Command buffer full
    CommandBufferFull,
    /// Dependency node allocator has no free slot
    TagPoolExhausted,

    // =========================================================================
    // Settings Errors
    // =========================================================================
    /// Setting has the wrong type for the requested accessor
    SettingTypeMismatch,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::AlreadyExists => write!(f, "resource already exists"),

            // Memory
            Self::OutOfMemory => write!(f, "out of device memory"),
            Self::InvalidAlignment => write!(f, "invalid alignment"),
            Self::HeapExhausted => write!(f, "heap exhausted"),
            Self::PoolExhausted => write!(f, "allocation pool exhausted"),

            // Command
            Self::CommandBufferFull => write!(f, "command buffer full"),
            Self::TagPoolExhausted => write!(f, "dependency node pool exhausted"),

            // Settings
            Self::SettingTypeMismatch => write!(f, "setting type mismatch"),
        }
    }
}
