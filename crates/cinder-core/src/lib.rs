//! # Cinder Core
//!
//! Foundational types shared by every layer of the command submission
//! engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      cinder-core                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Types     │  │  Settings   │  │   Error / Fatal     │  │
//! │  │ (GpuAddr,   │  │ (provider,  │  │   invariants        │  │
//! │  │  TaskCount) │  │  defaults)  │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │                  ┌─────────────────┐                        │
//! │                  │  Sync (backoff) │                        │
//! │                  └─────────────────┘                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Two error tiers exist. Recoverable conditions are reported through
//! [`Error`]; violated internal invariants go through
//! [`unrecoverable_if!`], which aborts under the workspace profiles.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

#[macro_use]
mod macros;

pub mod error;
pub mod settings;
pub mod sync;
pub mod types;

#[doc(hidden)]
pub use log as __log;

// Re-exports for convenience
pub use error::{Error, Result};
pub use settings::{ConfigProvider, ConfigValue, DebugSettings, MemoryConfig};
pub use sync::{spin_until, Backoff, CompletionTag};
pub use types::*;
