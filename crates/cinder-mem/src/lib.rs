//! # Cinder Memory Management
//!
//! Graphics allocations, the allocation reuse pool and per-dispatch staging
//! heaps.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Cinder Memory System                       │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                     Memory Manager                        │  │
//! │  │        (GPU VA assignment, fresh vs reused blocks)        │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                  │
//! │  ┌─────────────────┐  ┌─────┴─────┐  ┌────────────────────┐     │
//! │  │ Allocation Pool │  │  Indirect │  │  Aligned Buffers   │     │
//! │  │ (reuse / temp)  │  │   Heaps   │  │ (command buffers)  │     │
//! │  └─────────────────┘  └───────────┘  └────────────────────┘     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ownership
//!
//! A [`GraphicsAllocation`] always lives in a `Box` with exactly one owner:
//! a heap, a memory object, the pool, or a component holding internal
//! buffers. Releasing an allocation means handing the box back to the
//! [`AllocationPool`], which has its own lock and never depends on a
//! receiver's ownership lock.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod aligned;
pub mod allocation;
pub mod heap;
pub mod manager;
pub mod pool;

// Re-exports
pub use aligned::AlignedBuffer;
pub use allocation::{AllocationFlags, GraphicsAllocation};
pub use heap::{HeapType, IndirectHeap};
pub use manager::MemoryManager;
pub use pool::{AllocationPool, AllocationUsage, PoolStats};
