//! # Cinder Command Submission
//!
//! Deferred commands, the per-device command stream receiver that flushes
//! them, and the device-side dispatch path for parent kernels.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                    Command Submission Pipeline                    │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐     │
//! │  │   Command    │    │   Command    │    │  Command Stream  │     │
//! │  │ (kernel/map/ │───▶│    Queue     │───▶│     Receiver     │     │
//! │  │   marker)    │    │ (stream+heap)│    │  (ring, state)   │     │
//! │  └──────────────┘    └──────────────┘    └────────┬─────────┘     │
//! │         │                                         │               │
//! │  ┌──────▼───────┐                        ┌────────▼─────────┐     │
//! │  │ Device Queue │                        │    HwEngine      │     │
//! │  │ + Scheduler  │                        │ (submit, tag)    │     │
//! │  └──────────────┘                        └──────────────────┘     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Submission Flow
//!
//! 1. A kernel dispatch is staged into a [`KernelOperation`]
//! 2. The resulting [`Command`] is enqueued on a [`CommandQueue`]
//! 3. `flush_deferred` submits it: ownership, residency, flags, flush
//! 4. The engine writes the completion tag and the submitter wakes

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod command;
pub mod context;
pub mod device;
pub mod device_queue;
pub mod encoder;
pub mod engine;
pub mod flags;
pub mod kernel;
pub mod mem_obj;
pub mod operation;
pub mod preemption;
pub mod printf;
pub mod queue;
pub mod receiver;
pub mod registry;
pub mod scheduler;
pub mod stream;
pub mod surface;
pub mod timestamp;

#[cfg(test)]
mod testing;

// Re-exports
pub use command::{Command, CommandComputeKernel, CommandMapUnmap, CommandMarker, MapOperationType};
pub use context::{Context, PreFlushHook};
pub use device::{Device, DeviceOwnership};
pub use device_queue::{DeviceQueue, EmCriticalSection};
pub use engine::{HwEngine, SoftwareEngine, Submission, SubmissionRecord, DEFAULT_RECORD_CAPACITY};
pub use flags::{CommandType, CompletionStamp, DispatchFlags, QueuePriority, QueueThrottle};
pub use kernel::{Kernel, KernelInfo, Program};
pub use mem_obj::MemObj;
pub use operation::KernelOperation;
pub use preemption::{PreemptionHelper, PreemptionMode};
pub use printf::PrintfHandler;
pub use queue::CommandQueue;
pub use receiver::{CommandStreamReceiver, ReceiverOwnership};
pub use registry::{DeviceRegistry, HardwareInfo};
pub use scheduler::SchedulerKernel;
pub use stream::LinearStream;
pub use surface::Surface;
pub use timestamp::{DependencyContainer, DependencyNode, TagAllocator};
