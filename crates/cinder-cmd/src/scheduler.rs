//! # Device Scheduler Kernel
//!
//! The built-in kernel that runs after a parent kernel and dispatches the
//! child kernels it enqueued. Its arguments are the device queue buffers
//! plus the parent dispatch's heaps.

use alloc::boxed::Box;

use arrayvec::ArrayVec;

use cinder_core::{ByteSize, GpuAddr, Result};
use cinder_mem::{AllocationFlags, GraphicsAllocation, MemoryManager};

use crate::kernel::next_kernel_id;
use crate::receiver::ReceiverOwnership;

/// Number of scheduler arguments
pub const SCHEDULER_ARG_COUNT: usize = 9;

/// Shared local memory the scheduler reserves per work group
pub const SCHEDULER_SLM_SIZE: u32 = 8 * 1024;

/// Work groups the scheduler is launched with
pub const SCHEDULER_WORK_GROUPS: u32 = 24;

/// Allocations the scheduler reads and writes, in argument order
#[derive(Debug, Clone, Copy)]
pub struct SchedulerArgs<'a> {
    /// Device queue of enqueued child kernels
    pub queue_buffer: &'a GraphicsAllocation,
    /// Stack of pending child enqueues
    pub stack_buffer: &'a GraphicsAllocation,
    /// Device-side event pool
    pub event_pool_buffer: &'a GraphicsAllocation,
    /// Second-level batch the scheduler writes child dispatches into
    pub slb_buffer: &'a GraphicsAllocation,
    /// Parent dispatch's dynamic state heap
    pub dsh: &'a GraphicsAllocation,
    /// Parent kernel's block kernel descriptions
    pub reflection_surface: &'a GraphicsAllocation,
    /// Storage for child kernel queues
    pub queue_storage_buffer: &'a GraphicsAllocation,
    /// Parent dispatch's surface state heap
    pub ssh: &'a GraphicsAllocation,
    /// Scheduler debug output
    pub debug_queue: &'a GraphicsAllocation,
}

impl<'a> SchedulerArgs<'a> {
    /// Arguments in binding order
    pub fn allocations(&self) -> [&'a GraphicsAllocation; SCHEDULER_ARG_COUNT] {
        [
            self.queue_buffer,
            self.stack_buffer,
            self.event_pool_buffer,
            self.slb_buffer,
            self.dsh,
            self.reflection_surface,
            self.queue_storage_buffer,
            self.ssh,
            self.debug_queue,
        ]
    }
}

/// Built-in device scheduler
#[derive(Debug)]
pub struct SchedulerKernel {
    id: u32,
    isa: Box<GraphicsAllocation>,
    args: ArrayVec<GpuAddr, SCHEDULER_ARG_COUNT>,
}

impl SchedulerKernel {
    /// Load the scheduler
    pub fn new(memory_manager: &MemoryManager) -> Result<Self> {
        let isa = memory_manager.allocate_graphics_memory(ByteSize::KIB_64, AllocationFlags::INTERNAL)?;
        Ok(Self {
            id: next_kernel_id(),
            isa,
            args: ArrayVec::new(),
        })
    }

    /// Kernel identity encoded into walkers
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Bind arguments for the next dispatch
    pub fn set_args(&mut self, args: &SchedulerArgs<'_>) {
        self.args.clear();
        self.args.extend(args.allocations().iter().map(|a| a.gpu_addr()));
    }

    /// Bound argument addresses
    pub fn args(&self) -> &[GpuAddr] {
        &self.args
    }

    /// Make the scheduler and its arguments resident
    pub fn make_resident(&self, csr: &mut ReceiverOwnership<'_>, args: &SchedulerArgs<'_>) {
        csr.make_resident(&self.isa);
        for allocation in args.allocations() {
            csr.make_resident(allocation);
        }
    }

    /// Shared local memory per work group
    pub fn slm_total_size(&self) -> u32 {
        SCHEDULER_SLM_SIZE
    }

    /// Work groups per launch
    pub fn work_groups(&self) -> u32 {
        SCHEDULER_WORK_GROUPS
    }
}
