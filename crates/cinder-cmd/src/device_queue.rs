//! # Device Queue
//!
//! Buffers shared between a parent kernel and the device scheduler, plus the
//! critical section that keeps two parent dispatches from preparing device
//! queue state at the same time.
//!
//! ```text
//! queue buffer:  ┌───────┬──────┬──────┬──────┬────────────┬────────────────┐
//!                │ magic │ size │ head │ tail │ task count │ enqueued ...   │
//!                └───────┴──────┴──────┴──────┴────────────┴────────────────┘
//! ```

use alloc::boxed::Box;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use cinder_core::{spin_until, ByteSize, GpuAddr, Result, TaskCount};
use cinder_mem::{AllocationFlags, GraphicsAllocation, IndirectHeap, MemoryManager};

use crate::encoder::{HwCommand, PipeControlFlags};
use crate::kernel::Kernel;
use crate::preemption::PreemptionMode;
use crate::scheduler::SchedulerKernel;
use crate::stream::LinearStream;

/// Queue buffer header marker
pub const QUEUE_HEADER_MAGIC: u32 = 0x5145_5644;

/// Bytes taken by the queue buffer header
pub const QUEUE_HEADER_SIZE: u32 = 20;

/// Bytes of surface state reserved per block kernel
const BLOCK_SURFACE_STATE_SIZE: usize = 64;

/// Device-side enqueue state of one context
pub struct DeviceQueue {
    queue_buffer: Box<GraphicsAllocation>,
    stack_buffer: Box<GraphicsAllocation>,
    event_pool_buffer: Box<GraphicsAllocation>,
    slb_buffer: Box<GraphicsAllocation>,
    queue_storage_buffer: Box<GraphicsAllocation>,
    debug_queue: Box<GraphicsAllocation>,
    /// Held while a parent dispatch prepares device queue state
    critical_section: AtomicBool,
    last_task_count: AtomicU32,
    dispatches: AtomicU64,
}

impl DeviceQueue {
    /// Allocate the device queue buffers
    pub fn new(memory_manager: &MemoryManager) -> Result<Self> {
        let buffer = |size: ByteSize| {
            memory_manager.allocate_graphics_memory(size, AllocationFlags::INTERNAL | AllocationFlags::COHERENT)
        };
        let queue = Self {
            queue_buffer: buffer(ByteSize::KIB_64)?,
            stack_buffer: buffer(ByteSize::KIB_4)?,
            event_pool_buffer: buffer(ByteSize::KIB_4)?,
            slb_buffer: buffer(ByteSize::KIB_64)?,
            queue_storage_buffer: buffer(ByteSize::KIB_64)?,
            debug_queue: buffer(ByteSize::KIB_4)?,
            critical_section: AtomicBool::new(false),
            last_task_count: AtomicU32::new(0),
            dispatches: AtomicU64::new(0),
        };
        queue.reset_device_queue();
        Ok(queue)
    }

    // =========================================================================
    // CRITICAL SECTION
    // =========================================================================

    /// Check if no parent dispatch is preparing device queue state
    pub fn is_em_critical_section_free(&self) -> bool {
        !self.critical_section.load(Ordering::Acquire)
    }

    /// Take the critical section if it is free
    pub fn acquire_em_critical_section(&self) -> Option<EmCriticalSection<'_>> {
        self.critical_section
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| EmCriticalSection { queue: self })
    }

    /// Wait for the critical section, reset the queue, then take it
    pub fn enter_em_critical_section(&self) -> EmCriticalSection<'_> {
        loop {
            spin_until(|| self.is_em_critical_section_free());
            self.reset_device_queue();
            if let Some(section) = self.acquire_em_critical_section() {
                return section;
            }
        }
    }

    // =========================================================================
    // DISPATCH PREPARATION
    // =========================================================================

    /// Rewrite the queue header and clear the stack and event pool
    pub fn reset_device_queue(&self) {
        let size = self.queue_buffer.size().as_bytes() as u32;
        let header = [
            QUEUE_HEADER_MAGIC,
            size,
            QUEUE_HEADER_SIZE,
            QUEUE_HEADER_SIZE,
            self.last_task_count.load(Ordering::Acquire),
        ];
        for (i, word) in header.iter().enumerate() {
            self.queue_buffer.write(i * 4, &word.to_le_bytes());
        }
        self.stack_buffer.write(0, &[0u8; 8]);
        self.event_pool_buffer.write(0, &[0u8; 8]);
    }

    /// Stage execution model state for a parent dispatch of `task_count`
    pub fn setup_execution_model_dispatch(
        &self,
        ssh: &mut IndirectHeap,
        dsh: &mut IndirectHeap,
        kernel: &Kernel,
        kernel_count: u32,
        task_count: TaskCount,
    ) -> Result<()> {
        let reflection = kernel
            .reflection_surface()
            .map_or(0, |surface| surface.gpu_addr().raw());

        dsh.align(64)?;
        let mut header = [0u8; 24];
        header[0..4].copy_from_slice(&task_count.to_le_bytes());
        header[4..8].copy_from_slice(&kernel_count.to_le_bytes());
        header[8..12].copy_from_slice(&kernel.id().to_le_bytes());
        header[16..24].copy_from_slice(&reflection.to_le_bytes());
        dsh.push(&header)?;

        let blocks = kernel.program().block_kernel_manager().block_kernel_count();
        ssh.align(64)?;
        ssh.get_space(blocks * BLOCK_SURFACE_STATE_SIZE)?;

        self.last_task_count.store(task_count, Ordering::Release);
        self.queue_buffer.write(16, &task_count.to_le_bytes());
        log::debug!(
            "device queue: execution model setup for task {} ({} kernels, {} blocks)",
            task_count,
            kernel_count,
            blocks
        );
        Ok(())
    }

    /// Encode the scheduler launch into `stream`
    ///
    /// The scheduler cannot be preempted mid-thread; a mid-thread mode is
    /// lowered around its walker and restored after it.
    pub fn dispatch_scheduler(
        &self,
        stream: &mut LinearStream,
        scheduler: &SchedulerKernel,
        preemption_mode: PreemptionMode,
        ssh: &IndirectHeap,
        dsh: &IndirectHeap,
    ) -> Result<()> {
        let lower = preemption_mode == PreemptionMode::MidThread;
        let stall = HwCommand::PipeControl {
            flags: PipeControlFlags::CS_STALL,
            address: GpuAddr::null(),
            data: 0,
        };

        stall.encode(stream)?;
        if lower {
            HwCommand::PreemptionState { mode: PreemptionMode::ThreadGroup.raw() }.encode(stream)?;
        }
        HwCommand::Walker {
            kernel: scheduler.id(),
            descriptor_offset: dsh.used() as u32,
            payload_offset: ssh.used() as u32,
            groups: [scheduler.work_groups(), 1, 1],
        }
        .encode(stream)?;
        if lower {
            HwCommand::PreemptionState { mode: preemption_mode.raw() }.encode(stream)?;
        }
        stall.encode(stream)?;

        self.dispatches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Get the queue buffer
    pub fn queue_buffer(&self) -> &GraphicsAllocation {
        &self.queue_buffer
    }

    /// Get the stack buffer
    pub fn stack_buffer(&self) -> &GraphicsAllocation {
        &self.stack_buffer
    }

    /// Get the event pool buffer
    pub fn event_pool_buffer(&self) -> &GraphicsAllocation {
        &self.event_pool_buffer
    }

    /// Get the second-level batch buffer
    pub fn slb_buffer(&self) -> &GraphicsAllocation {
        &self.slb_buffer
    }

    /// Get the queue storage buffer
    pub fn queue_storage_buffer(&self) -> &GraphicsAllocation {
        &self.queue_storage_buffer
    }

    /// Get the debug queue
    pub fn debug_queue(&self) -> &GraphicsAllocation {
        &self.debug_queue
    }

    /// Task count of the last prepared parent dispatch
    pub fn last_task_count(&self) -> TaskCount {
        self.last_task_count.load(Ordering::Acquire)
    }

    /// Scheduler launches encoded so far
    pub fn scheduler_dispatch_count(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for DeviceQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceQueue")
            .field("queue_buffer", &self.queue_buffer.gpu_addr())
            .field("critical_section_free", &self.is_em_critical_section_free())
            .field("last_task_count", &self.last_task_count())
            .finish()
    }
}

/// Held critical section; released on drop
pub struct EmCriticalSection<'a> {
    queue: &'a DeviceQueue,
}

impl Drop for EmCriticalSection<'_> {
    fn drop(&mut self) {
        self.queue.critical_section.store(false, Ordering::Release);
    }
}

impl fmt::Debug for EmCriticalSection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EmCriticalSection")
    }
}

static_assertions::assert_impl_all!(DeviceQueue: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use alloc::sync::Arc;
    use cinder_mem::AlignedBuffer;
    use std::thread;

    #[test]
    fn test_critical_section_exclusive() {
        let device = testing::device();
        let queue = DeviceQueue::new(device.memory_manager()).unwrap();

        let held = queue.acquire_em_critical_section().unwrap();
        assert!(!queue.is_em_critical_section_free());
        assert!(queue.acquire_em_critical_section().is_none());
        drop(held);
        assert!(queue.is_em_critical_section_free());
    }

    #[test]
    fn test_enter_waits_for_release() {
        let device = testing::device();
        let queue = Arc::new(DeviceQueue::new(device.memory_manager()).unwrap());
        let held = queue.acquire_em_critical_section().unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let _section = queue.enter_em_critical_section();
                queue.last_task_count()
            })
        };
        queue.last_task_count.store(3, Ordering::Release);
        drop(held);
        assert_eq!(waiter.join().unwrap(), 3);
        assert!(queue.is_em_critical_section_free());
    }

    #[test]
    fn test_reset_writes_header() {
        let device = testing::device();
        let queue = DeviceQueue::new(device.memory_manager()).unwrap();
        let mut word = [0u8; 4];
        queue.queue_buffer().read(0, &mut word);
        assert_eq!(u32::from_le_bytes(word), QUEUE_HEADER_MAGIC);
        queue.queue_buffer().read(8, &mut word);
        assert_eq!(u32::from_le_bytes(word), QUEUE_HEADER_SIZE);
    }

    #[test]
    fn test_setup_and_dispatch() {
        let device = testing::device();
        let queue = DeviceQueue::new(device.memory_manager()).unwrap();
        let parent = testing::parent_kernel(&device, 3);
        let scheduler = SchedulerKernel::new(device.memory_manager()).unwrap();
        let [mut dsh, _ioh, mut ssh] = testing::heaps(&device);

        queue
            .setup_execution_model_dispatch(&mut ssh, &mut dsh, &parent, 1, 7)
            .unwrap();
        assert_eq!(queue.last_task_count(), 7);
        assert_eq!(ssh.used(), 3 * BLOCK_SURFACE_STATE_SIZE);

        let mut stream = LinearStream::host(AlignedBuffer::new(256, 64).unwrap());
        queue
            .dispatch_scheduler(&mut stream, &scheduler, PreemptionMode::MidThread, &ssh, &dsh)
            .unwrap();
        let commands = stream.with_contents(crate::encoder::decode).unwrap();
        assert_eq!(commands.len(), 5);
        assert!(commands.contains(&HwCommand::PreemptionState { mode: 3 }));
        assert_eq!(queue.scheduler_dispatch_count(), 1);
    }
}
