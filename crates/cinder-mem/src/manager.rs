//! # Memory Manager
//!
//! Creates graphics allocations, assigns device addresses and routes
//! released blocks into the reuse pool.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use cinder_core::{AllocationId, ByteSize, Error, GpuAddr, Result, TaskCount};

use crate::aligned::AlignedBuffer;
use crate::allocation::{AllocationFlags, GraphicsAllocation};
use crate::pool::{AllocationPool, AllocationUsage};

/// Base of the device virtual range handed out by the manager
const GPU_VA_BASE: u64 = 0x0001_0000_0000;

/// Granularity of device address assignment
const GPU_VA_ALIGNMENT: u64 = 64 * 1024;

/// Alignment of allocation backing stores
pub const ALLOCATION_ALIGNMENT: usize = 4096;

/// Device memory manager
#[derive(Debug)]
pub struct MemoryManager {
    /// Reuse pool shared by every command on the device
    pool: AllocationPool,
    /// Next allocation ID
    next_id: AtomicU64,
    /// Next device virtual address
    next_gpu_addr: AtomicU64,
    /// Bytes currently held by live allocations, released as they drop
    live_bytes: Arc<AtomicU64>,
    /// Upper bound on live bytes
    capacity: ByteSize,
}

impl MemoryManager {
    /// Create a manager able to hold `capacity` bytes
    pub fn new(capacity: ByteSize) -> Self {
        Self {
            pool: AllocationPool::new(),
            next_id: AtomicU64::new(1),
            next_gpu_addr: AtomicU64::new(GPU_VA_BASE),
            live_bytes: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    /// Allocate fresh device memory
    pub fn allocate_graphics_memory(
        &self,
        size: ByteSize,
        flags: AllocationFlags,
    ) -> Result<Box<GraphicsAllocation>> {
        if size == ByteSize::ZERO {
            return Err(Error::InvalidParameter);
        }

        let bytes = size.as_bytes();
        let reserved = self.live_bytes.fetch_add(bytes, Ordering::AcqRel);
        if reserved + bytes > self.capacity.as_bytes() {
            self.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
            log::warn!("device memory exhausted: {} requested, {} live", size, reserved);
            return Err(Error::OutOfMemory);
        }

        let storage = match AlignedBuffer::new(size.as_usize(), ALLOCATION_ALIGNMENT) {
            Ok(storage) => storage,
            Err(e) => {
                self.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
                return Err(e);
            }
        };

        let span = size.align_up(GPU_VA_ALIGNMENT).as_bytes();
        let gpu_addr = GpuAddr::new(self.next_gpu_addr.fetch_add(span, Ordering::Relaxed));
        let id = AllocationId::new(self.next_id.fetch_add(1, Ordering::Relaxed));

        log::debug!("allocate {:?} {} at {}", id, size, gpu_addr);
        Ok(Box::new(
            GraphicsAllocation::new(id, gpu_addr, storage, flags)
                .charged_to(Arc::clone(&self.live_bytes)),
        ))
    }

    /// Reuse a pooled allocation when one fits, otherwise allocate fresh
    pub fn obtain_reusable_allocation(
        &self,
        size: ByteSize,
        completed: TaskCount,
        flags: AllocationFlags,
    ) -> Result<Box<GraphicsAllocation>> {
        if let Some(allocation) = self.pool.reuse_allocation(size, completed) {
            return Ok(allocation);
        }
        self.allocate_graphics_memory(size, flags)
    }

    /// Return an allocation for later reuse or deferred release
    pub fn store_allocation(&self, allocation: Box<GraphicsAllocation>, usage: AllocationUsage) {
        self.pool.store_allocation(allocation, usage);
    }

    /// Release an allocation immediately
    pub fn free_graphics_memory(&self, allocation: Box<GraphicsAllocation>) {
        log::debug!("free {:?} {}", allocation.id(), allocation.size());
        drop(allocation);
    }

    /// Free temporary allocations whose work has completed
    pub fn clean_temporary_allocations(&self, completed: TaskCount) -> usize {
        let released = self.pool.clean_temporary(completed);
        let count = released.len();
        for allocation in released {
            self.free_graphics_memory(allocation);
        }
        count
    }

    /// Alignment-aware host allocator for command buffers
    pub fn aligned_buffer(&self, size: usize, alignment: usize) -> Result<AlignedBuffer> {
        AlignedBuffer::new(size, alignment)
    }

    /// Release a buffer obtained from [`MemoryManager::aligned_buffer`]
    pub fn aligned_free(&self, buffer: AlignedBuffer) {
        drop(buffer);
    }

    /// Get the reuse pool
    pub fn pool(&self) -> &AllocationPool {
        &self.pool
    }

    /// Bytes held by live allocations (pooled ones included)
    pub fn live_bytes(&self) -> ByteSize {
        ByteSize::from_bytes(self.live_bytes.load(Ordering::Acquire))
    }

    /// Capacity
    pub fn capacity(&self) -> ByteSize {
        self.capacity
    }
}
