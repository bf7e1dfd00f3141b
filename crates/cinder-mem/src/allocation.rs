//! # Graphics Allocations
//!
//! A block of device-visible memory with a host-side backing store.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use cinder_core::{AllocationId, ByteSize, GpuAddr, TaskCount, OBJECT_NOT_USED};

use crate::aligned::AlignedBuffer;

bitflags::bitflags! {
    /// Allocation property flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocationFlags: u32 {
        /// Host and device views are coherent without cache flushes
        const COHERENT = 1 << 0;
        /// Host pointer and device storage are the same memory
        const ZERO_COPY = 1 << 1;
        /// Owned by the driver (heaps, rings, scheduler buffers)
        const INTERNAL = 1 << 2;
    }
}

/// A device-visible memory block
///
/// The host backing is behind a lock so the same allocation can be read by
/// the engine and written by post-flush transfers; exclusive owners reach it
/// without locking through [`GraphicsAllocation::bytes_mut`].
#[derive(Debug)]
pub struct GraphicsAllocation {
    /// Unique ID
    id: AllocationId,
    /// GPU address
    gpu_addr: GpuAddr,
    /// Size
    size: ByteSize,
    /// Property flags
    flags: AllocationFlags,
    /// Host backing store
    storage: Mutex<AlignedBuffer>,
    /// Task count of the last flush that used this allocation
    task_count: AtomicU32,
    /// Task count for which the allocation is currently in a residency list
    residency_task_count: AtomicU32,
    /// Live-byte counter of the owning memory manager
    accounting: Option<Arc<AtomicU64>>,
}

impl GraphicsAllocation {
    /// Wrap a backing buffer
    pub fn new(
        id: AllocationId,
        gpu_addr: GpuAddr,
        storage: AlignedBuffer,
        flags: AllocationFlags,
    ) -> Self {
        Self {
            id,
            gpu_addr,
            size: ByteSize::from_bytes(storage.len() as u64),
            flags,
            storage: Mutex::new(storage),
            task_count: AtomicU32::new(OBJECT_NOT_USED),
            residency_task_count: AtomicU32::new(OBJECT_NOT_USED),
            accounting: None,
        }
    }

    /// Charge the allocation's size to `counter` until it is dropped
    pub fn with_accounting(self, counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(self.size.as_bytes(), Ordering::AcqRel);
        self.charged_to(counter)
    }

    /// Attach a counter the size was already added to
    pub(crate) fn charged_to(mut self, counter: Arc<AtomicU64>) -> Self {
        self.accounting = Some(counter);
        self
    }

    /// Get allocation ID
    pub fn id(&self) -> AllocationId {
        self.id
    }

    /// Get GPU address
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// Get size
    pub fn size(&self) -> ByteSize {
        self.size
    }

    /// Get flags
    pub fn flags(&self) -> AllocationFlags {
        self.flags
    }

    /// Check coherency
    pub fn is_coherent(&self) -> bool {
        self.flags.contains(AllocationFlags::COHERENT)
    }

    /// Copy bytes out of the allocation
    ///
    /// Reads past the end are truncated; returns the number of bytes copied.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> usize {
        let storage = self.storage.lock();
        let src = storage.as_slice();
        if offset >= src.len() {
            return 0;
        }
        let len = dst.len().min(src.len() - offset);
        dst[..len].copy_from_slice(&src[offset..offset + len]);
        len
    }

    /// Copy bytes into the allocation
    ///
    /// Writes past the end are truncated; returns the number of bytes copied.
    pub fn write(&self, offset: usize, src: &[u8]) -> usize {
        let mut storage = self.storage.lock();
        let dst = storage.as_mut_slice();
        if offset >= dst.len() {
            return 0;
        }
        let len = src.len().min(dst.len() - offset);
        dst[offset..offset + len].copy_from_slice(&src[..len]);
        len
    }

    /// Run `f` over the backing bytes
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.storage.lock().as_slice())
    }

    /// Exclusive access to the backing bytes
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.storage.get_mut().as_mut_slice()
    }

    /// Task count of the last flush using this allocation
    pub fn task_count(&self) -> TaskCount {
        self.task_count.load(Ordering::Acquire)
    }

    /// Record use by the flush identified by `task_count`
    pub fn update_task_count(&self, task_count: TaskCount) {
        self.task_count.store(task_count, Ordering::Release);
    }

    /// Check if the allocation is still referenced by unfinished work
    pub fn is_busy(&self, completed: TaskCount) -> bool {
        let used = self.task_count();
        used != OBJECT_NOT_USED && used > completed
    }

    /// Mark as resident for `task_count`; false if already marked for it
    pub fn mark_resident(&self, task_count: TaskCount) -> bool {
        self.residency_task_count.swap(task_count, Ordering::AcqRel) != task_count
    }

    /// Drop the residency mark
    pub fn clear_resident(&self) {
        self.residency_task_count
            .store(OBJECT_NOT_USED, Ordering::Release);
    }

    /// Check residency for `task_count`
    pub fn is_resident(&self, task_count: TaskCount) -> bool {
        self.residency_task_count.load(Ordering::Acquire) == task_count
    }
}

impl Drop for GraphicsAllocation {
    fn drop(&mut self) {
        if let Some(counter) = &self.accounting {
            counter.fetch_sub(self.size.as_bytes(), Ordering::AcqRel);
        }
    }
}

static_assertions::assert_impl_all!(GraphicsAllocation: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation(size: usize) -> GraphicsAllocation {
        GraphicsAllocation::new(
            AllocationId::new(1),
            GpuAddr::new(0x10000),
            AlignedBuffer::new(size, 64).unwrap(),
            AllocationFlags::empty(),
        )
    }

    #[test]
    fn test_read_write_truncates() {
        let alloc = allocation(8);
        assert_eq!(alloc.write(4, &[1, 2, 3, 4, 5, 6]), 4);
        let mut out = [0u8; 8];
        assert_eq!(alloc.read(0, &mut out), 8);
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(alloc.read(8, &mut out), 0);
    }

    #[test]
    fn test_task_count_tracking() {
        let alloc = allocation(16);
        assert!(!alloc.is_busy(0));
        alloc.update_task_count(5);
        assert!(alloc.is_busy(4));
        assert!(!alloc.is_busy(5));
    }

    #[test]
    fn test_accounting_released_on_drop() {
        let counter = Arc::new(AtomicU64::new(0));
        let alloc = allocation(32).with_accounting(Arc::clone(&counter));
        assert_eq!(counter.load(Ordering::Acquire), 32);
        drop(alloc);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_residency_marking() {
        let alloc = allocation(16);
        assert!(alloc.mark_resident(3));
        assert!(!alloc.mark_resident(3));
        assert!(alloc.is_resident(3));
        alloc.clear_resident();
        assert!(!alloc.is_resident(3));
    }
}
