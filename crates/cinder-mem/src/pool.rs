//! # Allocation Reuse Pool
//!
//! Released allocations are stored here instead of being freed, so the next
//! dispatch can pick them up without a fresh device allocation.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

use cinder_core::{ByteSize, TaskCount};

use crate::allocation::GraphicsAllocation;

// =============================================================================
// USAGE CATEGORIES
// =============================================================================

/// How a stored allocation may be used again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationUsage {
    /// Handed out again by [`AllocationPool::reuse_allocation`]
    Reusable,
    /// Freed once the work that used it has completed
    Temporary,
}

// =============================================================================
// POOL STATISTICS
// =============================================================================

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Allocations stored for reuse
    pub stored: u64,
    /// Allocations stored as temporary
    pub stored_temporary: u64,
    /// Successful reuses
    pub reused: u64,
    /// Reuse requests that found nothing
    pub misses: u64,
    /// Temporary allocations released after completion
    pub released_temporary: u64,
}

// =============================================================================
// ALLOCATION POOL
// =============================================================================

/// Shared store of released allocations
///
/// Every list has its own lock: stores happen from command destructors and
/// may race with allocation requests on other threads.
#[derive(Debug, Default)]
pub struct AllocationPool {
    reusable: Mutex<Vec<Box<GraphicsAllocation>>>,
    temporary: Mutex<Vec<Box<GraphicsAllocation>>>,
    stats: Mutex<PoolStats>,
}

impl AllocationPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a released allocation
    pub fn store_allocation(&self, allocation: Box<GraphicsAllocation>, usage: AllocationUsage) {
        allocation.clear_resident();
        log::trace!(
            "pool: store {:?} ({}) as {:?}",
            allocation.id(),
            allocation.size(),
            usage
        );

        match usage {
            AllocationUsage::Reusable => {
                self.reusable.lock().push(allocation);
                self.stats.lock().stored += 1;
            }
            AllocationUsage::Temporary => {
                self.temporary.lock().push(allocation);
                self.stats.lock().stored_temporary += 1;
            }
        }
    }

    /// Hand out a stored allocation of at least `min_size` whose last use
    /// has completed
    pub fn reuse_allocation(
        &self,
        min_size: ByteSize,
        completed: TaskCount,
    ) -> Option<Box<GraphicsAllocation>> {
        let found = {
            let mut list = self.reusable.lock();
            list.iter()
                .position(|a| a.size() >= min_size && !a.is_busy(completed))
                .map(|index| list.swap_remove(index))
        };

        let mut stats = self.stats.lock();
        match &found {
            Some(allocation) => {
                stats.reused += 1;
                log::trace!("pool: reuse {:?}", allocation.id());
            }
            None => stats.misses += 1,
        }
        found
    }

    /// Remove temporary allocations whose work has completed
    pub fn clean_temporary(&self, completed: TaskCount) -> Vec<Box<GraphicsAllocation>> {
        let mut list = self.temporary.lock();
        let mut released = Vec::new();
        let mut i = 0;

        while i < list.len() {
            if list[i].is_busy(completed) {
                i += 1;
            } else {
                released.push(list.swap_remove(i));
            }
        }
        drop(list);

        self.stats.lock().released_temporary += released.len() as u64;
        released
    }

    /// Number of allocations waiting for reuse
    pub fn reusable_count(&self) -> usize {
        self.reusable.lock().len()
    }

    /// Number of temporary allocations still in flight
    pub fn temporary_count(&self) -> usize {
        self.temporary.lock().len()
    }

    /// Check if a specific allocation is stored for reuse
    pub fn contains(&self, id: cinder_core::AllocationId) -> bool {
        self.reusable.lock().iter().any(|a| a.id() == id)
    }

    /// Snapshot of pool statistics
    pub fn stats(&self) -> PoolStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aligned::AlignedBuffer;
    use crate::allocation::AllocationFlags;
    use alloc::sync::Arc;
    use cinder_core::{AllocationId, GpuAddr};
    use std::thread;

    fn allocation(id: u64, size: usize) -> Box<GraphicsAllocation> {
        Box::new(GraphicsAllocation::new(
            AllocationId::new(id),
            GpuAddr::new(id * 0x10000),
            AlignedBuffer::new(size, 64).unwrap(),
            AllocationFlags::empty(),
        ))
    }

    #[test]
    fn test_reuse_respects_size() {
        let pool = AllocationPool::new();
        pool.store_allocation(allocation(1, 64), AllocationUsage::Reusable);
        pool.store_allocation(allocation(2, 4096), AllocationUsage::Reusable);

        let got = pool.reuse_allocation(ByteSize::from_bytes(1000), 0).unwrap();
        assert_eq!(got.id(), AllocationId::new(2));
        assert!(pool.reuse_allocation(ByteSize::from_bytes(1000), 0).is_none());

        let stats = pool.stats();
        assert_eq!(stats.stored, 2);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_busy_allocation_not_reused() {
        let pool = AllocationPool::new();
        let a = allocation(1, 64);
        a.update_task_count(10);
        pool.store_allocation(a, AllocationUsage::Reusable);

        assert!(pool.reuse_allocation(ByteSize::from_bytes(64), 9).is_none());
        assert!(pool.reuse_allocation(ByteSize::from_bytes(64), 10).is_some());
    }

    #[test]
    fn test_clean_temporary() {
        let pool = AllocationPool::new();
        let a = allocation(1, 64);
        a.update_task_count(3);
        let b = allocation(2, 64);
        b.update_task_count(7);
        pool.store_allocation(a, AllocationUsage::Temporary);
        pool.store_allocation(b, AllocationUsage::Temporary);

        let released = pool.clean_temporary(5);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id(), AllocationId::new(1));
        assert_eq!(pool.temporary_count(), 1);
    }

    #[test]
    fn test_concurrent_store_and_reuse() {
        let pool = Arc::new(AllocationPool::new());
        let workers: Vec<_> = (0..8u64)
            .map(|t| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for i in 0..50u64 {
                        pool.store_allocation(allocation(t * 100 + i + 1, 64), AllocationUsage::Reusable);
                        let _ = pool.reuse_allocation(ByteSize::from_bytes(64), 0);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.stored, 400);
        assert_eq!(stats.reused + stats.misses, 400);
        assert_eq!(pool.reusable_count() as u64, stats.stored - stats.reused);
    }
}
