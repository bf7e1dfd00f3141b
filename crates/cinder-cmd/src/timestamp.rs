//! # Timestamp Packets
//!
//! Dependency nodes handed out from a shared pool. A node is a small slot in
//! device memory that a flush's trailing pipe control writes; other flushes
//! wait on it with a semaphore.
//!
//! ```text
//! ┌──────────────────────────── TagAllocator ───────────────────────────┐
//! │  allocation: [ slot 0 | slot 1 | slot 2 | ... | slot N-1 ]          │
//! │  free list:  [ 3, 5, ... ]                                          │
//! └─────────────────────────────────────────────────────────────────────┘
//!        ▲ get_tag()                          │ last DependencyNode drop
//!        └────────────────────────────────────┘
//! ```
//!
//! Reference counts are explicit on each slot; the slot returns to the free
//! list exactly once, when the last [`DependencyNode`] handle is dropped.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{fence, AtomicU32, Ordering};

use spin::Mutex;

use cinder_core::{ByteSize, CompletionTag, Error, GpuAddr, Result, TaskCount, OBJECT_NOT_USED};
use cinder_mem::{AllocationFlags, GraphicsAllocation, MemoryManager};

use crate::receiver::ReceiverOwnership;

/// Bytes reserved per node
pub const TIMESTAMP_PACKET_SIZE: u64 = 64;

// =============================================================================
// PACKET SLOT
// =============================================================================

#[derive(Debug)]
struct PacketSlot {
    ref_count: AtomicU32,
    /// Flush whose pipe control writes this slot
    task_count: AtomicU32,
    /// Completion tag of the receiver running that flush
    completion: Mutex<Option<Arc<CompletionTag>>>,
}

impl PacketSlot {
    fn new() -> Self {
        Self {
            ref_count: AtomicU32::new(0),
            task_count: AtomicU32::new(OBJECT_NOT_USED),
            completion: Mutex::new(None),
        }
    }

    fn reset(&self) {
        self.task_count.store(OBJECT_NOT_USED, Ordering::Release);
        *self.completion.lock() = None;
    }
}

// =============================================================================
// TAG ALLOCATOR
// =============================================================================

/// Allocator statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagStats {
    /// Nodes handed out
    pub handed_out: u64,
    /// Nodes returned to the free list
    pub released: u64,
}

/// Pool of dependency nodes backed by one allocation
pub struct TagAllocator {
    allocation: Box<GraphicsAllocation>,
    slots: Vec<PacketSlot>,
    free: Mutex<Vec<usize>>,
    stats: Mutex<TagStats>,
}

impl TagAllocator {
    /// Create a pool of `count` nodes
    pub fn new(memory_manager: &MemoryManager, count: usize) -> Result<Arc<Self>> {
        if count == 0 {
            return Err(Error::InvalidParameter);
        }
        let allocation = memory_manager.allocate_graphics_memory(
            ByteSize::from_bytes(TIMESTAMP_PACKET_SIZE * count as u64),
            AllocationFlags::INTERNAL | AllocationFlags::COHERENT,
        )?;

        Ok(Arc::new(Self {
            allocation,
            slots: (0..count).map(|_| PacketSlot::new()).collect(),
            // Popped from the back, so lower slots are handed out first
            free: Mutex::new((0..count).rev().collect()),
            stats: Mutex::new(TagStats::default()),
        }))
    }

    /// Hand out a node with a reference count of one
    pub fn get_tag(self: &Arc<Self>) -> Result<DependencyNode> {
        let index = self.free.lock().pop().ok_or(Error::TagPoolExhausted)?;
        let slot = &self.slots[index];
        slot.reset();
        slot.ref_count.store(1, Ordering::Release);
        self.stats.lock().handed_out += 1;

        log::trace!("tag allocator: node {} handed out", index);
        Ok(DependencyNode {
            allocator: Arc::clone(self),
            index,
        })
    }

    /// Get the backing allocation
    pub fn graphics_allocation(&self) -> &GraphicsAllocation {
        &self.allocation
    }

    /// Nodes currently on the free list
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Total nodes
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> TagStats {
        *self.stats.lock()
    }

    fn release(&self, index: usize) {
        self.slots[index].reset();
        self.free.lock().push(index);
        self.stats.lock().released += 1;
        log::trace!("tag allocator: node {} released", index);
    }
}

impl fmt::Debug for TagAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagAllocator")
            .field("allocation", &self.allocation.id())
            .field("capacity", &self.slots.len())
            .field("free", &self.free_count())
            .finish()
    }
}

// =============================================================================
// DEPENDENCY NODE
// =============================================================================

/// Counted handle to a pooled node
pub struct DependencyNode {
    allocator: Arc<TagAllocator>,
    index: usize,
}

impl DependencyNode {
    fn slot(&self) -> &PacketSlot {
        &self.allocator.slots[self.index]
    }

    /// Slot index in the owning pool
    pub fn index(&self) -> usize {
        self.index
    }

    /// Device address written when the node completes
    pub fn gpu_addr(&self) -> GpuAddr {
        self.allocator
            .allocation
            .gpu_addr()
            .offset(self.index as u64 * TIMESTAMP_PACKET_SIZE)
    }

    /// Current number of handles
    pub fn ref_count(&self) -> u32 {
        self.slot().ref_count.load(Ordering::Acquire)
    }

    /// Bind the node to the flush `task_count` signalled through `tag`
    pub fn assign(&self, task_count: TaskCount, tag: Arc<CompletionTag>) {
        let slot = self.slot();
        *slot.completion.lock() = Some(tag);
        slot.task_count.store(task_count, Ordering::Release);
    }

    /// Task count of the flush that writes the node
    pub fn task_count(&self) -> TaskCount {
        self.slot().task_count.load(Ordering::Acquire)
    }

    /// Check if the writing flush has completed
    pub fn is_completed(&self) -> bool {
        let task_count = self.task_count();
        if task_count == OBJECT_NOT_USED {
            return false;
        }
        self.slot()
            .completion
            .lock()
            .as_ref()
            .map_or(false, |tag| tag.is_reached(task_count))
    }

    /// Get the allocator this node belongs to
    pub fn allocator(&self) -> &Arc<TagAllocator> {
        &self.allocator
    }
}

impl Clone for DependencyNode {
    fn clone(&self) -> Self {
        self.slot().ref_count.fetch_add(1, Ordering::Relaxed);
        Self {
            allocator: Arc::clone(&self.allocator),
            index: self.index,
        }
    }
}

impl Drop for DependencyNode {
    fn drop(&mut self) {
        if self.slot().ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);
        self.allocator.release(self.index);
    }
}

impl fmt::Debug for DependencyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyNode")
            .field("index", &self.index)
            .field("gpu_addr", &self.gpu_addr())
            .field("refs", &self.ref_count())
            .finish()
    }
}

// =============================================================================
// DEPENDENCY CONTAINER
// =============================================================================

/// Ordered collection of dependency nodes
#[derive(Debug, Default, Clone)]
pub struct DependencyContainer {
    nodes: Vec<DependencyNode>,
}

impl DependencyContainer {
    /// Create an empty container
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `node`
    pub fn add(&mut self, node: DependencyNode) {
        self.nodes.push(node);
    }

    /// Append a counted reference to every node of `other`
    pub fn assign_and_increment_refs(&mut self, other: &DependencyContainer) {
        self.nodes.extend(other.nodes.iter().cloned());
    }

    /// Get node at `index`
    pub fn peek(&self, index: usize) -> Option<&DependencyNode> {
        self.nodes.get(index)
    }

    /// Iterate nodes
    pub fn iter(&self) -> impl Iterator<Item = &DependencyNode> {
        self.nodes.iter()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop every held reference
    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Make the storage of every node resident
    pub fn make_resident(&self, csr: &mut ReceiverOwnership<'_>) {
        for node in &self.nodes {
            csr.make_resident(node.allocator().graphics_allocation());
        }
    }
}

static_assertions::assert_impl_all!(DependencyNode: Send, Sync);
static_assertions::assert_impl_all!(TagAllocator: Send, Sync);
