//! # Indirect Heaps
//!
//! Linear staging buffers for per-dispatch state. A heap only grows while a
//! dispatch is being staged; space is never handed back.

use alloc::boxed::Box;

use cinder_core::{ByteSize, Error, GpuAddr, Result};

use crate::allocation::GraphicsAllocation;

// =============================================================================
// HEAP TYPES
// =============================================================================

/// Kind of state staged in a heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// Dynamic state (sampler state, interface descriptors, curbe)
    DynamicState,
    /// Indirect objects (cross-thread data)
    IndirectObject,
    /// Surface state and binding tables
    SurfaceState,
}

impl HeapType {
    /// All heap types, in flush argument order
    pub const ALL: [HeapType; 3] = [
        HeapType::DynamicState,
        HeapType::IndirectObject,
        HeapType::SurfaceState,
    ];

    /// Index into per-type arrays
    pub const fn index(self) -> usize {
        match self {
            HeapType::DynamicState => 0,
            HeapType::IndirectObject => 1,
            HeapType::SurfaceState => 2,
        }
    }

    /// Required alignment of heap bases
    pub const fn base_alignment(self) -> u64 {
        match self {
            HeapType::SurfaceState => 64 * 1024,
            _ => 4096,
        }
    }
}

// =============================================================================
// INDIRECT HEAP
// =============================================================================

/// A linearly growing staging buffer backed by a graphics allocation
#[derive(Debug)]
pub struct IndirectHeap {
    /// Heap type
    heap_type: HeapType,
    /// Backing allocation
    allocation: Box<GraphicsAllocation>,
    /// Bytes handed out so far
    used: usize,
}

impl IndirectHeap {
    /// Create a heap over `allocation`
    pub fn new(heap_type: HeapType, allocation: Box<GraphicsAllocation>) -> Self {
        Self {
            heap_type,
            allocation,
            used: 0,
        }
    }

    /// Get heap type
    pub fn heap_type(&self) -> HeapType {
        self.heap_type
    }

    /// Reserve `size` bytes, returning their offset
    pub fn get_space(&mut self, size: usize) -> Result<usize> {
        if size > self.available() {
            return Err(Error::HeapExhausted);
        }
        let offset = self.used;
        self.used += size;
        Ok(offset)
    }

    /// Reserve space and copy `data` into it
    pub fn push(&mut self, data: &[u8]) -> Result<usize> {
        let offset = self.get_space(data.len())?;
        self.allocation.bytes_mut()[offset..offset + data.len()].copy_from_slice(data);
        Ok(offset)
    }

    /// Align the write offset up to `alignment`
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidAlignment);
        }
        let aligned = (self.used + alignment - 1) & !(alignment - 1);
        if aligned > self.capacity() {
            return Err(Error::HeapExhausted);
        }
        self.used = aligned;
        Ok(())
    }

    /// Bytes handed out
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total capacity
    pub fn capacity(&self) -> usize {
        self.allocation.size().as_usize()
    }

    /// Bytes still available
    pub fn available(&self) -> usize {
        self.capacity() - self.used
    }

    /// Device address of the heap base
    pub fn gpu_base(&self) -> GpuAddr {
        self.allocation.gpu_addr()
    }

    /// Heap size as programmed into state base address
    pub fn heap_size(&self) -> ByteSize {
        self.allocation.size()
    }

    /// Get the backing allocation
    pub fn graphics_allocation(&self) -> &GraphicsAllocation {
        &self.allocation
    }

    /// Read staged bytes
    pub fn contents(&self, offset: usize, dst: &mut [u8]) -> usize {
        self.allocation.read(offset, dst)
    }

    /// Release the heap, returning its backing allocation
    pub fn into_allocation(self) -> Box<GraphicsAllocation> {
        self.allocation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aligned::AlignedBuffer;
    use crate::allocation::AllocationFlags;
    use cinder_core::AllocationId;

    fn heap(size: usize) -> IndirectHeap {
        IndirectHeap::new(
            HeapType::DynamicState,
            Box::new(GraphicsAllocation::new(
                AllocationId::new(1),
                GpuAddr::new(0x20000),
                AlignedBuffer::new(size, 4096).unwrap(),
                AllocationFlags::INTERNAL,
            )),
        )
    }

    #[test]
    fn test_linear_growth() {
        let mut h = heap(256);
        assert_eq!(h.push(&[1, 2, 3]).unwrap(), 0);
        assert_eq!(h.get_space(10).unwrap(), 3);
        assert_eq!(h.used(), 13);
        h.align(64).unwrap();
        assert_eq!(h.used(), 64);
        assert_eq!(h.available(), 192);

        let mut out = [0u8; 3];
        h.contents(0, &mut out);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_exhaustion() {
        let mut h = heap(32);
        assert!(h.get_space(32).is_ok());
        assert_eq!(h.get_space(1).unwrap_err(), Error::HeapExhausted);
        // A failed request leaves the offset unchanged
        assert_eq!(h.used(), 32);
    }

    #[test]
    fn test_into_allocation_keeps_identity() {
        let h = heap(64);
        let id = h.graphics_allocation().id();
        assert_eq!(h.into_allocation().id(), id);
        assert_eq!(HeapType::SurfaceState.index(), 2);
    }
}
