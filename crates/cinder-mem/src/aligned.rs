//! # Aligned Host Buffers
//!
//! Zeroed, explicitly aligned host memory. Backs graphics allocations and
//! the private command buffers of operation bundles.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::fmt;
use core::ptr::NonNull;

use cinder_core::{Error, Result};

/// Heap memory with a caller-chosen alignment
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl AlignedBuffer {
    /// Allocate `len` zeroed bytes aligned to `alignment`
    pub fn new(len: usize, alignment: usize) -> Result<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidAlignment);
        }

        // Zero-length buffers still get a real block so the base address is
        // stable and aligned.
        let layout =
            Layout::from_size_align(len.max(1), alignment).map_err(|_| Error::InvalidParameter)?;

        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(Error::OutOfMemory)?;

        Ok(Self { ptr, len, layout })
    }

    /// Usable length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the buffer has no usable bytes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Alignment of the base address
    #[inline]
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Base address (for alignment checks and diagnostics)
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// View contents
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialized (zeroed) bytes for the
        // lifetime of self
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// View contents mutably
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("alignment", &self.layout.align())
            .finish()
    }
}

// SAFETY: the buffer uniquely owns its memory; shared access is read-only
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}
