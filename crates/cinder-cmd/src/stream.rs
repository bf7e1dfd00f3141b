//! # Linear Streams
//!
//! Append-only command buffers. A stream is either a private host buffer
//! (an operation bundle's staging stream) or backed by a graphics allocation
//! the engine can fetch from (queue streams, receiver rings).

use alloc::boxed::Box;

use cinder_core::{Error, GpuAddr, Result};
use cinder_mem::{AlignedBuffer, GraphicsAllocation};

/// Storage behind a [`LinearStream`]
#[derive(Debug)]
pub enum StreamBacking {
    /// Host-only memory, never fetched by the engine directly
    Host(AlignedBuffer),
    /// Device-visible memory
    Device(Box<GraphicsAllocation>),
}

impl StreamBacking {
    fn len(&self) -> usize {
        match self {
            StreamBacking::Host(buffer) => buffer.len(),
            StreamBacking::Device(allocation) => allocation.size().as_usize(),
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            StreamBacking::Host(buffer) => buffer.as_mut_slice(),
            StreamBacking::Device(allocation) => allocation.bytes_mut(),
        }
    }
}

/// Append-only command buffer
#[derive(Debug)]
pub struct LinearStream {
    backing: StreamBacking,
    used: usize,
}

impl LinearStream {
    /// Create a stream over `backing`
    pub fn new(backing: StreamBacking) -> Self {
        Self { backing, used: 0 }
    }

    /// Create a host-only stream
    pub fn host(buffer: AlignedBuffer) -> Self {
        Self::new(StreamBacking::Host(buffer))
    }

    /// Create a device-visible stream
    pub fn device(allocation: Box<GraphicsAllocation>) -> Self {
        Self::new(StreamBacking::Device(allocation))
    }

    /// Reserve `size` bytes and return them for writing
    pub fn get_space(&mut self, size: usize) -> Result<&mut [u8]> {
        if size > self.available() {
            return Err(Error::CommandBufferFull);
        }
        let start = self.used;
        self.used += size;
        Ok(&mut self.backing.bytes_mut()[start..start + size])
    }

    /// Append `data`, returning its offset
    pub fn append(&mut self, data: &[u8]) -> Result<usize> {
        let offset = self.used;
        self.get_space(data.len())?.copy_from_slice(data);
        Ok(offset)
    }

    /// Append one little-endian dword
    pub fn emit_dword(&mut self, dword: u32) -> Result<()> {
        self.get_space(4)?.copy_from_slice(&dword.to_le_bytes());
        Ok(())
    }

    /// Bytes written
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total capacity
    pub fn capacity(&self) -> usize {
        self.backing.len()
    }

    /// Bytes still available
    pub fn available(&self) -> usize {
        self.capacity() - self.used
    }

    /// Rewind to the start; previous contents are overwritten by new writes
    pub fn reset(&mut self) {
        self.used = 0;
    }

    /// Run `f` over the written bytes
    pub fn with_contents<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match &self.backing {
            StreamBacking::Host(buffer) => f(&buffer.as_slice()[..self.used]),
            StreamBacking::Device(allocation) => allocation.with_bytes(|b| f(&b[..self.used])),
        }
    }

    /// Device address of the stream start, null for host streams
    pub fn gpu_base(&self) -> GpuAddr {
        match &self.backing {
            StreamBacking::Host(_) => GpuAddr::null(),
            StreamBacking::Device(allocation) => allocation.gpu_addr(),
        }
    }

    /// Get the backing allocation of a device stream
    pub fn graphics_allocation(&self) -> Option<&GraphicsAllocation> {
        match &self.backing {
            StreamBacking::Host(_) => None,
            StreamBacking::Device(allocation) => Some(allocation),
        }
    }

    /// Swap in a new backing store, returning the old one
    pub fn replace_buffer(&mut self, backing: StreamBacking) -> StreamBacking {
        self.used = 0;
        core::mem::replace(&mut self.backing, backing)
    }

    /// Release the stream, returning its backing store
    pub fn into_backing(self) -> StreamBacking {
        self.backing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_stream(size: usize) -> LinearStream {
        LinearStream::host(AlignedBuffer::new(size, 64).unwrap())
    }

    #[test]
    fn test_append_and_read_back() {
        let mut s = host_stream(16);
        assert_eq!(s.append(&[1, 2, 3]).unwrap(), 0);
        s.emit_dword(0xAABB_CCDD).unwrap();
        assert_eq!(s.used(), 7);
        s.with_contents(|b| assert_eq!(b, &[1, 2, 3, 0xDD, 0xCC, 0xBB, 0xAA]));
        assert!(s.gpu_base().is_null());
    }

    #[test]
    fn test_full_stream_rejects_writes() {
        let mut s = host_stream(8);
        s.get_space(8).unwrap();
        assert_eq!(s.emit_dword(0).unwrap_err(), Error::CommandBufferFull);
        assert_eq!(s.used(), 8);
    }

    #[test]
    fn test_replace_buffer_rewinds() {
        let mut s = host_stream(8);
        s.get_space(4).unwrap();
        let old = s.replace_buffer(StreamBacking::Host(AlignedBuffer::new(32, 64).unwrap()));
        assert!(matches!(old, StreamBacking::Host(ref b) if b.len() == 8));
        assert_eq!(s.used(), 0);
        assert_eq!(s.capacity(), 32);
    }
}
