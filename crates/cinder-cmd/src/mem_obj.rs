//! # Memory Objects
//!
//! User-visible buffers. A zero-copy object's host view is its device
//! storage. Any other object keeps a separate host copy that map and unmap
//! synchronize explicitly.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use cinder_core::{ByteSize, Result};
use cinder_mem::{AllocationFlags, GraphicsAllocation};

use crate::device::Device;
use crate::receiver::ReceiverOwnership;

/// Per-dimension sizes and offsets of a transfer region
pub type MemObjSizeArray = [usize; 3];

/// A buffer visible to kernels and to the host
#[derive(Debug)]
pub struct MemObj {
    allocation: Box<GraphicsAllocation>,
    /// Host copy, absent for zero-copy objects
    host_copy: Option<Mutex<Vec<u8>>>,
    size: usize,
    to_host_transfers: AtomicU32,
    from_host_transfers: AtomicU32,
}

impl MemObj {
    /// Create a buffer of `size` bytes
    ///
    /// Zero-copy is granted when requested unless the device disables it.
    pub fn create_buffer(device: &Device, size: usize, request_zero_copy: bool) -> Result<Arc<Self>> {
        let zero_copy = request_zero_copy && !device.settings().disable_zero_copy;
        let flags = if zero_copy {
            AllocationFlags::ZERO_COPY | AllocationFlags::COHERENT
        } else {
            AllocationFlags::empty()
        };
        let allocation = device
            .memory_manager()
            .allocate_graphics_memory(ByteSize::from_bytes(size as u64), flags)?;

        Ok(Arc::new(Self {
            allocation,
            host_copy: (!zero_copy).then(|| Mutex::new(vec![0u8; size])),
            size,
            to_host_transfers: AtomicU32::new(0),
            from_host_transfers: AtomicU32::new(0),
        }))
    }

    /// Check if host and device share storage
    pub fn is_mem_obj_zero_copy(&self) -> bool {
        self.host_copy.is_none()
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the device storage
    pub fn graphics_allocation(&self) -> &GraphicsAllocation {
        &self.allocation
    }

    /// Make the device storage resident
    pub fn make_resident(&self, csr: &mut ReceiverOwnership<'_>) {
        csr.make_resident(&self.allocation);
    }

    /// Copy a region from device storage into the host copy
    pub fn transfer_data_to_host_ptr(&self, copy_size: MemObjSizeArray, copy_offset: MemObjSizeArray) {
        let Some(host) = &self.host_copy else {
            return;
        };
        let (start, len) = self.region(copy_size, copy_offset);
        let mut host = host.lock();
        self.allocation.read(start, &mut host[start..start + len]);
        self.to_host_transfers.fetch_add(1, Ordering::Relaxed);
        log::trace!("mem obj {:?}: {} bytes to host at {}", self.allocation.id(), len, start);
    }

    /// Copy a region from the host copy into device storage
    pub fn transfer_data_from_host_ptr(&self, copy_size: MemObjSizeArray, copy_offset: MemObjSizeArray) {
        let Some(host) = &self.host_copy else {
            return;
        };
        let (start, len) = self.region(copy_size, copy_offset);
        let host = host.lock();
        self.allocation.write(start, &host[start..start + len]);
        self.from_host_transfers.fetch_add(1, Ordering::Relaxed);
        log::trace!("mem obj {:?}: {} bytes from host at {}", self.allocation.id(), len, start);
    }

    /// Read through the host view
    pub fn host_read(&self, offset: usize, dst: &mut [u8]) -> usize {
        match &self.host_copy {
            None => self.allocation.read(offset, dst),
            Some(host) => copy_clamped(&host.lock(), offset, dst),
        }
    }

    /// Write through the host view
    pub fn host_write(&self, offset: usize, src: &[u8]) -> usize {
        match &self.host_copy {
            None => self.allocation.write(offset, src),
            Some(host) => {
                let mut host = host.lock();
                if offset >= host.len() {
                    return 0;
                }
                let len = src.len().min(host.len() - offset);
                host[offset..offset + len].copy_from_slice(&src[..len]);
                len
            }
        }
    }

    /// Device-to-host transfers performed
    pub fn to_host_transfer_count(&self) -> u32 {
        self.to_host_transfers.load(Ordering::Relaxed)
    }

    /// Host-to-device transfers performed
    pub fn from_host_transfer_count(&self) -> u32 {
        self.from_host_transfers.load(Ordering::Relaxed)
    }

    /// Byte range of a buffer region, clamped to the object
    ///
    /// Buffers are linear, so only the first dimension is used.
    fn region(&self, size: MemObjSizeArray, offset: MemObjSizeArray) -> (usize, usize) {
        let start = offset[0].min(self.size);
        (start, size[0].min(self.size - start))
    }
}

fn copy_clamped(src: &[u8], offset: usize, dst: &mut [u8]) -> usize {
    if offset >= src.len() {
        return 0;
    }
    let len = dst.len().min(src.len() - offset);
    dst[..len].copy_from_slice(&src[offset..offset + len]);
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use cinder_core::settings::keys;

    #[test]
    fn test_zero_copy_shares_storage() {
        let device = testing::device();
        let buffer = MemObj::create_buffer(&device, 64, true).unwrap();
        assert!(buffer.is_mem_obj_zero_copy());
        assert!(buffer.graphics_allocation().is_coherent());

        buffer.host_write(0, &[7, 8]);
        let mut out = [0u8; 2];
        buffer.graphics_allocation().read(0, &mut out);
        assert_eq!(out, [7, 8]);
    }

    #[test]
    fn test_disable_zero_copy_setting() {
        let device = testing::device_with(|c| c.set_bool(keys::DISABLE_ZERO_COPY, true));
        let buffer = MemObj::create_buffer(&device, 64, true).unwrap();
        assert!(!buffer.is_mem_obj_zero_copy());
    }

    #[test]
    fn test_transfers_copy_region() {
        let device = testing::device();
        let buffer = MemObj::create_buffer(&device, 64, false).unwrap();
        buffer.graphics_allocation().write(8, &[1, 2, 3, 4]);

        buffer.transfer_data_to_host_ptr([4, 1, 1], [8, 0, 0]);
        let mut out = [0u8; 4];
        buffer.host_read(8, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);

        buffer.host_write(0, &[9]);
        buffer.transfer_data_from_host_ptr([1, 0, 0], [0, 0, 0]);
        buffer.graphics_allocation().read(0, &mut out[..1]);
        assert_eq!(out[0], 9);

        assert_eq!(buffer.to_host_transfer_count(), 1);
        assert_eq!(buffer.from_host_transfer_count(), 1);
    }

    #[test]
    fn test_region_clamped_to_object() {
        let device = testing::device();
        let buffer = MemObj::create_buffer(&device, 16, false).unwrap();
        assert_eq!(buffer.region([64, 1, 1], [8, 0, 0]), (8, 8));
        assert_eq!(buffer.region([4, 2, 2], [0, 0, 0]), (0, 4));
        assert_eq!(buffer.region([16, 0, 0], [32, 0, 0]), (16, 0));
    }

    #[test]
    fn test_huge_region_does_not_overflow() {
        let device = testing::device();
        let buffer = MemObj::create_buffer(&device, 16, false).unwrap();
        assert_eq!(buffer.region([usize::MAX, usize::MAX, usize::MAX], [4, 0, 0]), (4, 12));

        buffer.graphics_allocation().write(0, &[5; 16]);
        buffer.transfer_data_to_host_ptr([usize::MAX, usize::MAX, 1], [0, 0, 0]);
        let mut out = [0u8; 16];
        buffer.host_read(0, &mut out);
        assert_eq!(out, [5; 16]);
    }
}
