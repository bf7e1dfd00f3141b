//! # Kernel Printf
//!
//! Kernels append formatted records to a device buffer; after the dispatch
//! completes the host drains and logs them.
//!
//! ```text
//! ┌──────────┬──────────┬──────────────┬──────────┬──────────────┬─────┐
//! │ used (4) │ len (4)  │ bytes[len]   │ len (4)  │ bytes[len]   │ ... │
//! └──────────┴──────────┴──────────────┴──────────┴──────────────┴─────┘
//! ```
//!
//! `used` is the end offset of the last record, header included.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use cinder_core::{ByteSize, Result};
use cinder_mem::{AllocationFlags, GraphicsAllocation};

use crate::device::Device;
use crate::receiver::ReceiverOwnership;

/// Bytes taken by the buffer header
pub const PRINTF_HEADER_SIZE: usize = 4;

/// Printf capture buffer of one dispatch
#[derive(Debug)]
pub struct PrintfHandler {
    surface: Box<GraphicsAllocation>,
}

impl PrintfHandler {
    /// Allocate an empty capture buffer sized by the device settings
    pub fn new(device: &Device) -> Result<Self> {
        let surface = device.memory_manager().allocate_graphics_memory(
            ByteSize::from_bytes(device.settings().printf_buffer_size),
            AllocationFlags::COHERENT,
        )?;
        surface.write(0, &(PRINTF_HEADER_SIZE as u32).to_le_bytes());
        Ok(Self { surface })
    }

    /// Get the capture buffer
    pub fn printf_surface(&self) -> &GraphicsAllocation {
        &self.surface
    }

    /// Make the capture buffer resident
    pub fn make_resident(&self, csr: &mut ReceiverOwnership<'_>) {
        csr.make_resident(&self.surface);
    }

    /// Decode and log the captured records
    pub fn print_enqueue_output(&self) -> Vec<String> {
        let mut word = [0u8; 4];
        self.surface.read(0, &mut word);
        let used = (u32::from_le_bytes(word) as usize).min(self.surface.size().as_usize());

        let mut records = Vec::new();
        let mut pos = PRINTF_HEADER_SIZE;
        while pos + 4 <= used {
            self.surface.read(pos, &mut word);
            let len = u32::from_le_bytes(word) as usize;
            pos += 4;
            if pos + len > used {
                log::warn!("printf: truncated record at offset {}", pos - 4);
                break;
            }
            let mut bytes = vec![0u8; len];
            self.surface.read(pos, &mut bytes);
            pos += len;

            let text = String::from_utf8_lossy(&bytes).into_owned();
            log::info!("printf: {}", text);
            records.push(text);
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    /// Append a record the way the device-side runtime does
    fn emit(handler: &PrintfHandler, text: &str) {
        let surface = handler.printf_surface();
        let mut word = [0u8; 4];
        surface.read(0, &mut word);
        let used = u32::from_le_bytes(word) as usize;
        surface.write(used, &(text.len() as u32).to_le_bytes());
        surface.write(used + 4, text.as_bytes());
        surface.write(0, &((used + 4 + text.len()) as u32).to_le_bytes());
    }

    #[test]
    fn test_empty_buffer() {
        let device = testing::device();
        let handler = PrintfHandler::new(&device).unwrap();
        assert!(handler.print_enqueue_output().is_empty());
    }

    #[test]
    fn test_records_in_order() {
        let device = testing::device();
        let handler = PrintfHandler::new(&device).unwrap();
        emit(&handler, "gid 0");
        emit(&handler, "gid 1");
        assert_eq!(handler.print_enqueue_output(), ["gid 0", "gid 1"]);
    }

    #[test]
    fn test_truncated_record_stops_decoding() {
        let device = testing::device();
        let handler = PrintfHandler::new(&device).unwrap();
        emit(&handler, "ok");
        let surface = handler.printf_surface();
        // Claim a 100-byte record but only advance the header by 8
        surface.write(10, &100u32.to_le_bytes());
        surface.write(0, &18u32.to_le_bytes());
        assert_eq!(handler.print_enqueue_output(), ["ok"]);
    }
}
