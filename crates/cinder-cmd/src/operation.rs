//! # Kernel Operations
//!
//! The bundle a kernel dispatch is staged into before it is flushed: a
//! private command buffer plus dynamic-state, indirect-object and
//! surface-state heaps. The bundle owns everything it holds; dropping it
//! returns the heaps to the reuse pool and frees the command buffer.
//!
//! The indirect-object heap may be the dynamic-state heap itself. An aliased
//! bundle stores that single allocation once.

use alloc::sync::Arc;

use cinder_core::{unrecoverable, ByteSize, Result};
use cinder_mem::{AllocationFlags, AllocationUsage, HeapType, IndirectHeap, MemoryManager};

use crate::device::Device;
use crate::encoder::HwCommand;
use crate::kernel::Kernel;
use crate::stream::{LinearStream, StreamBacking};
use crate::surface::Surface;

/// Alignment of bundle command buffers
pub const COMMAND_BUFFER_ALIGNMENT: usize = 64;

/// Size of an interface descriptor in the dynamic state heap
const INTERFACE_DESCRIPTOR_SIZE: usize = 32;

#[derive(Debug)]
struct Parts {
    command_stream: LinearStream,
    dsh: IndirectHeap,
    /// `None` when aliased to `dsh`
    ioh: Option<IndirectHeap>,
    ssh: IndirectHeap,
}

/// Staged command buffer and heaps of one dispatch
#[derive(Debug)]
pub struct KernelOperation {
    /// Taken only by `Drop`
    parts: Option<Parts>,
    memory_manager: Arc<MemoryManager>,
}

impl KernelOperation {
    /// Assemble a bundle; pass `None` for `ioh` to alias it to `dsh`
    pub fn new(
        command_stream: LinearStream,
        dsh: IndirectHeap,
        ioh: Option<IndirectHeap>,
        ssh: IndirectHeap,
        memory_manager: Arc<MemoryManager>,
    ) -> Self {
        Self {
            parts: Some(Parts {
                command_stream,
                dsh,
                ioh,
                ssh,
            }),
            memory_manager,
        }
    }

    /// Build a bundle from pooled heaps of `heap_size` bytes each
    pub fn allocate(
        device: &Device,
        command_buffer_size: usize,
        heap_size: ByteSize,
        alias_ioh: bool,
    ) -> Result<Self> {
        let mm = device.memory_manager();
        let completed = device.csr().completed_task_count();
        let heap = |heap_type: HeapType| -> Result<IndirectHeap> {
            let allocation =
                mm.obtain_reusable_allocation(heap_size, completed, AllocationFlags::INTERNAL)?;
            Ok(IndirectHeap::new(heap_type, allocation))
        };

        let command_stream =
            LinearStream::host(mm.aligned_buffer(command_buffer_size, COMMAND_BUFFER_ALIGNMENT)?);
        let dsh = heap(HeapType::DynamicState)?;
        let ioh = if alias_ioh {
            None
        } else {
            Some(heap(HeapType::IndirectObject)?)
        };
        let ssh = heap(HeapType::SurfaceState)?;
        Ok(Self::new(command_stream, dsh, ioh, ssh, Arc::clone(mm)))
    }

    /// Stage a dispatch of `kernel` over `groups` with `surfaces` bound
    pub fn stage_walker(&mut self, kernel: &Kernel, groups: [u32; 3], surfaces: &[Surface]) -> Result<()> {
        let parts = self.parts_mut();

        let mut descriptor = [0u8; INTERFACE_DESCRIPTOR_SIZE];
        descriptor[..8].copy_from_slice(&kernel.isa_allocation().gpu_addr().raw().to_le_bytes());
        descriptor[8..12].copy_from_slice(&kernel.slm_total_size().to_le_bytes());
        let descriptor_offset = parts.dsh.push(&descriptor)?;

        let payload_heap = parts.ioh.as_mut().unwrap_or(&mut parts.dsh);
        let payload_offset = payload_heap.get_space(kernel.info().payload_size as usize)?;

        parts.ssh.align(64)?;
        for surface in surfaces {
            let addr = surface.mem_obj().graphics_allocation().gpu_addr();
            parts.ssh.push(&addr.raw().to_le_bytes())?;
        }

        HwCommand::Walker {
            kernel: kernel.id(),
            descriptor_offset: descriptor_offset as u32,
            payload_offset: payload_offset as u32,
            groups,
        }
        .encode(&mut parts.command_stream)
    }

    fn parts(&self) -> &Parts {
        match &self.parts {
            Some(parts) => parts,
            None => unrecoverable!("kernel operation used after release"),
        }
    }

    fn parts_mut(&mut self) -> &mut Parts {
        match &mut self.parts {
            Some(parts) => parts,
            None => unrecoverable!("kernel operation used after release"),
        }
    }

    /// Get the staged command buffer
    pub fn command_stream(&self) -> &LinearStream {
        &self.parts().command_stream
    }

    /// Get the dynamic state heap
    pub fn dsh(&self) -> &IndirectHeap {
        &self.parts().dsh
    }

    /// Get the indirect object heap
    pub fn ioh(&self) -> &IndirectHeap {
        let parts = self.parts();
        parts.ioh.as_ref().unwrap_or(&parts.dsh)
    }

    /// Get the surface state heap
    pub fn ssh(&self) -> &IndirectHeap {
        &self.parts().ssh
    }

    /// Dynamic state and surface state heaps, mutably
    pub fn dsh_and_ssh_mut(&mut self) -> (&mut IndirectHeap, &mut IndirectHeap) {
        let parts = self.parts_mut();
        (&mut parts.dsh, &mut parts.ssh)
    }

    /// Check if the indirect object heap is the dynamic state heap
    pub fn is_ioh_aliased(&self) -> bool {
        self.parts().ioh.is_none()
    }
}

impl Drop for KernelOperation {
    fn drop(&mut self) {
        let Some(parts) = self.parts.take() else {
            return;
        };
        let mm = &self.memory_manager;

        mm.store_allocation(parts.dsh.into_allocation(), AllocationUsage::Reusable);
        if let Some(ioh) = parts.ioh {
            mm.store_allocation(ioh.into_allocation(), AllocationUsage::Reusable);
        }
        mm.store_allocation(parts.ssh.into_allocation(), AllocationUsage::Reusable);

        match parts.command_stream.into_backing() {
            StreamBacking::Host(buffer) => mm.aligned_free(buffer),
            StreamBacking::Device(allocation) => {
                mm.store_allocation(allocation, AllocationUsage::Temporary)
            }
        }
        log::trace!("kernel operation released");
    }
}
