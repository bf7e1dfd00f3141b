//! # Kernels and Programs
//!
//! Compiled kernels as the submission path sees them: an instruction
//! allocation plus the properties that shape a flush. Parent kernels may
//! enqueue block kernels on the device; the program owning them keeps the
//! block kernels' instruction allocations in its [`BlockKernelManager`].

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use cinder_core::{ByteSize, Result};
use cinder_mem::{AllocationFlags, GraphicsAllocation, MemoryManager};

use crate::receiver::ReceiverOwnership;

static NEXT_KERNEL_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate a kernel identity for walkers
pub(crate) fn next_kernel_id() -> u32 {
    NEXT_KERNEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Compile-time properties of a kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelInfo {
    /// Kernel name
    pub name: String,
    /// Instruction size in bytes
    pub isa_size: u64,
    /// Shared local memory per work group
    pub slm_total_size: u32,
    /// Uses the video motion estimation sampler
    pub is_vme: bool,
    /// Enqueues child kernels on the device
    pub is_parent: bool,
    /// Cannot be preempted mid-thread
    pub disable_mid_thread_preemption: bool,
    /// Cross-thread data size in bytes
    pub payload_size: u32,
}

impl Default for KernelInfo {
    fn default() -> Self {
        Self {
            name: String::from("kernel"),
            isa_size: 4096,
            slm_total_size: 0,
            is_vme: false,
            is_parent: false,
            disable_mid_thread_preemption: false,
            payload_size: 64,
        }
    }
}

// =============================================================================
// PROGRAM
// =============================================================================

/// Instruction allocations of the block kernels a parent can enqueue
#[derive(Debug, Default)]
pub struct BlockKernelManager {
    allocations: Vec<Box<GraphicsAllocation>>,
}

impl BlockKernelManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block kernel's instructions
    pub fn add_block_kernel(&mut self, allocation: Box<GraphicsAllocation>) {
        self.allocations.push(allocation);
    }

    /// Number of block kernels
    pub fn block_kernel_count(&self) -> usize {
        self.allocations.len()
    }

    /// Make every block kernel's instructions resident
    pub fn make_internal_allocations_resident(&self, csr: &mut ReceiverOwnership<'_>) {
        for allocation in &self.allocations {
            csr.make_resident(allocation);
        }
    }
}

/// A built program
#[derive(Debug, Default)]
pub struct Program {
    block_kernel_manager: BlockKernelManager,
}

impl Program {
    /// Create a program without block kernels
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a program with `count` block kernels of `isa_size` bytes each
    pub fn with_block_kernels(
        memory_manager: &MemoryManager,
        count: usize,
        isa_size: ByteSize,
    ) -> Result<Self> {
        let mut manager = BlockKernelManager::new();
        for _ in 0..count {
            manager.add_block_kernel(
                memory_manager.allocate_graphics_memory(isa_size, AllocationFlags::INTERNAL)?,
            );
        }
        Ok(Self { block_kernel_manager: manager })
    }

    /// Get the block kernel manager
    pub fn block_kernel_manager(&self) -> &BlockKernelManager {
        &self.block_kernel_manager
    }
}

// =============================================================================
// KERNEL
// =============================================================================

/// A kernel ready for dispatch
#[derive(Debug)]
pub struct Kernel {
    id: u32,
    info: KernelInfo,
    program: Arc<Program>,
    isa: Box<GraphicsAllocation>,
    /// Description of block kernels read by the device scheduler
    reflection_surface: Option<Box<GraphicsAllocation>>,
}

impl Kernel {
    /// Load a kernel's instructions
    pub fn new(
        memory_manager: &MemoryManager,
        program: Arc<Program>,
        info: KernelInfo,
    ) -> Result<Arc<Self>> {
        let isa = memory_manager
            .allocate_graphics_memory(ByteSize::from_bytes(info.isa_size), AllocationFlags::INTERNAL)?;
        let reflection_surface = if info.is_parent {
            Some(memory_manager.allocate_graphics_memory(ByteSize::KIB_4, AllocationFlags::INTERNAL)?)
        } else {
            None
        };

        let id = next_kernel_id();
        log::debug!("kernel {} '{}' loaded at {}", id, info.name, isa.gpu_addr());
        Ok(Arc::new(Self {
            id,
            info,
            program,
            isa,
            reflection_surface,
        }))
    }

    /// Kernel identity encoded into walkers
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Get kernel info
    pub fn info(&self) -> &KernelInfo {
        &self.info
    }

    /// Get the owning program
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Check if the kernel enqueues child kernels
    pub fn is_parent_kernel(&self) -> bool {
        self.info.is_parent
    }

    /// Check if the kernel uses the media sampler
    pub fn is_vme_kernel(&self) -> bool {
        self.info.is_vme
    }

    /// Check if mid-thread preemption must be avoided
    pub fn disables_mid_thread_preemption(&self) -> bool {
        self.info.disable_mid_thread_preemption
    }

    /// Shared local memory per work group
    pub fn slm_total_size(&self) -> u32 {
        self.info.slm_total_size
    }

    /// Get the instruction allocation
    pub fn isa_allocation(&self) -> &GraphicsAllocation {
        &self.isa
    }

    /// Get the reflection surface of a parent kernel
    pub fn reflection_surface(&self) -> Option<&GraphicsAllocation> {
        self.reflection_surface.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_kernel_has_reflection_surface() {
        let mm = MemoryManager::new(ByteSize::from_mib(4));
        let program = Arc::new(Program::with_block_kernels(&mm, 2, ByteSize::KIB_4).unwrap());
        let parent = Kernel::new(
            &mm,
            Arc::clone(&program),
            KernelInfo { is_parent: true, ..KernelInfo::default() },
        )
        .unwrap();
        let plain = Kernel::new(&mm, program, KernelInfo::default()).unwrap();

        assert!(parent.reflection_surface().is_some());
        assert!(plain.reflection_surface().is_none());
        assert_ne!(parent.id(), plain.id());
        assert_eq!(parent.program().block_kernel_manager().block_kernel_count(), 2);
    }

    #[test]
    fn test_kernel_allocations_released_with_kernel() {
        let mm = MemoryManager::new(ByteSize::from_mib(4));
        let kernel = Kernel::new(&mm, Arc::new(Program::new()), KernelInfo::default()).unwrap();
        assert_eq!(mm.live_bytes(), ByteSize::KIB_4);
        drop(kernel);
        assert_eq!(mm.live_bytes(), ByteSize::ZERO);
    }
}
