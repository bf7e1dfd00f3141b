//! Surfaces bound to a kernel dispatch.

use alloc::sync::Arc;

use crate::mem_obj::MemObj;
use crate::receiver::ReceiverOwnership;

/// A memory object bound to a dispatch
#[derive(Debug, Clone)]
pub struct Surface {
    mem_obj: Arc<MemObj>,
    coherent: bool,
}

impl Surface {
    /// Bind `mem_obj`, inheriting its coherency
    pub fn new(mem_obj: Arc<MemObj>) -> Self {
        let coherent = mem_obj.graphics_allocation().is_coherent();
        Self { mem_obj, coherent }
    }

    /// Bind `mem_obj` with explicit coherency
    pub fn with_coherency(mem_obj: Arc<MemObj>, coherent: bool) -> Self {
        Self { mem_obj, coherent }
    }

    /// Check if the dispatch needs host coherency for this surface
    pub fn is_coherent(&self) -> bool {
        self.coherent
    }

    /// Get the bound object
    pub fn mem_obj(&self) -> &Arc<MemObj> {
        &self.mem_obj
    }

    /// Make the bound storage resident
    pub fn make_resident(&self, csr: &mut ReceiverOwnership<'_>) {
        self.mem_obj.make_resident(csr);
    }
}
