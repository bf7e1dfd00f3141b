//! Buffer map and unmap.

use alloc::sync::Arc;

use cinder_core::{unrecoverable_if, TaskLevel, TASK_LEVEL_NOT_READY};

use crate::flags::{CompletionStamp, DispatchFlags};
use crate::mem_obj::{MemObj, MemObjSizeArray};
use crate::preemption::PreemptionHelper;
use crate::queue::CommandQueue;

/// Direction of a map command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOperationType {
    /// Make device contents visible to the host
    Map,
    /// Publish host writes back to the device
    Unmap,
}

/// Synchronizes a memory object's host view after the queue drains
#[derive(Debug)]
pub struct CommandMapUnmap {
    op: MapOperationType,
    mem_obj: Arc<MemObj>,
    copy_size: MemObjSizeArray,
    copy_offset: MemObjSizeArray,
    read_only: bool,
    command_queue: Arc<CommandQueue>,
    completion_stamp: CompletionStamp,
}

impl CommandMapUnmap {
    /// Create a map or unmap of the region `copy_offset..copy_offset + copy_size`
    pub fn new(
        op: MapOperationType,
        mem_obj: Arc<MemObj>,
        copy_size: MemObjSizeArray,
        copy_offset: MemObjSizeArray,
        read_only: bool,
        command_queue: Arc<CommandQueue>,
    ) -> Self {
        Self {
            op,
            mem_obj,
            copy_size,
            copy_offset,
            read_only,
            command_queue,
            completion_stamp: CompletionStamp::default(),
        }
    }

    /// Get the map direction
    pub fn op(&self) -> MapOperationType {
        self.op
    }

    /// Stamp of the last real submission
    pub fn completion_stamp(&self) -> CompletionStamp {
        self.completion_stamp
    }

    /// Flush, wait, then synchronize the host view
    pub fn submit(&mut self, task_level: TaskLevel, terminated: bool) -> CompletionStamp {
        if terminated {
            return self.completion_stamp;
        }

        let queue = Arc::clone(&self.command_queue);
        let context = queue.context();
        let device = context.device();

        let mut csr = device.csr().obtain_unique_ownership();
        let mut queue_stream = queue.get_cs(0);
        let offset = queue_stream.used();

        let flags = DispatchFlags {
            blocking: true,
            dc_flush: true,
            use_slm: true,
            guard_command_buffer_with_pipe_control: true,
            low_priority: queue.priority().is_low(),
            throttle: queue.throttle(),
            preemption_mode: PreemptionHelper::task_preemption_mode(device, None),
            ..DispatchFlags::default()
        };

        unrecoverable_if!(
            task_level >= TASK_LEVEL_NOT_READY,
            "map/unmap: task level {:#x} is not ready",
            task_level
        );
        context.notify_pre_flush(queue.id());

        let heaps = queue.indirect_heaps(0);
        let stamp = csr.flush_task(
            &mut queue_stream,
            offset,
            heaps.dsh(),
            heaps.ioh(),
            heaps.ssh(),
            task_level,
            &flags,
            device,
        );
        drop(heaps);
        drop(queue_stream);
        drop(csr);

        queue.wait_until_complete(stamp.task_count, stamp.flush_stamp);

        if !self.mem_obj.is_mem_obj_zero_copy() {
            match self.op {
                MapOperationType::Map => {
                    self.mem_obj
                        .transfer_data_to_host_ptr(self.copy_size, self.copy_offset);
                }
                MapOperationType::Unmap if !self.read_only => {
                    self.mem_obj
                        .transfer_data_from_host_ptr(self.copy_size, self.copy_offset);
                }
                MapOperationType::Unmap => {}
            }
        }

        self.completion_stamp = stamp;
        stamp
    }
}
