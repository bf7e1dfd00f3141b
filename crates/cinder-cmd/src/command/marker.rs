//! Marker and barrier commands.

use alloc::sync::Arc;

use cinder_core::{unrecoverable_if, TaskLevel, TASK_LEVEL_NOT_READY};

use crate::flags::{CommandType, CompletionStamp, DispatchFlags};
use crate::preemption::PreemptionHelper;
use crate::queue::CommandQueue;
use crate::timestamp::DependencyContainer;

/// Flushes no work of its own; orders the queue and optionally completes a
/// dependency node through the trailing pipe control
#[derive(Debug)]
pub struct CommandMarker {
    command_queue: Arc<CommandQueue>,
    command_type: CommandType,
    command_size: usize,
    timestamp_packets_for_pipe_control_write: DependencyContainer,
    completion_stamp: CompletionStamp,
}

impl CommandMarker {
    /// Create a marker reserving `command_size` bytes of queue stream
    pub fn new(command_queue: Arc<CommandQueue>, command_type: CommandType, command_size: usize) -> Self {
        Self {
            command_queue,
            command_type,
            command_size,
            timestamp_packets_for_pipe_control_write: DependencyContainer::new(),
            completion_stamp: CompletionStamp::default(),
        }
    }

    /// Attach the nodes written when this marker's flush completes
    pub fn set_timestamp_packets_for_pipe_control_write(&mut self, nodes: &DependencyContainer) {
        self.timestamp_packets_for_pipe_control_write
            .assign_and_increment_refs(nodes);
    }

    /// Stamp of the last real submission
    pub fn completion_stamp(&self) -> CompletionStamp {
        self.completion_stamp
    }

    /// Flush the marker
    pub fn submit(&mut self, task_level: TaskLevel, terminated: bool) -> CompletionStamp {
        if terminated {
            return self.completion_stamp;
        }

        let queue = Arc::clone(&self.command_queue);
        let context = queue.context();
        let device = context.device();

        let mut ownership = device.obtain_unique_ownership();
        let mut queue_stream = queue.get_cs(self.command_size);
        let offset = queue_stream.used();

        let flags = DispatchFlags {
            blocking: true,
            dc_flush: self.command_type.should_flush_dc(),
            low_priority: queue.priority().is_low(),
            throttle: queue.throttle(),
            preemption_mode: PreemptionHelper::task_preemption_mode(device, None),
            timestamp_packet_for_pipe_control_write: self
                .timestamp_packets_for_pipe_control_write
                .peek(0),
            ..DispatchFlags::default()
        };

        unrecoverable_if!(
            task_level >= TASK_LEVEL_NOT_READY,
            "marker: task level {:#x} is not ready",
            task_level
        );
        context.notify_pre_flush(queue.id());

        let heaps = queue.indirect_heaps(0);
        let stamp = ownership.flush_task(
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
        drop(ownership);

        queue.wait_until_complete(stamp.task_count, stamp.flush_stamp);
        log::trace!("marker {:?} completed task {}", self.command_type, stamp.task_count);
        self.completion_stamp = stamp;
        stamp
    }
}
