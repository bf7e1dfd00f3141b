//! # Dispatch Flags
//!
//! Per-flush options handed to a receiver, queue scheduling hints and the
//! completion stamp a flush produces.

use cinder_core::{FlushStamp, TaskCount, TaskLevel};

use crate::preemption::PreemptionMode;
use crate::timestamp::{DependencyContainer, DependencyNode};

// =============================================================================
// QUEUE HINTS
// =============================================================================

/// Queue scheduling priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum QueuePriority {
    /// Background work
    Low,
    /// Default
    #[default]
    Medium,
    /// Latency sensitive
    High,
}

impl QueuePriority {
    /// Check if flushes from this queue are submitted as low priority
    pub const fn is_low(self) -> bool {
        matches!(self, QueuePriority::Low)
    }
}

/// Queue power/throughput hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueThrottle {
    /// Favor power
    Low,
    /// Default
    #[default]
    Medium,
    /// Favor throughput
    High,
}

// =============================================================================
// COMMAND TYPES
// =============================================================================

/// API-level operation a command was recorded for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    /// Synchronization marker
    Marker,
    /// Barrier
    Barrier,
    /// Kernel dispatch
    NdRangeKernel,
    /// Buffer read to host
    ReadBuffer,
    /// Buffer write from host
    WriteBuffer,
    /// Buffer to buffer copy
    CopyBuffer,
    /// Map for host access
    MapBuffer,
    /// End host access
    UnmapMemObject,
}

impl CommandType {
    /// Check if the flush must flush the data cache so the host observes
    /// device writes
    pub const fn should_flush_dc(self) -> bool {
        matches!(
            self,
            CommandType::ReadBuffer | CommandType::MapBuffer | CommandType::UnmapMemObject
        )
    }
}

// =============================================================================
// DISPATCH FLAGS
// =============================================================================

/// Options for one receiver flush
#[derive(Debug, Clone, Copy)]
pub struct DispatchFlags<'a> {
    /// Block the submitter until the flush completes
    pub blocking: bool,
    /// Flush the data cache after the work
    pub dc_flush: bool,
    /// Reserve shared local memory
    pub use_slm: bool,
    /// Stall before jumping into the queue stream
    pub guard_command_buffer_with_pipe_control: bool,
    /// Limit general state to a 32-bit range
    pub gsba_32bit_required: bool,
    /// Host coherency required by a resident surface
    pub requires_coherency: bool,
    /// Submit as low priority
    pub low_priority: bool,
    /// Throttle hint
    pub throttle: QueueThrottle,
    /// Preemption granularity
    pub preemption_mode: PreemptionMode,
    /// Media sampler must be powered
    pub media_sampler_required: bool,
    /// Dependencies produced outside this device to wait on first
    pub out_of_device_dependencies: Option<&'a DependencyContainer>,
    /// Node written by the flush's trailing pipe control
    pub timestamp_packet_for_pipe_control_write: Option<&'a DependencyNode>,
}

impl Default for DispatchFlags<'_> {
    fn default() -> Self {
        Self {
            blocking: false,
            dc_flush: false,
            use_slm: false,
            guard_command_buffer_with_pipe_control: false,
            gsba_32bit_required: false,
            requires_coherency: false,
            low_priority: false,
            throttle: QueueThrottle::Medium,
            preemption_mode: PreemptionMode::Disabled,
            media_sampler_required: false,
            out_of_device_dependencies: None,
            timestamp_packet_for_pipe_control_write: None,
        }
    }
}

/// Owned copy of the scalar part of [`DispatchFlags`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordedFlags {
    /// See [`DispatchFlags::blocking`]
    pub blocking: bool,
    /// See [`DispatchFlags::dc_flush`]
    pub dc_flush: bool,
    /// See [`DispatchFlags::use_slm`]
    pub use_slm: bool,
    /// See [`DispatchFlags::guard_command_buffer_with_pipe_control`]
    pub guard_command_buffer_with_pipe_control: bool,
    /// See [`DispatchFlags::gsba_32bit_required`]
    pub gsba_32bit_required: bool,
    /// See [`DispatchFlags::requires_coherency`]
    pub requires_coherency: bool,
    /// See [`DispatchFlags::low_priority`]
    pub low_priority: bool,
    /// See [`DispatchFlags::throttle`]
    pub throttle: QueueThrottle,
    /// See [`DispatchFlags::preemption_mode`]
    pub preemption_mode: PreemptionMode,
    /// See [`DispatchFlags::media_sampler_required`]
    pub media_sampler_required: bool,
    /// Number of out-of-device dependencies
    pub dependency_count: usize,
    /// A pipe-control dependency node was attached
    pub has_pipe_control_node: bool,
}

impl From<&DispatchFlags<'_>> for RecordedFlags {
    fn from(flags: &DispatchFlags<'_>) -> Self {
        Self {
            blocking: flags.blocking,
            dc_flush: flags.dc_flush,
            use_slm: flags.use_slm,
            guard_command_buffer_with_pipe_control: flags.guard_command_buffer_with_pipe_control,
            gsba_32bit_required: flags.gsba_32bit_required,
            requires_coherency: flags.requires_coherency,
            low_priority: flags.low_priority,
            throttle: flags.throttle,
            preemption_mode: flags.preemption_mode,
            media_sampler_required: flags.media_sampler_required,
            dependency_count: flags.out_of_device_dependencies.map_or(0, |d| d.len()),
            has_pipe_control_node: flags.timestamp_packet_for_pipe_control_write.is_some(),
        }
    }
}

// =============================================================================
// COMPLETION STAMP
// =============================================================================

/// Result of a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionStamp {
    /// Task count assigned to the flush
    pub task_count: TaskCount,
    /// Dependency level of the flushed work
    pub task_level: TaskLevel,
    /// Token for waiting on the flush
    pub flush_stamp: FlushStamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dc_flush_policy() {
        assert!(!CommandType::Marker.should_flush_dc());
        assert!(!CommandType::NdRangeKernel.should_flush_dc());
        assert!(CommandType::MapBuffer.should_flush_dc());
        assert!(CommandType::ReadBuffer.should_flush_dc());
    }

    #[test]
    fn test_recorded_flags_copy_scalars() {
        let flags = DispatchFlags {
            blocking: true,
            use_slm: true,
            low_priority: QueuePriority::Low.is_low(),
            ..DispatchFlags::default()
        };
        let recorded = RecordedFlags::from(&flags);
        assert!(recorded.blocking);
        assert!(recorded.use_slm);
        assert!(recorded.low_priority);
        assert_eq!(recorded.dependency_count, 0);
        assert!(!recorded.has_pipe_control_node);
    }

    #[test]
    fn test_default_stamp_is_zero() {
        let stamp = CompletionStamp::default();
        assert_eq!((stamp.task_count, stamp.task_level, stamp.flush_stamp), (0, 0, 0));
    }
}
