//! # Command Stream Receiver
//!
//! Owns a device's submission ring. Every flush goes through here: the
//! receiver programs state that changed since the previous flush, jumps into
//! the submitting queue's stream, appends the completion write and hands the
//! ring section to the engine.
//!
//! ## Ownership
//!
//! ```text
//!   CommandStreamReceiver
//!   ├── tag / task_count        lock-free: waits and peeks
//!   └── Mutex<ReceiverState>    ring, residency list, state cache
//!            │
//!            └── obtain_unique_ownership() ──► ReceiverOwnership
//!                                              ├── make_resident()
//!                                              └── flush_task()
//! ```
//!
//! Residency and flushing are only reachable through [`ReceiverOwnership`],
//! so a flush can never interleave with another thread's residency list.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::{Mutex, MutexGuard};

use cinder_core::{
    unrecoverable, unrecoverable_if, ByteSize, CompletionTag, DebugSettings, FlushStamp, GpuAddr,
    Result, TaskCount, TaskLevel, TASK_LEVEL_NOT_READY,
};
use cinder_mem::{AllocationFlags, GraphicsAllocation, IndirectHeap, MemoryManager};

use crate::device::Device;
use crate::encoder::{HwCommand, PipeControlFlags};
use crate::engine::{HwEngine, ResidencyEntry, Submission};
use crate::flags::{CompletionStamp, DispatchFlags, RecordedFlags};
use crate::preemption::PreemptionMode;
use crate::stream::LinearStream;
use crate::timestamp::TagAllocator;

/// Nodes in a receiver's timestamp packet pool
pub const TIMESTAMP_POOL_SIZE: usize = 64;

/// Ring bytes a flush needs besides its semaphore waits
const FLUSH_RING_RESERVE: usize = 256;

// =============================================================================
// STATE CACHE
// =============================================================================

/// Heap bases last programmed into the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StateBase {
    dsh: GpuAddr,
    ioh: GpuAddr,
    ssh: GpuAddr,
    gsba_32bit: bool,
}

/// State the engine retains between flushes
#[derive(Debug, Default)]
struct StateCache {
    preemption: Option<PreemptionMode>,
    slm: Option<bool>,
    media_sampler: Option<bool>,
    coherency: Option<bool>,
    state_base: Option<StateBase>,
}

#[derive(Debug)]
struct ReceiverState {
    ring: LinearStream,
    task_count: TaskCount,
    task_level: TaskLevel,
    residency: Vec<ResidencyEntry>,
    cache: StateCache,
}

// =============================================================================
// COMMAND STREAM RECEIVER
// =============================================================================

/// Per-device submission ring
pub struct CommandStreamReceiver {
    engine: Arc<dyn HwEngine>,
    memory_manager: Arc<MemoryManager>,
    /// Written by the engine when a flush completes
    tag: Arc<CompletionTag>,
    tag_allocation: Box<GraphicsAllocation>,
    /// Mirror of the last assigned task count for lock-free peeks
    task_count: AtomicU32,
    last_flags: Mutex<Option<RecordedFlags>>,
    timestamp_packets: Option<Arc<TagAllocator>>,
    state: Mutex<ReceiverState>,
}

impl CommandStreamReceiver {
    /// Create a receiver submitting to `engine`
    pub fn new(
        engine: Arc<dyn HwEngine>,
        memory_manager: Arc<MemoryManager>,
        settings: &DebugSettings,
    ) -> Result<Self> {
        let ring_allocation = memory_manager.allocate_graphics_memory(
            ByteSize::from_bytes(settings.csr_command_stream_size),
            AllocationFlags::INTERNAL,
        )?;
        let tag_allocation = memory_manager
            .allocate_graphics_memory(ByteSize::KIB_4, AllocationFlags::INTERNAL | AllocationFlags::COHERENT)?;
        let timestamp_packets = if settings.enable_timestamp_packet {
            Some(TagAllocator::new(&memory_manager, TIMESTAMP_POOL_SIZE)?)
        } else {
            None
        };

        log::info!(
            "csr: {} engine, ring {}, initial tag {}",
            engine.name(),
            ring_allocation.size(),
            settings.initial_hardware_tag
        );

        Ok(Self {
            engine,
            memory_manager,
            tag: Arc::new(CompletionTag::new(settings.initial_hardware_tag)),
            tag_allocation,
            task_count: AtomicU32::new(0),
            last_flags: Mutex::new(None),
            timestamp_packets,
            state: Mutex::new(ReceiverState {
                ring: LinearStream::device(ring_allocation),
                task_count: 0,
                task_level: 0,
                residency: Vec::new(),
                cache: StateCache::default(),
            }),
        })
    }

    /// Acquire exclusive use of the receiver
    pub fn obtain_unique_ownership(&self) -> ReceiverOwnership<'_> {
        ReceiverOwnership {
            receiver: self,
            state: self.state.lock(),
        }
    }

    /// Last assigned task count
    pub fn peek_task_count(&self) -> TaskCount {
        self.task_count.load(Ordering::Acquire)
    }

    /// Highest task count the engine has completed
    pub fn completed_task_count(&self) -> TaskCount {
        self.tag.load()
    }

    /// Block until `task_count` has completed, then release temporaries
    pub fn wait_until_complete(&self, task_count: TaskCount) {
        if !self.tag.is_reached(task_count) {
            log::trace!("csr: waiting for task {}", task_count);
            self.tag.wait(task_count);
        }
        self.memory_manager
            .clean_temporary_allocations(self.completed_task_count());
    }

    /// Get the completion tag
    pub fn tag(&self) -> &Arc<CompletionTag> {
        &self.tag
    }

    /// Device address the engine writes completion to
    pub fn tag_address(&self) -> GpuAddr {
        self.tag_allocation.gpu_addr()
    }

    /// Check if flushes track dependency nodes
    pub fn timestamp_packet_write_enabled(&self) -> bool {
        self.timestamp_packets.is_some()
    }

    /// Get the dependency node pool
    pub fn timestamp_packet_allocator(&self) -> Option<&Arc<TagAllocator>> {
        self.timestamp_packets.as_ref()
    }

    /// Options of the most recent flush
    pub fn last_dispatch_flags(&self) -> Option<RecordedFlags> {
        *self.last_flags.lock()
    }

    /// Get the memory manager
    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory_manager
    }
}

impl fmt::Debug for CommandStreamReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStreamReceiver")
            .field("engine", &self.engine.name())
            .field("task_count", &self.peek_task_count())
            .field("completed", &self.completed_task_count())
            .finish()
    }
}

// =============================================================================
// OWNERSHIP
// =============================================================================

/// Exclusive access to a receiver, released on drop
pub struct ReceiverOwnership<'a> {
    receiver: &'a CommandStreamReceiver,
    state: MutexGuard<'a, ReceiverState>,
}

impl<'a> ReceiverOwnership<'a> {
    /// Get the receiver
    pub fn receiver(&self) -> &'a CommandStreamReceiver {
        self.receiver
    }

    /// Last assigned task count
    pub fn peek_task_count(&self) -> TaskCount {
        self.state.task_count
    }

    /// Add `allocation` to the next flush's residency list
    ///
    /// The allocation is charged to the pending flush, so the reuse pool
    /// will not hand it out before that flush completes.
    pub fn make_resident(&mut self, allocation: &GraphicsAllocation) {
        let pending = self.state.task_count + 1;
        if !allocation.mark_resident(pending) {
            return;
        }
        allocation.update_task_count(pending);
        self.state.residency.push(ResidencyEntry {
            id: allocation.id(),
            gpu_addr: allocation.gpu_addr(),
            size: allocation.size(),
        });
    }

    /// Number of allocations queued for the next flush
    pub fn residency_count(&self) -> usize {
        self.state.residency.len()
    }

    /// Submit the section of `stream` starting at `offset`
    ///
    /// Appends the batch terminator to `stream`, programs changed state into
    /// the ring, and hands both to the engine. The returned stamp carries the
    /// new task count.
    pub fn flush_task(
        &mut self,
        stream: &mut LinearStream,
        offset: usize,
        dsh: &IndirectHeap,
        ioh: &IndirectHeap,
        ssh: &IndirectHeap,
        task_level: TaskLevel,
        flags: &DispatchFlags<'_>,
        device: &Device,
    ) -> CompletionStamp {
        unrecoverable_if!(
            task_level >= TASK_LEVEL_NOT_READY,
            "csr: flushing task level {:#x} that is not ready",
            task_level
        );
        unrecoverable_if!(
            offset > stream.used(),
            "csr: flush offset {} past stream end {}",
            offset,
            stream.used()
        );

        let receiver = self.receiver;
        let task_count = self.state.task_count + 1;

        if let Err(e) = HwCommand::BatchBufferEnd.encode(stream) {
            unrecoverable!("csr: no room to terminate queue stream: {}", e);
        }

        if let Some(allocation) = stream.graphics_allocation() {
            self.make_resident(allocation);
        }
        for heap in [dsh, ioh, ssh] {
            self.make_resident(heap.graphics_allocation());
        }
        self.make_resident(&receiver.tag_allocation);
        if let Some(deps) = flags.out_of_device_dependencies {
            deps.make_resident(self);
        }
        if let Some(node) = flags.timestamp_packet_for_pipe_control_write {
            self.make_resident(node.allocator().graphics_allocation());
        }

        let ring_start = self.program_ring(stream, offset, dsh, ioh, ssh, task_count, flags, device);

        let state = &mut *self.state;
        if let Some(ring_allocation) = state.ring.graphics_allocation() {
            ring_allocation.update_task_count(task_count);
        }

        let residency = &state.residency;
        let flush_stamp: FlushStamp = state.ring.with_contents(|ring| {
            stream.with_contents(|batch| {
                receiver.engine.submit(&Submission {
                    ring: &ring[ring_start..],
                    batch: &batch[offset..],
                    residency,
                    task_count,
                    tag: &receiver.tag,
                    tag_address: receiver.tag_address(),
                    low_priority: flags.low_priority,
                    throttle: flags.throttle,
                })
            })
        });

        log::debug!(
            "csr: flushed task {} level {} ({} resident, stamp {})",
            task_count,
            task_level,
            state.residency.len(),
            flush_stamp
        );

        state.task_count = task_count;
        state.task_level = state.task_level.max(task_level);
        state.residency.clear();
        receiver.task_count.store(task_count, Ordering::Release);
        *receiver.last_flags.lock() = Some(RecordedFlags::from(flags));

        receiver
            .memory_manager
            .clean_temporary_allocations(receiver.completed_task_count());

        CompletionStamp {
            task_count,
            task_level,
            flush_stamp,
        }
    }

    /// Encode this flush's ring packets, returning where they start
    fn program_ring(
        &mut self,
        stream: &LinearStream,
        offset: usize,
        dsh: &IndirectHeap,
        ioh: &IndirectHeap,
        ssh: &IndirectHeap,
        task_count: TaskCount,
        flags: &DispatchFlags<'_>,
        device: &Device,
    ) -> usize {
        let receiver = self.receiver;
        let state = &mut *self.state;

        let waits = flags
            .out_of_device_dependencies
            .map_or(0, |deps| deps.iter().filter(|n| !n.is_completed()).count());
        let needed = FLUSH_RING_RESERVE
            + waits * HwCommand::SemaphoreWait { address: GpuAddr::null(), value: 0 }.size();
        unrecoverable_if!(
            needed > state.ring.capacity(),
            "csr: ring of {} bytes cannot hold a {} byte flush",
            state.ring.capacity(),
            needed
        );
        if state.ring.available() < needed {
            // Every earlier flush must be retired before its packets are overwritten
            receiver.tag.wait(state.task_count);
            state.ring.reset();
            log::trace!("csr: ring wrapped at task {}", task_count);
        }

        let mut packets: Vec<HwCommand> = Vec::new();
        let cache = &mut state.cache;

        if cache.preemption != Some(flags.preemption_mode) {
            packets.push(HwCommand::PreemptionState { mode: flags.preemption_mode.raw() });
            cache.preemption = Some(flags.preemption_mode);
        }
        if cache.slm != Some(flags.use_slm) {
            packets.push(HwCommand::L3Config { slm_enabled: flags.use_slm });
            cache.slm = Some(flags.use_slm);
        }
        if cache.media_sampler != Some(flags.media_sampler_required) {
            packets.push(HwCommand::PipelineSelect { media_sampler: flags.media_sampler_required });
            cache.media_sampler = Some(flags.media_sampler_required);
        }
        if device.hw_info().supports_coherency && cache.coherency != Some(flags.requires_coherency) {
            packets.push(HwCommand::CoherencyMode { enabled: flags.requires_coherency });
            cache.coherency = Some(flags.requires_coherency);
        }

        let state_base = StateBase {
            dsh: dsh.gpu_base(),
            ioh: ioh.gpu_base(),
            ssh: ssh.gpu_base(),
            gsba_32bit: flags.gsba_32bit_required,
        };
        if cache.state_base != Some(state_base) {
            packets.push(HwCommand::PipeControl {
                flags: PipeControlFlags::CS_STALL | PipeControlFlags::STATE_INVALIDATE,
                address: GpuAddr::null(),
                data: 0,
            });
            packets.push(HwCommand::StateBaseAddress {
                dsh: state_base.dsh,
                ioh: state_base.ioh,
                ssh: state_base.ssh,
                gsba_32bit: state_base.gsba_32bit,
            });
            cache.state_base = Some(state_base);
        }

        if let Some(deps) = flags.out_of_device_dependencies {
            for node in deps.iter().filter(|n| !n.is_completed()) {
                packets.push(HwCommand::SemaphoreWait { address: node.gpu_addr(), value: 1 });
            }
        }

        if flags.guard_command_buffer_with_pipe_control {
            packets.push(HwCommand::PipeControl {
                flags: PipeControlFlags::CS_STALL,
                address: GpuAddr::null(),
                data: 0,
            });
        }

        packets.push(HwCommand::BatchBufferStart {
            address: stream.gpu_base().offset(offset as u64),
            length: (stream.used() - offset) as u32,
        });

        let mut completion = PipeControlFlags::CS_STALL | PipeControlFlags::POST_SYNC_WRITE;
        if flags.dc_flush {
            completion |= PipeControlFlags::DC_FLUSH;
        }
        packets.push(HwCommand::PipeControl {
            flags: completion,
            address: receiver.tag_address(),
            data: task_count,
        });

        if let Some(node) = flags.timestamp_packet_for_pipe_control_write {
            packets.push(HwCommand::PipeControl {
                flags: PipeControlFlags::CS_STALL | PipeControlFlags::POST_SYNC_WRITE,
                address: node.gpu_addr(),
                data: 1,
            });
            node.assign(task_count, Arc::clone(&receiver.tag));
        }

        let ring_start = state.ring.used();
        for packet in &packets {
            if let Err(e) = packet.encode(&mut state.ring) {
                unrecoverable!("csr: ring overflow encoding {:?}: {}", packet, e);
            }
        }
        ring_start
    }
}

impl Drop for ReceiverOwnership<'_> {
    fn drop(&mut self) {
        log::trace!("csr: ownership released at task {}", self.state.task_count);
    }
}

impl fmt::Debug for ReceiverOwnership<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverOwnership")
            .field("task_count", &self.state.task_count)
            .field("residency", &self.state.residency.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(CommandStreamReceiver: Send, Sync);
