//! # Command Queues
//!
//! A queue owns the shared command stream its commands are copied into and
//! a default set of indirect heaps. Commands are enqueued onto a deferred
//! list and submitted in order by [`CommandQueue::flush_deferred`].
//!
//! ```text
//!   enqueue(cmd) ──► deferred ──► flush_deferred()
//!                                   │  level = task_level
//!                                   ├─ cmd.submit(level, aborted)
//!                                   └─ task_level = stamp.level + 1
//! ```
//!
//! Lock order: queue submission, device ownership, receiver state, queue
//! stream, queue heaps.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use cinder_core::{unrecoverable, ByteSize, FlushStamp, QueueId, Result, TaskCount, TaskLevel};
use cinder_mem::{AllocationFlags, AllocationUsage, HeapType, IndirectHeap};

use crate::command::Command;
use crate::context::Context;
use crate::encoder::HwCommand;
use crate::flags::{CompletionStamp, QueuePriority, QueueThrottle};
use crate::stream::{LinearStream, StreamBacking};

/// Default size of a queue's command stream
pub const QUEUE_STREAM_SIZE: ByteSize = ByteSize::KIB_64;

/// Default size of each queue heap
pub const QUEUE_HEAP_SIZE: ByteSize = ByteSize::KIB_64;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Default indirect heaps of a queue
#[derive(Debug)]
pub struct QueueHeaps {
    heaps: [IndirectHeap; 3],
}

impl QueueHeaps {
    /// Get a heap
    pub fn get(&self, heap_type: HeapType) -> &IndirectHeap {
        &self.heaps[heap_type.index()]
    }

    /// Get a heap mutably
    pub fn get_mut(&mut self, heap_type: HeapType) -> &mut IndirectHeap {
        &mut self.heaps[heap_type.index()]
    }

    /// Dynamic state heap
    pub fn dsh(&self) -> &IndirectHeap {
        self.get(HeapType::DynamicState)
    }

    /// Indirect object heap
    pub fn ioh(&self) -> &IndirectHeap {
        self.get(HeapType::IndirectObject)
    }

    /// Surface state heap
    pub fn ssh(&self) -> &IndirectHeap {
        self.get(HeapType::SurfaceState)
    }
}

/// In-order command queue
pub struct CommandQueue {
    id: QueueId,
    context: Arc<Context>,
    priority: QueuePriority,
    throttle: QueueThrottle,
    stream: Mutex<LinearStream>,
    heaps: Mutex<QueueHeaps>,
    task_level: AtomicU32,
    latest: Mutex<CompletionStamp>,
    deferred: Mutex<VecDeque<Command>>,
    /// Held across a whole drain of `deferred`
    submission: Mutex<()>,
    aborted: AtomicBool,
}

impl CommandQueue {
    /// Create a queue on `context`
    pub fn new(
        context: Arc<Context>,
        priority: QueuePriority,
        throttle: QueueThrottle,
    ) -> Result<Arc<Self>> {
        let device = context.device();
        let mm = device.memory_manager();

        let stream = LinearStream::device(
            mm.allocate_graphics_memory(QUEUE_STREAM_SIZE, AllocationFlags::INTERNAL)?,
        );
        let dsh = IndirectHeap::new(
            HeapType::DynamicState,
            mm.allocate_graphics_memory(QUEUE_HEAP_SIZE, AllocationFlags::INTERNAL)?,
        );
        let ioh = IndirectHeap::new(
            HeapType::IndirectObject,
            mm.allocate_graphics_memory(QUEUE_HEAP_SIZE, AllocationFlags::INTERNAL)?,
        );
        let ssh = IndirectHeap::new(
            HeapType::SurfaceState,
            mm.allocate_graphics_memory(QUEUE_HEAP_SIZE, AllocationFlags::INTERNAL)?,
        );

        let id = QueueId::new(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed));
        log::debug!("queue {:?} created on device {:?} ({:?}, {:?})", id, device.id(), priority, throttle);
        Ok(Arc::new(Self {
            id,
            context,
            priority,
            throttle,
            stream: Mutex::new(stream),
            heaps: Mutex::new(QueueHeaps { heaps: [dsh, ioh, ssh] }),
            task_level: AtomicU32::new(0),
            latest: Mutex::new(CompletionStamp::default()),
            deferred: Mutex::new(VecDeque::new()),
            submission: Mutex::new(()),
            aborted: AtomicBool::new(false),
        }))
    }

    /// Get queue ID
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Get the owning context
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Get queue priority
    pub fn priority(&self) -> QueuePriority {
        self.priority
    }

    /// Get queue throttle
    pub fn throttle(&self) -> QueueThrottle {
        self.throttle
    }

    /// Task level the next submitted command runs at
    pub fn task_level(&self) -> TaskLevel {
        self.task_level.load(Ordering::Acquire)
    }

    /// Stamp of the last command that actually flushed
    pub fn latest_stamp(&self) -> CompletionStamp {
        *self.latest.lock()
    }

    // =========================================================================
    // SHARED BUFFERS
    // =========================================================================

    /// Lock the queue stream with at least `min_required` bytes free
    ///
    /// Room for the batch terminator is always kept. A stream that is too
    /// full is swapped for a fresh one; the old buffer is retired once the
    /// work using it completes.
    pub fn get_cs(&self, min_required: usize) -> MutexGuard<'_, LinearStream> {
        let mut stream = self.stream.lock();
        let needed = min_required + HwCommand::BatchBufferEnd.size();
        if stream.available() >= needed {
            return stream;
        }

        let device = self.context.device();
        let mm = device.memory_manager();
        let size = ByteSize::from_bytes(needed.max(QUEUE_STREAM_SIZE.as_usize()) as u64);
        let allocation = match mm.obtain_reusable_allocation(
            size,
            device.csr().completed_task_count(),
            AllocationFlags::INTERNAL,
        ) {
            Ok(allocation) => allocation,
            Err(e) => unrecoverable!("queue {:?}: cannot replace command stream: {}", self.id, e),
        };
        log::warn!("queue {:?}: command stream replaced ({} bytes needed)", self.id, needed);

        match stream.replace_buffer(StreamBacking::Device(allocation)) {
            StreamBacking::Device(old) => mm.store_allocation(old, AllocationUsage::Temporary),
            StreamBacking::Host(buffer) => mm.aligned_free(buffer),
        }
        stream
    }

    /// Lock the queue heaps, each with at least `min_size` bytes free
    pub fn indirect_heaps(&self, min_size: usize) -> MutexGuard<'_, QueueHeaps> {
        let mut heaps = self.heaps.lock();
        let device = self.context.device();
        let mm = device.memory_manager();

        for heap_type in HeapType::ALL {
            if heaps.get(heap_type).available() >= min_size {
                continue;
            }
            let size = ByteSize::from_bytes(min_size.max(QUEUE_HEAP_SIZE.as_usize()) as u64);
            let allocation = match mm.obtain_reusable_allocation(
                size,
                device.csr().completed_task_count(),
                AllocationFlags::INTERNAL,
            ) {
                Ok(allocation) => allocation,
                Err(e) => unrecoverable!("queue {:?}: cannot replace {:?}: {}", self.id, heap_type, e),
            };
            log::warn!("queue {:?}: {:?} replaced ({} bytes needed)", self.id, heap_type, min_size);

            let old = core::mem::replace(heaps.get_mut(heap_type), IndirectHeap::new(heap_type, allocation));
            mm.store_allocation(old.into_allocation(), AllocationUsage::Temporary);
        }
        heaps
    }

    /// Block until `task_count` completes on the device's receiver
    pub fn wait_until_complete(&self, task_count: TaskCount, flush_stamp: FlushStamp) {
        log::trace!("queue {:?}: waiting for task {} (stamp {})", self.id, task_count, flush_stamp);
        self.context.device().csr().wait_until_complete(task_count);
    }

    // =========================================================================
    // DEFERRED SUBMISSION
    // =========================================================================

    /// Queue a command for submission
    ///
    /// With `MakeEachEnqueueBlocking` set, the deferred list is flushed
    /// immediately.
    pub fn enqueue(&self, command: impl Into<Command>) {
        self.deferred.lock().push_back(command.into());
        if self.context.device().settings().make_each_enqueue_blocking {
            self.flush_deferred();
        }
    }

    /// Commands waiting for submission
    pub fn pending_count(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Submit every deferred command in order
    ///
    /// After [`abort`](Self::abort), commands are submitted as terminated and
    /// return their previous stamp without touching the device.
    ///
    /// Concurrent drains are serialized, so commands reach the device in the
    /// order they were enqueued.
    pub fn flush_deferred(&self) -> Vec<CompletionStamp> {
        let _submission = self.submission.lock();
        let mut stamps = Vec::new();
        loop {
            // Enqueue stays open while a command is being submitted
            let Some(mut command) = self.deferred.lock().pop_front() else {
                break;
            };
            let terminated = self.aborted.load(Ordering::Acquire);
            let stamp = command.submit(self.task_level(), terminated);
            if !terminated {
                self.task_level.fetch_max(stamp.task_level + 1, Ordering::AcqRel);
                *self.latest.lock() = stamp;
            }
            stamps.push(stamp);
        }
        stamps
    }

    /// Terminate the queue; later submits short-circuit
    pub fn abort(&self) {
        log::debug!("queue {:?}: aborted", self.id);
        self.aborted.store(true, Ordering::Release);
    }

    /// Check if the queue was aborted
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        log::debug!("queue {:?} destroyed", self.id);
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("throttle", &self.throttle)
            .field("task_level", &self.task_level())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

static_assertions::assert_impl_all!(CommandQueue: Send, Sync);
