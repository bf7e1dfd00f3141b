//! # Hardware Engines
//!
//! The boundary between a receiver and whatever executes its rings. A
//! receiver hands each flush to an [`HwEngine`] as a [`Submission`]; the
//! engine reports completion by advancing the receiver's completion tag.
//!
//! [`SoftwareEngine`] decodes and retires submissions on the host. It backs
//! headless operation and the test suite. It keeps only the most recent
//! [`DEFAULT_RECORD_CAPACITY`] submission records.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use cinder_core::{AllocationId, ByteSize, CompletionTag, FlushStamp, GpuAddr, TaskCount};

use crate::encoder::{decode, HwCommand, PipeControlFlags};
use crate::flags::QueueThrottle;

// =============================================================================
// SUBMISSION
// =============================================================================

/// An allocation the engine must be able to access during a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidencyEntry {
    /// Allocation ID
    pub id: AllocationId,
    /// Device address
    pub gpu_addr: GpuAddr,
    /// Size
    pub size: ByteSize,
}

/// One flush handed to an engine
pub struct Submission<'a> {
    /// Receiver ring packets for this flush
    pub ring: &'a [u8],
    /// Queue stream section the ring jumps into
    pub batch: &'a [u8],
    /// Allocations made resident for the flush
    pub residency: &'a [ResidencyEntry],
    /// Task count the flush completes
    pub task_count: TaskCount,
    /// Receiver completion tag
    pub tag: &'a Arc<CompletionTag>,
    /// Device address of the completion tag
    pub tag_address: GpuAddr,
    /// Submit at low priority
    pub low_priority: bool,
    /// Throttle hint
    pub throttle: QueueThrottle,
}

impl fmt::Debug for Submission<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("ring_bytes", &self.ring.len())
            .field("batch_bytes", &self.batch.len())
            .field("residency", &self.residency.len())
            .field("task_count", &self.task_count)
            .field("low_priority", &self.low_priority)
            .finish()
    }
}

/// Executes receiver flushes
pub trait HwEngine: Send + Sync + fmt::Debug {
    /// Queue a flush for execution, returning its flush stamp
    fn submit(&self, submission: &Submission<'_>) -> FlushStamp;

    /// Get engine name
    fn name(&self) -> &'static str;
}

// =============================================================================
// SOFTWARE ENGINE
// =============================================================================

/// Submission records a [`SoftwareEngine`] keeps by default
pub const DEFAULT_RECORD_CAPACITY: usize = 64;

/// What a [`SoftwareEngine`] saw for one flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    /// Flush stamp returned to the receiver
    pub flush_stamp: FlushStamp,
    /// Task count of the flush
    pub task_count: TaskCount,
    /// Decoded ring packets
    pub ring: Vec<HwCommand>,
    /// Decoded queue stream packets
    pub batch: Vec<HwCommand>,
    /// Resident allocation IDs
    pub residency: Vec<AllocationId>,
    /// Low priority submission
    pub low_priority: bool,
    /// Throttle hint
    pub throttle: QueueThrottle,
}

impl SubmissionRecord {
    /// Count compute dispatches in the batch
    pub fn walker_count(&self) -> usize {
        self.batch
            .iter()
            .filter(|c| matches!(c, HwCommand::Walker { .. }))
            .count()
    }
}

#[derive(Debug)]
struct PendingSignal {
    tag: Arc<CompletionTag>,
    value: u32,
}

/// Host-side engine that decodes and retires submissions
#[derive(Debug)]
pub struct SoftwareEngine {
    /// Retire each submission as soon as it arrives
    auto_complete: bool,
    next_stamp: AtomicU64,
    /// Oldest records are dropped past this many
    record_capacity: usize,
    records: Mutex<VecDeque<SubmissionRecord>>,
    pending: Mutex<Vec<PendingSignal>>,
}

impl SoftwareEngine {
    /// Create an engine that completes work immediately
    pub fn new() -> Self {
        Self::with_completion(true)
    }

    /// Create an engine that completes work only through
    /// [`SoftwareEngine::complete_pending`]
    pub fn deferred() -> Self {
        Self::with_completion(false)
    }

    fn with_completion(auto_complete: bool) -> Self {
        Self {
            auto_complete,
            next_stamp: AtomicU64::new(1),
            record_capacity: DEFAULT_RECORD_CAPACITY,
            records: Mutex::new(VecDeque::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Keep at most `capacity` submission records; zero disables recording
    pub fn with_record_capacity(mut self, capacity: usize) -> Self {
        self.record_capacity = capacity;
        self
    }

    /// Retire every held submission, returning how many were retired
    pub fn complete_pending(&self) -> usize {
        let pending: Vec<_> = self.pending.lock().drain(..).collect();
        for signal in &pending {
            signal.tag.signal(signal.value);
        }
        pending.len()
    }

    /// Number of submissions waiting for completion
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Snapshot of the retained submissions, oldest first
    pub fn records(&self) -> Vec<SubmissionRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Most recent submission
    pub fn last_record(&self) -> Option<SubmissionRecord> {
        self.records.lock().back().cloned()
    }

    fn record(&self, record: SubmissionRecord) {
        if self.record_capacity == 0 {
            return;
        }
        let mut records = self.records.lock();
        while records.len() >= self.record_capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    fn decode_logged(what: &str, bytes: &[u8]) -> Vec<HwCommand> {
        match decode(bytes) {
            Ok(commands) => commands,
            Err(e) => {
                log::error!("software engine: malformed {}: {}", what, e);
                Vec::new()
            }
        }
    }
}

impl Default for SoftwareEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HwEngine for SoftwareEngine {
    fn submit(&self, submission: &Submission<'_>) -> FlushStamp {
        let flush_stamp = self.next_stamp.fetch_add(1, Ordering::Relaxed);
        let ring = Self::decode_logged("ring", submission.ring);
        let batch = Self::decode_logged("batch", submission.batch);

        // Post-sync writes to the tag address are the completion signal
        let signals: Vec<u32> = ring
            .iter()
            .filter_map(|c| match *c {
                HwCommand::PipeControl { flags, address, data }
                    if flags.contains(PipeControlFlags::POST_SYNC_WRITE)
                        && address == submission.tag_address =>
                {
                    Some(data)
                }
                _ => None,
            })
            .collect();

        log::trace!(
            "software engine: flush {} task {} ({} ring, {} batch packets)",
            flush_stamp,
            submission.task_count,
            ring.len(),
            batch.len()
        );

        self.record(SubmissionRecord {
            flush_stamp,
            task_count: submission.task_count,
            ring,
            batch,
            residency: submission.residency.iter().map(|r| r.id).collect(),
            low_priority: submission.low_priority,
            throttle: submission.throttle,
        });

        for value in signals {
            if self.auto_complete {
                submission.tag.signal(value);
            } else {
                self.pending.lock().push(PendingSignal {
                    tag: Arc::clone(submission.tag),
                    value,
                });
            }
        }
        flush_stamp
    }

    fn name(&self) -> &'static str {
        "software"
    }
}

static_assertions::assert_impl_all!(SoftwareEngine: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::LinearStream;
    use cinder_mem::AlignedBuffer;

    fn ring_with_tag_write(tag_address: GpuAddr, value: u32) -> LinearStream {
        let mut ring = LinearStream::host(AlignedBuffer::new(128, 64).unwrap());
        HwCommand::PipeControl {
            flags: PipeControlFlags::CS_STALL | PipeControlFlags::POST_SYNC_WRITE,
            address: tag_address,
            data: value,
        }
        .encode(&mut ring)
        .unwrap();
        ring
    }

    #[test]
    fn test_immediate_completion() {
        let engine = SoftwareEngine::new();
        let tag = Arc::new(CompletionTag::new(0));
        let tag_address = GpuAddr::new(0x1000);
        let ring = ring_with_tag_write(tag_address, 1);

        let stamp = ring.with_contents(|bytes| {
            engine.submit(&Submission {
                ring: bytes,
                batch: &[],
                residency: &[],
                task_count: 1,
                tag: &tag,
                tag_address,
                low_priority: false,
                throttle: QueueThrottle::Medium,
            })
        });

        assert_eq!(stamp, 1);
        assert!(tag.is_reached(1));
        assert_eq!(engine.last_record().map(|r| r.task_count), Some(1));
    }

    #[test]
    fn test_deferred_completion() {
        let engine = SoftwareEngine::deferred();
        let tag = Arc::new(CompletionTag::new(0));
        let tag_address = GpuAddr::new(0x1000);
        let ring = ring_with_tag_write(tag_address, 5);

        ring.with_contents(|bytes| {
            engine.submit(&Submission {
                ring: bytes,
                batch: &[],
                residency: &[],
                task_count: 5,
                tag: &tag,
                tag_address,
                low_priority: true,
                throttle: QueueThrottle::Low,
            })
        });

        assert!(!tag.is_reached(5));
        assert_eq!(engine.pending_count(), 1);
        assert_eq!(engine.complete_pending(), 1);
        assert!(tag.is_reached(5));
    }

    #[test]
    fn test_writes_elsewhere_do_not_signal() {
        let engine = SoftwareEngine::new();
        let tag = Arc::new(CompletionTag::new(0));
        let ring = ring_with_tag_write(GpuAddr::new(0x2000), 7);

        ring.with_contents(|bytes| {
            engine.submit(&Submission {
                ring: bytes,
                batch: &[],
                residency: &[],
                task_count: 7,
                tag: &tag,
                tag_address: GpuAddr::new(0x1000),
                low_priority: false,
                throttle: QueueThrottle::Medium,
            })
        });
        assert_eq!(tag.load(), 0);
    }

    fn submit_tagged(engine: &SoftwareEngine, tag: &Arc<CompletionTag>, task_count: TaskCount) {
        let tag_address = GpuAddr::new(0x1000);
        let ring = ring_with_tag_write(tag_address, task_count);
        ring.with_contents(|bytes| {
            engine.submit(&Submission {
                ring: bytes,
                batch: &[],
                residency: &[],
                task_count,
                tag,
                tag_address,
                low_priority: false,
                throttle: QueueThrottle::Medium,
            })
        });
    }

    #[test]
    fn test_record_log_is_bounded() {
        let engine = SoftwareEngine::new();
        let tag = Arc::new(CompletionTag::new(0));
        for task_count in 1..=1000 {
            submit_tagged(&engine, &tag, task_count);
        }

        let records = engine.records();
        assert_eq!(records.len(), DEFAULT_RECORD_CAPACITY);
        let oldest = 1000 - DEFAULT_RECORD_CAPACITY as TaskCount + 1;
        assert_eq!(records.first().map(|r| r.task_count), Some(oldest));
        assert_eq!(engine.last_record().map(|r| r.task_count), Some(1000));
        assert!(tag.is_reached(1000));
    }

    #[test]
    fn test_recording_disabled() {
        let engine = SoftwareEngine::new().with_record_capacity(0);
        let tag = Arc::new(CompletionTag::new(0));
        submit_tagged(&engine, &tag, 1);

        assert!(engine.records().is_empty());
        assert!(tag.is_reached(1));
    }
}
