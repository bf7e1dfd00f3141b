//! Shared test fixtures.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicUsize, Ordering};

use cinder_core::{ByteSize, DeviceId, MemoryConfig, QueueId};
use cinder_mem::{AllocationFlags, HeapType, IndirectHeap};

use crate::context::{Context, PreFlushHook};
use crate::device::Device;
use crate::engine::SoftwareEngine;
use crate::kernel::{Kernel, KernelInfo, Program};
use crate::registry::HardwareInfo;
use crate::stream::LinearStream;

const HEAP_SIZE: ByteSize = ByteSize::KIB_64;

fn build(engine: SoftwareEngine, configure: impl FnOnce(&mut MemoryConfig)) -> (Arc<Device>, Arc<SoftwareEngine>) {
    let mut config = MemoryConfig::new();
    configure(&mut config);
    let engine = Arc::new(engine);
    let device = Device::new(DeviceId::new(1), HardwareInfo::GENERIC, &config, engine.clone()).unwrap();
    (device, engine)
}

/// Generic device with default settings
pub(crate) fn device() -> Arc<Device> {
    device_with(|_| {})
}

/// Generic device with adjusted settings
pub(crate) fn device_with(configure: impl FnOnce(&mut MemoryConfig)) -> Arc<Device> {
    device_and_engine(configure).0
}

/// Device plus the engine it submits to
pub(crate) fn device_and_engine(
    configure: impl FnOnce(&mut MemoryConfig),
) -> (Arc<Device>, Arc<SoftwareEngine>) {
    build(SoftwareEngine::new(), configure)
}

/// Device whose engine completes only on `complete_pending`
pub(crate) fn deferred_device(
    configure: impl FnOnce(&mut MemoryConfig),
) -> (Arc<Device>, Arc<SoftwareEngine>) {
    build(SoftwareEngine::deferred(), configure)
}

/// Device-backed command stream
pub(crate) fn device_stream(device: &Device) -> LinearStream {
    let allocation = device
        .memory_manager()
        .allocate_graphics_memory(ByteSize::KIB_64, AllocationFlags::INTERNAL)
        .unwrap();
    LinearStream::device(allocation)
}

/// Dynamic state, indirect object and surface state heaps
pub(crate) fn heaps(device: &Device) -> [IndirectHeap; 3] {
    HeapType::ALL.map(|heap_type| {
        let allocation = device
            .memory_manager()
            .allocate_graphics_memory(HEAP_SIZE, AllocationFlags::INTERNAL)
            .unwrap();
        IndirectHeap::new(heap_type, allocation)
    })
}

/// Kernel from a program without block kernels
pub(crate) fn kernel(device: &Device, info: KernelInfo) -> Arc<Kernel> {
    Kernel::new(device.memory_manager(), Arc::new(Program::new()), info).unwrap()
}

/// Parent kernel whose program has `blocks` block kernels
pub(crate) fn parent_kernel(device: &Device, blocks: usize) -> Arc<Kernel> {
    let program = Program::with_block_kernels(device.memory_manager(), blocks, ByteSize::KIB_4).unwrap();
    Kernel::new(
        device.memory_manager(),
        Arc::new(program),
        KernelInfo { is_parent: true, ..KernelInfo::default() },
    )
    .unwrap()
}

/// Hook counting pre-flush notifications
#[derive(Debug, Default)]
pub(crate) struct CountingHook {
    count: AtomicUsize,
}

impl CountingHook {
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl PreFlushHook for CountingHook {
    fn notify_pre_flush(&self, _queue: QueueId) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hook recording whether the device queue critical section is held at flush,
/// and how many dispatches were ever inside the pre-flush phase at once
#[derive(Debug)]
pub(crate) struct SectionMonitor {
    context: spin::Once<Weak<Context>>,
    held: AtomicUsize,
    free: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Default for SectionMonitor {
    fn default() -> Self {
        Self {
            context: spin::Once::new(),
            held: AtomicUsize::new(0),
            free: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }
}

impl SectionMonitor {
    pub(crate) fn attach(&self, context: &Arc<Context>) {
        self.context.call_once(|| Arc::downgrade(context));
    }

    /// Flushes that saw the section held, and flushes that saw it free
    pub(crate) fn observed(&self) -> (usize, usize) {
        (self.held.load(Ordering::SeqCst), self.free.load(Ordering::SeqCst))
    }

    /// Most dispatches seen inside the hook at the same time
    pub(crate) fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl PreFlushHook for SectionMonitor {
    fn notify_pre_flush(&self, _queue: QueueId) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let context = self.context.get().and_then(Weak::upgrade);
        if let Some(queue) = context.as_ref().and_then(|c| c.default_device_queue()) {
            if queue.is_em_critical_section_free() {
                self.free.fetch_add(1, Ordering::SeqCst);
            } else {
                self.held.fetch_add(1, Ordering::SeqCst);
            }
        }

        // Keep the phase open long enough for other submitters to arrive
        for _ in 0..64 {
            std::thread::yield_now();
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Context over a fresh device with `hook` installed
pub(crate) fn context_with_hook(device: Arc<Device>, hook: Option<Arc<dyn PreFlushHook>>) -> Arc<Context> {
    Context::new(device, hook).unwrap()
}
