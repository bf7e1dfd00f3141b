//! # Kernel Dispatch Command
//!
//! Submits a staged [`KernelOperation`]. The bundle's private command buffer
//! is copied into the queue stream, everything the dispatch touches is made
//! resident, and parent kernels additionally get the device scheduler
//! appended behind them.
//!
//! ```text
//!   queue stream:  ... │ bundle commands │ scheduler dispatch (parent) │ BB_END
//!                        ▲
//!                        └── flush offset
//! ```
//!
//! A parent dispatch holds the device queue critical section from before the
//! queue is reset until its flush returns.

use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_core::{unrecoverable, unrecoverable_if, TaskLevel, TASK_LEVEL_NOT_READY};

use crate::flags::{CompletionStamp, DispatchFlags};
use crate::kernel::Kernel;
use crate::operation::KernelOperation;
use crate::preemption::PreemptionMode;
use crate::printf::PrintfHandler;
use crate::queue::CommandQueue;
use crate::scheduler::SchedulerArgs;
use crate::surface::Surface;
use crate::timestamp::DependencyContainer;

/// Queue stream bytes reserved for a scheduler dispatch
const SCHEDULER_DISPATCH_RESERVE: usize = 256;

/// A staged kernel dispatch
#[derive(Debug)]
pub struct CommandComputeKernel {
    command_queue: Arc<CommandQueue>,
    kernel_operation: KernelOperation,
    surfaces: Vec<Surface>,
    flush_dc: bool,
    slm_used: bool,
    nd_range_kernel: bool,
    printf_handler: Option<PrintfHandler>,
    preemption_mode: PreemptionMode,
    kernel: Arc<Kernel>,
    kernel_count: u32,
    current_timestamp_packet_nodes: DependencyContainer,
    previous_timestamp_packet_nodes: DependencyContainer,
    events_request: DependencyContainer,
    completion_stamp: CompletionStamp,
}

impl CommandComputeKernel {
    /// Create a dispatch of `kernel` from a staged bundle
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        command_queue: Arc<CommandQueue>,
        kernel_operation: KernelOperation,
        surfaces: Vec<Surface>,
        flush_dc: bool,
        slm_used: bool,
        nd_range_kernel: bool,
        printf_handler: Option<PrintfHandler>,
        preemption_mode: PreemptionMode,
        kernel: Arc<Kernel>,
        kernel_count: u32,
    ) -> Self {
        Self {
            command_queue,
            kernel_operation,
            surfaces,
            flush_dc,
            slm_used,
            nd_range_kernel,
            printf_handler,
            preemption_mode,
            kernel,
            kernel_count,
            current_timestamp_packet_nodes: DependencyContainer::new(),
            previous_timestamp_packet_nodes: DependencyContainer::new(),
            events_request: DependencyContainer::new(),
            completion_stamp: CompletionStamp::default(),
        }
    }

    /// Keep the dispatch's own nodes and its predecessors' nodes alive
    pub fn set_timestamp_packet_nodes(
        &mut self,
        current: &DependencyContainer,
        previous: &DependencyContainer,
    ) {
        self.current_timestamp_packet_nodes
            .assign_and_increment_refs(current);
        self.previous_timestamp_packet_nodes
            .assign_and_increment_refs(previous);
    }

    /// Wait on nodes produced outside this device before running
    pub fn set_events_request(&mut self, nodes: &DependencyContainer) {
        self.events_request.assign_and_increment_refs(nodes);
    }

    /// Get the dispatched kernel
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Get the staged bundle
    pub fn kernel_operation(&self) -> &KernelOperation {
        &self.kernel_operation
    }

    /// Stamp of the last real submission
    pub fn completion_stamp(&self) -> CompletionStamp {
        self.completion_stamp
    }

    /// Flush the dispatch and wait for it
    pub fn submit(&mut self, task_level: TaskLevel, terminated: bool) -> CompletionStamp {
        if terminated {
            return self.completion_stamp;
        }

        let queue = Arc::clone(&self.command_queue);
        let context = Arc::clone(queue.context());
        let device = context.device();
        let parent = self.kernel.is_parent_kernel();

        let mut csr = device.csr().obtain_unique_ownership();

        let em_section = if parent {
            let Some(device_queue) = context.default_device_queue() else {
                unrecoverable!("kernel {}: parent dispatch without a device queue", self.kernel.id());
            };
            Some((device_queue, device_queue.enter_em_critical_section()))
        } else {
            None
        };

        let commands_size = self.kernel_operation.command_stream().used();
        let reserve = if parent { SCHEDULER_DISPATCH_RESERVE } else { 0 };
        let mut queue_stream = queue.get_cs(commands_size + reserve);
        let offset = queue_stream.used();
        let copied = self
            .kernel_operation
            .command_stream()
            .with_contents(|commands| queue_stream.append(commands));
        if let Err(e) = copied {
            unrecoverable!("kernel {}: cannot copy {} command bytes: {}", self.kernel.id(), commands_size, e);
        }

        let mut requires_coherency = false;
        for surface in &self.surfaces {
            surface.make_resident(&mut csr);
            requires_coherency |= surface.is_coherent();
        }

        if let Some(printf) = &self.printf_handler {
            printf.make_resident(&mut csr);
        }

        self.current_timestamp_packet_nodes.make_resident(&mut csr);
        self.previous_timestamp_packet_nodes.make_resident(&mut csr);

        let mut slm_used = self.slm_used;
        if let Some((device_queue, _)) = &em_section {
            let task_count = csr.peek_task_count() + 1;
            let (dsh, ssh) = self.kernel_operation.dsh_and_ssh_mut();
            if let Err(e) = device_queue.setup_execution_model_dispatch(
                ssh,
                dsh,
                &self.kernel,
                self.kernel_count,
                task_count,
            ) {
                unrecoverable!("kernel {}: execution model setup failed: {}", self.kernel.id(), e);
            }

            let (Some(scheduler), Some(reflection_surface)) =
                (context.scheduler(), self.kernel.reflection_surface())
            else {
                unrecoverable!("kernel {}: parent dispatch without scheduler state", self.kernel.id());
            };
            let mut scheduler = scheduler.lock();
            let args = SchedulerArgs {
                queue_buffer: device_queue.queue_buffer(),
                stack_buffer: device_queue.stack_buffer(),
                event_pool_buffer: device_queue.event_pool_buffer(),
                slb_buffer: device_queue.slb_buffer(),
                dsh: self.kernel_operation.dsh().graphics_allocation(),
                reflection_surface,
                queue_storage_buffer: device_queue.queue_storage_buffer(),
                ssh: self.kernel_operation.ssh().graphics_allocation(),
                debug_queue: device_queue.debug_queue(),
            };
            scheduler.set_args(&args);
            if let Err(e) = device_queue.dispatch_scheduler(
                &mut queue_stream,
                &scheduler,
                self.preemption_mode,
                self.kernel_operation.ssh(),
                self.kernel_operation.dsh(),
            ) {
                unrecoverable!("kernel {}: scheduler dispatch failed: {}", self.kernel.id(), e);
            }
            scheduler.make_resident(&mut csr, &args);
            slm_used |= scheduler.slm_total_size() > 0;

            self.kernel
                .program()
                .block_kernel_manager()
                .make_internal_allocations_resident(&mut csr);
        }

        let out_of_device_dependencies = device
            .csr()
            .timestamp_packet_write_enabled()
            .then_some(&self.events_request);
        let flags = DispatchFlags {
            blocking: true,
            dc_flush: self.flush_dc,
            use_slm: slm_used,
            guard_command_buffer_with_pipe_control: true,
            gsba_32bit_required: self.nd_range_kernel,
            requires_coherency,
            low_priority: queue.priority().is_low(),
            throttle: queue.throttle(),
            preemption_mode: self.preemption_mode,
            media_sampler_required: self.kernel.is_vme_kernel(),
            out_of_device_dependencies,
            timestamp_packet_for_pipe_control_write: None,
        };

        unrecoverable_if!(
            task_level >= TASK_LEVEL_NOT_READY,
            "kernel {}: task level {:#x} is not ready",
            self.kernel.id(),
            task_level
        );
        context.notify_pre_flush(queue.id());

        let stamp = csr.flush_task(
            &mut queue_stream,
            offset,
            self.kernel_operation.dsh(),
            self.kernel_operation.ioh(),
            self.kernel_operation.ssh(),
            task_level,
            &flags,
            device,
        );
        drop(queue_stream);
        drop(em_section);
        drop(csr);

        queue.wait_until_complete(stamp.task_count, stamp.flush_stamp);

        if let Some(printf) = &self.printf_handler {
            printf.print_enqueue_output();
        }

        log::trace!(
            "kernel {} '{}' completed task {}",
            self.kernel.id(),
            self.kernel.info().name,
            stamp.task_count
        );
        self.completion_stamp = stamp;
        stamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PreFlushHook;
    use crate::device::Device;
    use crate::encoder::HwCommand;
    use crate::flags::{QueuePriority, QueueThrottle};
    use crate::kernel::KernelInfo;
    use crate::mem_obj::MemObj;
    use crate::testing;
    use alloc::vec;
    use cinder_core::settings::keys;
    use cinder_core::ByteSize;
    use cinder_mem::AllocationFlags;
    use std::sync::Barrier;
    use std::thread;

    fn queue_with(device: Arc<Device>, hook: Option<Arc<dyn PreFlushHook>>) -> Arc<CommandQueue> {
        let context = testing::context_with_hook(device, hook);
        CommandQueue::new(context, QueuePriority::default(), QueueThrottle::default()).unwrap()
    }

    fn dispatch(queue: &Arc<CommandQueue>, kernel: &Arc<Kernel>, surfaces: Vec<Surface>) -> CommandComputeKernel {
        let device = queue.context().device();
        let mut op = KernelOperation::allocate(device, 1024, ByteSize::KIB_4, false).unwrap();
        op.stage_walker(kernel, [8, 1, 1], &surfaces).unwrap();
        CommandComputeKernel::new(
            Arc::clone(queue),
            op,
            surfaces,
            false,
            kernel.slm_total_size() > 0,
            true,
            None,
            PreemptionMode::ThreadGroup,
            Arc::clone(kernel),
            1,
        )
    }

    #[test]
    fn test_dispatch_copies_bundle_and_flushes() {
        let (device, engine) = testing::device_and_engine(|_| {});
        let queue = queue_with(Arc::clone(&device), None);
        let kernel = testing::kernel(&device, KernelInfo::default());

        let mut command = dispatch(&queue, &kernel, Vec::new());
        let stamp = command.submit(0, false);

        assert_eq!(stamp.task_count, 1);
        assert_eq!(device.csr().completed_task_count(), 1);
        let record = engine.last_record().unwrap();
        assert_eq!(record.walker_count(), 1);
        assert_eq!(record.batch.last(), Some(&HwCommand::BatchBufferEnd));

        let flags = device.csr().last_dispatch_flags().unwrap();
        assert!(flags.blocking);
        assert!(flags.guard_command_buffer_with_pipe_control);
        assert!(flags.gsba_32bit_required);
        assert!(!flags.requires_coherency);
    }

    #[test]
    fn test_any_coherent_surface_requires_coherency() {
        let device = testing::device();
        let queue = queue_with(Arc::clone(&device), None);
        let kernel = testing::kernel(&device, KernelInfo::default());
        let plain = MemObj::create_buffer(&device, 64, false).unwrap();
        let shared = MemObj::create_buffer(&device, 64, false).unwrap();

        let surfaces = vec![
            Surface::with_coherency(plain, false),
            Surface::with_coherency(shared, true),
        ];
        let mut command = dispatch(&queue, &kernel, surfaces);
        command.submit(0, false);
        assert!(device.csr().last_dispatch_flags().unwrap().requires_coherency);
    }

    #[test]
    fn test_terminated_submit_leaves_stream_alone() {
        let device = testing::device();
        let queue = queue_with(Arc::clone(&device), None);
        let kernel = testing::kernel(&device, KernelInfo::default());
        let mut command = dispatch(&queue, &kernel, Vec::new());

        let before = queue.get_cs(0).used();
        assert_eq!(command.submit(0, true), CompletionStamp::default());
        assert_eq!(queue.get_cs(0).used(), before);
        assert_eq!(device.csr().peek_task_count(), 0);

        let stamp = command.submit(0, false);
        let used = queue.get_cs(0).used();
        assert_eq!(command.submit(0, true), stamp);
        assert_eq!(queue.get_cs(0).used(), used);
    }

    #[test]
    fn test_task_count_strictly_increases() {
        let device = testing::device();
        let queue = queue_with(Arc::clone(&device), None);
        let kernel = testing::kernel(&device, KernelInfo::default());

        let mut previous = 0;
        for level in 0..4 {
            let stamp = dispatch(&queue, &kernel, Vec::new()).submit(level, false);
            assert!(stamp.task_count > previous);
            previous = stamp.task_count;
        }
    }

    #[test]
    fn test_surfaces_and_printf_resident() {
        let (device, engine) = testing::device_and_engine(|c| c.set_uint(keys::PRINTF_BUFFER_SIZE, 4096));
        let queue = queue_with(Arc::clone(&device), None);
        let kernel = testing::kernel(&device, KernelInfo { slm_total_size: 1024, ..KernelInfo::default() });
        let buffer = MemObj::create_buffer(&device, 64, false).unwrap();
        let printf = PrintfHandler::new(&device).unwrap();
        let printf_id = printf.printf_surface().id();

        let mut op = KernelOperation::allocate(&device, 1024, ByteSize::KIB_4, true).unwrap();
        let surfaces = vec![Surface::new(Arc::clone(&buffer))];
        op.stage_walker(&kernel, [1, 1, 1], &surfaces).unwrap();
        let mut command = CommandComputeKernel::new(
            Arc::clone(&queue),
            op,
            surfaces,
            true,
            true,
            false,
            Some(printf),
            PreemptionMode::MidBatch,
            Arc::clone(&kernel),
            1,
        );
        command.submit(0, false);

        let record = engine.last_record().unwrap();
        assert!(record.residency.contains(&buffer.graphics_allocation().id()));
        assert!(record.residency.contains(&printf_id));
        let flags = device.csr().last_dispatch_flags().unwrap();
        assert!(flags.dc_flush && flags.use_slm);
        assert_eq!(flags.preemption_mode, PreemptionMode::MidBatch);
    }

    #[test]
    fn test_timestamp_nodes_resident_and_awaited() {
        let (device, engine) = testing::device_and_engine(|c| c.set_bool(keys::ENABLE_TIMESTAMP_PACKET, true));
        let queue = queue_with(Arc::clone(&device), None);
        let kernel = testing::kernel(&device, KernelInfo::default());
        let allocator = Arc::clone(device.csr().timestamp_packet_allocator().unwrap());

        let mut current = DependencyContainer::new();
        current.add(allocator.get_tag().unwrap());
        let previous = DependencyContainer::new();
        let mut external = DependencyContainer::new();
        external.add(allocator.get_tag().unwrap());

        let mut command = dispatch(&queue, &kernel, Vec::new());
        command.set_timestamp_packet_nodes(&current, &previous);
        command.set_events_request(&external);
        assert_eq!(current.peek(0).unwrap().ref_count(), 2);
        command.submit(0, false);

        let record = engine.last_record().unwrap();
        assert!(record.residency.contains(&allocator.graphics_allocation().id()));
        assert!(record.ring.iter().any(|c| matches!(c, HwCommand::SemaphoreWait { .. })));
        assert_eq!(device.csr().last_dispatch_flags().unwrap().dependency_count, 1);

        drop(command);
        assert_eq!(current.peek(0).unwrap().ref_count(), 1);
    }

    #[test]
    fn test_parent_dispatch_runs_scheduler() {
        let (device, engine) = testing::device_and_engine(|_| {});
        let queue = queue_with(Arc::clone(&device), None);
        let parent = testing::parent_kernel(&device, 2);

        let mut command = dispatch(&queue, &parent, Vec::new());
        let stamp = command.submit(0, false);

        let device_queue = queue.context().default_device_queue().unwrap();
        assert!(device_queue.is_em_critical_section_free());
        assert_eq!(device_queue.last_task_count(), stamp.task_count);
        assert_eq!(device_queue.scheduler_dispatch_count(), 1);

        let record = engine.last_record().unwrap();
        assert_eq!(record.walker_count(), 2);
        assert!(record.residency.contains(&device_queue.queue_buffer().id()));
        assert!(record.residency.contains(&parent.reflection_surface().unwrap().id()));
        assert!(device.csr().last_dispatch_flags().unwrap().use_slm);
    }

    #[test]
    fn test_parent_dispatch_phases_never_overlap() {
        let device = testing::device();
        let monitor = Arc::new(testing::SectionMonitor::default());
        let context = testing::context_with_hook(Arc::clone(&device), Some(monitor.clone()));
        monitor.attach(&context);
        let parent = testing::parent_kernel(&device, 1);
        let start = Arc::new(Barrier::new(4));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let context = Arc::clone(&context);
                let parent = Arc::clone(&parent);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    let queue =
                        CommandQueue::new(context, QueuePriority::default(), QueueThrottle::default()).unwrap();
                    start.wait();
                    for _ in 0..5 {
                        dispatch(&queue, &parent, Vec::new()).submit(0, false);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        // Every flush ran inside the section, one dispatch at a time
        assert_eq!(monitor.observed(), (20, 0));
        assert_eq!(monitor.max_concurrent(), 1);
        let device_queue = context.default_device_queue().unwrap();
        assert!(device_queue.is_em_critical_section_free());
        assert_eq!(device_queue.scheduler_dispatch_count(), 20);
    }

    #[test]
    fn test_bundle_heaps_returned_after_submit() {
        let device = testing::device();
        let queue = queue_with(Arc::clone(&device), None);
        let kernel = testing::kernel(&device, KernelInfo::default());

        let mut command = dispatch(&queue, &kernel, Vec::new());
        command.submit(0, false);
        let before = device.memory_manager().pool().stats().stored;
        drop(command);
        assert_eq!(device.memory_manager().pool().stats().stored - before, 3);
    }

    #[test]
    #[should_panic(expected = "not ready")]
    fn test_not_ready_level_is_fatal() {
        let device = testing::device();
        let queue = queue_with(Arc::clone(&device), None);
        let kernel = testing::kernel(&device, KernelInfo::default());
        dispatch(&queue, &kernel, Vec::new()).submit(TASK_LEVEL_NOT_READY, false);
    }

    #[test]
    fn test_coherent_allocation_inherited_by_surface() {
        let device = testing::device();
        let buffer = MemObj::create_buffer(&device, 64, true).unwrap();
        assert!(buffer.graphics_allocation().flags().contains(AllocationFlags::COHERENT));
        assert!(Surface::new(buffer).is_coherent());
    }
}
