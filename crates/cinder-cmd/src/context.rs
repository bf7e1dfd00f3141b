//! # Contexts
//!
//! A context groups the queues working on one device. It owns device-side
//! enqueue state (the default device queue and the scheduler kernel) and an
//! optional instrumentation hook that observes every flush.

use alloc::sync::Arc;
use core::fmt;

use spin::Mutex;

use cinder_core::{QueueId, Result};

use crate::device::Device;
use crate::device_queue::DeviceQueue;
use crate::scheduler::SchedulerKernel;

/// Observer notified right before a command flushes
pub trait PreFlushHook: Send + Sync + fmt::Debug {
    /// Called with receiver ownership held, after all residency is set up
    fn notify_pre_flush(&self, queue: QueueId);
}

/// Device context
pub struct Context {
    device: Arc<Device>,
    device_queue: Option<DeviceQueue>,
    scheduler: Option<Mutex<SchedulerKernel>>,
    pre_flush_hook: Option<Arc<dyn PreFlushHook>>,
}

impl Context {
    /// Create a context on `device`
    ///
    /// Devices supporting device-side enqueue get a default device queue and
    /// a scheduler kernel.
    pub fn new(device: Arc<Device>, pre_flush_hook: Option<Arc<dyn PreFlushHook>>) -> Result<Arc<Self>> {
        let (device_queue, scheduler) = if device.hw_info().supports_device_enqueue {
            let mm = device.memory_manager();
            (
                Some(DeviceQueue::new(mm)?),
                Some(Mutex::new(SchedulerKernel::new(mm)?)),
            )
        } else {
            (None, None)
        };

        Ok(Arc::new(Self {
            device,
            device_queue,
            scheduler,
            pre_flush_hook,
        }))
    }

    /// Get the device
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Get the default device queue
    pub fn default_device_queue(&self) -> Option<&DeviceQueue> {
        self.device_queue.as_ref()
    }

    /// Get the scheduler kernel
    pub fn scheduler(&self) -> Option<&Mutex<SchedulerKernel>> {
        self.scheduler.as_ref()
    }

    /// Forward a pre-flush notification to the hook, if any
    pub fn notify_pre_flush(&self, queue: QueueId) {
        if let Some(hook) = &self.pre_flush_hook {
            hook.notify_pre_flush(queue);
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.device.id())
            .field("device_queue", &self.device_queue.is_some())
            .field("hook", &self.pre_flush_hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SoftwareEngine;
    use crate::registry::HardwareInfo;
    use crate::testing;
    use cinder_core::{DeviceId, MemoryConfig};

    #[test]
    fn test_device_enqueue_state_follows_hardware() {
        let context = Context::new(testing::device(), None).unwrap();
        assert!(context.default_device_queue().is_some());
        assert!(context.scheduler().is_some());

        let low_power = Device::new(
            DeviceId::new(2),
            HardwareInfo::LOW_POWER,
            &MemoryConfig::new(),
            Arc::new(SoftwareEngine::new()),
        )
        .unwrap();
        let context = Context::new(low_power, None).unwrap();
        assert!(context.default_device_queue().is_none());
    }

    #[test]
    fn test_hook_notified() {
        let hook = Arc::new(testing::CountingHook::default());
        let context = Context::new(testing::device(), Some(hook.clone())).unwrap();
        context.notify_pre_flush(QueueId::new(4));
        assert_eq!(hook.count(), 1);
    }
}
