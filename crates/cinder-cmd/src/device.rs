//! Devices and device-wide ownership.

use alloc::sync::Arc;
use core::fmt;
use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use cinder_core::{ConfigProvider, DebugSettings, DeviceId, Result};
use cinder_mem::MemoryManager;

use crate::engine::HwEngine;
use crate::preemption::PreemptionMode;
use crate::receiver::{CommandStreamReceiver, ReceiverOwnership};
use crate::registry::HardwareInfo;

/// A compute device with one submission ring
pub struct Device {
    id: DeviceId,
    hw_info: HardwareInfo,
    settings: DebugSettings,
    memory_manager: Arc<MemoryManager>,
    csr: CommandStreamReceiver,
    /// Serializes device-wide operations; always taken before the receiver
    ownership: Mutex<()>,
}

impl Device {
    /// Create a device submitting to `engine`
    pub fn new(
        id: DeviceId,
        hw_info: HardwareInfo,
        config: &dyn ConfigProvider,
        engine: Arc<dyn HwEngine>,
    ) -> Result<Arc<Self>> {
        let settings = DebugSettings::from_provider(config);
        let memory_manager = Arc::new(MemoryManager::new(hw_info.memory_size));
        let csr = CommandStreamReceiver::new(engine, Arc::clone(&memory_manager), &settings)?;

        log::info!("device {:?}: {} ({})", id, hw_info.name, hw_info.memory_size);
        Ok(Arc::new(Self {
            id,
            hw_info,
            settings,
            memory_manager,
            csr,
            ownership: Mutex::new(()),
        }))
    }

    /// Get device ID
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Get hardware description
    pub fn hw_info(&self) -> &HardwareInfo {
        &self.hw_info
    }

    /// Get resolved settings
    pub fn settings(&self) -> &DebugSettings {
        &self.settings
    }

    /// Get the memory manager
    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory_manager
    }

    /// Get the submission ring
    pub fn csr(&self) -> &CommandStreamReceiver {
        &self.csr
    }

    /// Preemption mode for work on this device, honoring the override setting
    pub fn preemption_mode(&self) -> PreemptionMode {
        if self.settings.force_preemption_mode >= 0 {
            if let Some(mode) = PreemptionMode::from_raw(self.settings.force_preemption_mode) {
                return mode;
            }
            log::warn!(
                "device {:?}: ignoring invalid preemption override {}",
                self.id,
                self.settings.force_preemption_mode
            );
        }
        self.hw_info.default_preemption
    }

    /// Acquire the device and its receiver, in that order
    pub fn obtain_unique_ownership(&self) -> DeviceOwnership<'_> {
        let device = self.ownership.lock();
        let csr = self.csr.obtain_unique_ownership();
        DeviceOwnership {
            csr,
            _device: device,
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.hw_info.name)
            .field("csr", &self.csr)
            .finish()
    }
}

/// Device-wide exclusive access; dereferences to the receiver's ownership
pub struct DeviceOwnership<'a> {
    // Field order releases the receiver before the device
    csr: ReceiverOwnership<'a>,
    _device: MutexGuard<'a, ()>,
}

impl<'a> Deref for DeviceOwnership<'a> {
    type Target = ReceiverOwnership<'a>;

    fn deref(&self) -> &Self::Target {
        &self.csr
    }
}

impl DerefMut for DeviceOwnership<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.csr
    }
}

impl fmt::Debug for DeviceOwnership<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceOwnership").field("csr", &self.csr).finish()
    }
}

static_assertions::assert_impl_all!(Device: Send, Sync);
