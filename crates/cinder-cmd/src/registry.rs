//! # Device Registry
//!
//! Hardware descriptions and the explicit table of devices a platform owns.
//! Devices are registered once and looked up by ID; nothing is global.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;

use cinder_core::{ByteSize, ConfigProvider, DeviceId, Error, Result};

use crate::device::Device;
use crate::engine::HwEngine;
use crate::preemption::PreemptionMode;

// =============================================================================
// HARDWARE INFO
// =============================================================================

/// Static description of a device model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareInfo {
    /// Marketing name
    pub name: &'static str,
    /// Preemption granularity when no override is set
    pub default_preemption: PreemptionMode,
    /// Kernels may enqueue child kernels on the device
    pub supports_device_enqueue: bool,
    /// Coherency mode can be switched per flush
    pub supports_coherency: bool,
    /// Device memory available to the memory manager
    pub memory_size: ByteSize,
}

impl HardwareInfo {
    /// Generic compute device
    pub const GENERIC: HardwareInfo = HardwareInfo {
        name: "generic-compute",
        default_preemption: PreemptionMode::ThreadGroup,
        supports_device_enqueue: true,
        supports_coherency: true,
        memory_size: ByteSize::from_mib(256),
    };

    /// Low-power device without device-side enqueue
    pub const LOW_POWER: HardwareInfo = HardwareInfo {
        name: "low-power-compute",
        default_preemption: PreemptionMode::MidBatch,
        supports_device_enqueue: false,
        supports_coherency: false,
        memory_size: ByteSize::from_mib(64),
    };
}

impl Default for HardwareInfo {
    fn default() -> Self {
        Self::GENERIC
    }
}

// =============================================================================
// DEVICE REGISTRY
// =============================================================================

/// Devices known to a platform
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, Arc<Device>>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create one device per hardware description, all sharing `engine`
    pub fn with_devices(
        hw_infos: &[HardwareInfo],
        config: &dyn ConfigProvider,
        engine: Arc<dyn HwEngine>,
    ) -> Result<Self> {
        let mut registry = Self::new();
        for (index, hw_info) in hw_infos.iter().enumerate() {
            let id = DeviceId::new(index as u64 + 1);
            registry.register(Device::new(id, hw_info.clone(), config, Arc::clone(&engine))?)?;
        }
        Ok(registry)
    }

    /// Add a device
    pub fn register(&mut self, device: Arc<Device>) -> Result<()> {
        let id = device.id();
        if self.devices.contains_key(&id) {
            return Err(Error::AlreadyExists);
        }
        log::debug!("registry: device {:?} ({})", id, device.hw_info().name);
        self.devices.insert(id, device);
        Ok(())
    }

    /// Look up a device
    pub fn get(&self, id: DeviceId) -> Result<Arc<Device>> {
        self.devices.get(&id).cloned().ok_or(Error::NotFound)
    }

    /// Devices in ID order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Device>> {
        let mut devices: Vec<_> = self.devices.values().collect();
        devices.sort_by_key(|d| d.id());
        devices.into_iter()
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
