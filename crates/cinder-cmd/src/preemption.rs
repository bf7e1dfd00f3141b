//! Preemption granularity selection.

use crate::device::Device;
use crate::kernel::Kernel;

/// Granularity at which the engine may preempt submitted work
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PreemptionMode {
    /// Never preempted
    #[default]
    Disabled = 1,
    /// Between batch buffers
    MidBatch = 2,
    /// Between thread groups
    ThreadGroup = 3,
    /// Between instructions
    MidThread = 4,
}

impl PreemptionMode {
    /// Parse a settings value
    pub const fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(PreemptionMode::Disabled),
            2 => Some(PreemptionMode::MidBatch),
            3 => Some(PreemptionMode::ThreadGroup),
            4 => Some(PreemptionMode::MidThread),
            _ => None,
        }
    }

    /// Value programmed into the preemption state packet
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

/// Preemption policy
#[derive(Debug)]
pub struct PreemptionHelper;

impl PreemptionHelper {
    /// Mode for a task submitted on `device`, optionally running `kernel`
    ///
    /// Kernels that sample media cannot be preempted between thread groups;
    /// kernels opting out of mid-thread preemption fall back to thread-group
    /// granularity.
    pub fn task_preemption_mode(device: &Device, kernel: Option<&Kernel>) -> PreemptionMode {
        let device_mode = device.preemption_mode();
        if device_mode == PreemptionMode::Disabled {
            return device_mode;
        }

        if let Some(kernel) = kernel {
            if kernel.is_vme_kernel() && device_mode > PreemptionMode::MidBatch {
                return PreemptionMode::MidBatch;
            }
            if kernel.disables_mid_thread_preemption() && device_mode > PreemptionMode::ThreadGroup
            {
                return PreemptionMode::ThreadGroup;
            }
        }
        device_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelInfo;
    use crate::testing;
    use cinder_core::settings::keys;

    #[test]
    fn test_from_raw() {
        assert_eq!(PreemptionMode::from_raw(3), Some(PreemptionMode::ThreadGroup));
        assert_eq!(PreemptionMode::from_raw(-1), None);
        assert_eq!(PreemptionMode::MidThread.raw(), 4);
    }

    #[test]
    fn test_device_default_without_kernel() {
        let device = testing::device();
        assert_eq!(
            PreemptionHelper::task_preemption_mode(&device, None),
            device.hw_info().default_preemption
        );
    }

    #[test]
    fn test_kernel_restrictions() {
        let device = testing::device_with(|c| c.set_int(keys::FORCE_PREEMPTION_MODE, 4));
        let vme = testing::kernel(&device, KernelInfo { is_vme: true, ..KernelInfo::default() });
        let no_mid_thread = testing::kernel(
            &device,
            KernelInfo { disable_mid_thread_preemption: true, ..KernelInfo::default() },
        );

        assert_eq!(
            PreemptionHelper::task_preemption_mode(&device, Some(&vme)),
            PreemptionMode::MidBatch
        );
        assert_eq!(
            PreemptionHelper::task_preemption_mode(&device, Some(&no_mid_thread)),
            PreemptionMode::ThreadGroup
        );
    }

    #[test]
    fn test_disabled_device_ignores_kernel() {
        let device = testing::device_with(|c| c.set_int(keys::FORCE_PREEMPTION_MODE, 1));
        let vme = testing::kernel(&device, KernelInfo { is_vme: true, ..KernelInfo::default() });
        assert_eq!(
            PreemptionHelper::task_preemption_mode(&device, Some(&vme)),
            PreemptionMode::Disabled
        );
    }
}
