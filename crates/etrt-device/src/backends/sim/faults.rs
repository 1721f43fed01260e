//! One-shot fault injection for the simulator

use crate::layer::{CommandKind, DeviceErrorCode, DeviceIndex, ErrorContext};
use parking_lot::Mutex;

/// Which command a rule fires on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTarget {
    /// Next command of any kind
    NextCommand,
    /// Next host-to-device, device-to-host, device-to-device or code load
    NextDma,
    NextHostToDevice,
    NextDeviceToHost,
    NextKernelLaunch,
}

impl FaultTarget {
    fn matches(self, kind: CommandKind) -> bool {
        match self {
            FaultTarget::NextCommand => true,
            FaultTarget::NextDma => kind.is_dma(),
            FaultTarget::NextHostToDevice => kind == CommandKind::HostToDevice,
            FaultTarget::NextDeviceToHost => kind == CommandKind::DeviceToHost,
            FaultTarget::NextKernelLaunch => kind == CommandKind::KernelLaunch,
        }
    }
}

/// What the matched command reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFault {
    /// Plain failure with an error code
    Fail {
        code: DeviceErrorCode,
        shire_mask: Option<u64>,
    },
    /// Fatal kernel abort carrying diagnostics
    Abort { context: ErrorContext },
}

/// A fault that fires once on the first matching command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultRule {
    /// Restrict to one device, any device when `None`
    pub device: Option<DeviceIndex>,
    pub target: FaultTarget,
    pub fault: InjectedFault,
}

impl FaultRule {
    pub fn fail(target: FaultTarget, code: DeviceErrorCode) -> Self {
        Self {
            device: None,
            target,
            fault: InjectedFault::Fail { code, shire_mask: None },
        }
    }

    pub fn abort_kernel(context: ErrorContext) -> Self {
        Self {
            device: None,
            target: FaultTarget::NextKernelLaunch,
            fault: InjectedFault::Abort { context },
        }
    }

    pub fn on_device(mut self, device: DeviceIndex) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_shire_mask(mut self, mask: u64) -> Self {
        if let InjectedFault::Fail { shire_mask, .. } = &mut self.fault {
            *shire_mask = Some(mask);
        }
        self
    }
}

/// Pending rules in arming order
#[derive(Default)]
pub struct FaultInjector {
    rules: Mutex<Vec<FaultRule>>,
}

impl FaultInjector {
    pub fn arm(&self, rule: FaultRule) {
        self.rules.lock().push(rule);
    }

    pub fn pending(&self) -> usize {
        self.rules.lock().len()
    }

    /// Remove and return the first rule matching this command
    pub fn take(&self, device: DeviceIndex, kind: CommandKind) -> Option<InjectedFault> {
        let mut rules = self.rules.lock();
        let pos = rules
            .iter()
            .position(|r| r.device.map_or(true, |d| d == device) && r.target.matches(kind))?;
        Some(rules.remove(pos).fault)
    }
}
