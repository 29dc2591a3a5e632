//! Mock drivers and a simulated framework shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devframe_hal::sim::{SimHal, SimSecurity};
use devframe_types::{
    DeviceIdentity, DriverError, DriverFlags, DriverType, MatchEntry, PowerState,
};

use crate::config::KernelConfig;
use crate::device::Device;
use crate::driver::{Driver, DriverDescriptor, InterruptHandler, IrqReturn, PowerManagement};
use crate::framework::DeviceFramework;

pub(crate) const NIC: DeviceIdentity = DeviceIdentity::new(0x8086, 0x100e, 0x02_00_00);
pub(crate) const DISK: DeviceIdentity = DeviceIdentity::new(0x144d, 0xa808, 0x01_08_02);

type Hook = Box<dyn Fn(&Device) + Send + Sync>;

/// Configurable driver that counts every call it receives.
#[derive(Default)]
pub(crate) struct MockDriver {
    pub probes: AtomicUsize,
    pub removes: AtomicUsize,
    pub suspends: AtomicUsize,
    pub resumes: AtomicUsize,
    pub irqs: AtomicUsize,
    pub power_calls: Mutex<Vec<PowerState>>,
    pub last_match_data: Mutex<Option<u64>>,
    /// Number of upcoming probes that fail.
    failing_probes: AtomicUsize,
    probe_delay: Option<Duration>,
    panic_in_probe: bool,
    power_managed: bool,
    reject_power: bool,
    on_remove: Option<Hook>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always_failing() -> Self {
        Self::failing(usize::MAX)
    }

    pub fn failing(probes: usize) -> Self {
        let driver = Self::default();
        driver.failing_probes.store(probes, Ordering::SeqCst);
        driver
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            probe_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic_in_probe: true,
            ..Self::default()
        }
    }

    pub fn power_managed() -> Self {
        Self {
            power_managed: true,
            ..Self::default()
        }
    }

    pub fn power_rejecting() -> Self {
        Self {
            power_managed: true,
            reject_power: true,
            ..Self::default()
        }
    }

    pub fn with_power_management(mut self) -> Self {
        self.power_managed = true;
        self
    }

    pub fn on_remove(mut self, hook: impl Fn(&Device) + Send + Sync + 'static) -> Self {
        self.on_remove = Some(Box::new(hook));
        self
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }
}

impl Driver for MockDriver {
    fn probe(&self, _device: &Device, matched: Option<&MatchEntry>) -> Result<(), DriverError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        *self.last_match_data.lock().unwrap() = matched.map(|m| m.driver_data);
        if let Some(delay) = self.probe_delay {
            std::thread::sleep(delay);
        }
        if self.panic_in_probe {
            panic!("mock probe panic");
        }
        let remaining = self.failing_probes.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.failing_probes.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(DriverError::Hardware);
        }
        Ok(())
    }

    fn remove(&self, device: &Device) -> Result<(), DriverError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.on_remove {
            hook(device);
        }
        Ok(())
    }

    fn power(&self) -> Option<&dyn PowerManagement> {
        self.power_managed.then_some(self as &dyn PowerManagement)
    }

    fn interrupt(&self) -> Option<&dyn InterruptHandler> {
        Some(self as &dyn InterruptHandler)
    }
}

impl PowerManagement for MockDriver {
    fn suspend(&self, _device: &Device) -> Result<(), DriverError> {
        self.suspends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self, _device: &Device) -> Result<(), DriverError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_power_state(&self, _device: &Device, state: PowerState) -> Result<(), DriverError> {
        if self.reject_power {
            return Err(DriverError::NotSupported);
        }
        self.power_calls.lock().unwrap().push(state);
        Ok(())
    }
}

impl InterruptHandler for MockDriver {
    fn handle_interrupt(&self, _device: &Device, irq: u32) -> IrqReturn {
        self.irqs.fetch_add(1, Ordering::SeqCst);
        if irq == 11 {
            IrqReturn::Handled
        } else {
            IrqReturn::NotMine
        }
    }
}

pub(crate) struct Harness {
    pub hal: Arc<SimHal>,
    pub security: Arc<SimSecurity>,
    pub framework: DeviceFramework,
}

pub(crate) fn harness() -> Harness {
    harness_with(KernelConfig {
        sandbox_pool_bytes: 4096,
        ..KernelConfig::default()
    })
}

pub(crate) fn harness_with(config: KernelConfig) -> Harness {
    let hal = Arc::new(SimHal::new());
    let security = Arc::new(SimSecurity::new());
    let framework = DeviceFramework::new(hal.clone(), security.clone(), config);
    Harness {
        hal,
        security,
        framework,
    }
}

pub(crate) fn nic_driver(name: &str, ops: Arc<MockDriver>) -> DriverDescriptor {
    DriverDescriptor::new(name, DriverType::Network, ops)
        .with_flags(DriverFlags::HOTPLUG)
        .with_match(MatchEntry::pci(0x8086, 0x100e).with_driver_data(0xE1000))
}

pub(crate) fn disk_driver(name: &str, ops: Arc<MockDriver>) -> DriverDescriptor {
    DriverDescriptor::new(name, DriverType::Storage, ops)
        .with_match(MatchEntry::class(0x01_08_00, 0xFF_FF_00))
}
