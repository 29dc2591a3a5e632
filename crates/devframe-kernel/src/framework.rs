//! [`DeviceFramework`] – the device/driver registry.
//!
//! One registry lock guards both tables and every bind/unbind transition.
//! Lock order is registry → device; no framework lock is ever held while a
//! driver hook runs or a sandbox is being set up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use devframe_hal::{Hal, SecurityProvider};
use devframe_types::{
    DeviceHandle, DeviceState, DriverError, DriverHandle, DriverStats, FrameworkStats, PowerState,
};
use tracing::{debug, info, warn};

use crate::arena::Arena;
use crate::config::KernelConfig;
use crate::device::{Device, DeviceInfo};
use crate::driver::{Driver, DriverDescriptor, DriverInfo, DriverRecord};
use crate::sandbox::{CrashRecord, SandboxEnvelope};

/// How often a hot-unplug re-checks a device whose driver is still in `remove`.
const UNBIND_POLL: Duration = Duration::from_millis(1);

// ────────────────────────────────────────────────────────────────────────────
// Registry tables
// ────────────────────────────────────────────────────────────────────────────

pub(crate) struct Registry {
    pub drivers: Arena<DriverHandle, DriverRecord>,
    pub devices: Arena<DeviceHandle, Arc<Device>>,
    /// Registration order, used when probing a device against every driver.
    pub driver_order: Vec<DriverHandle>,
}

impl Registry {
    pub fn driver(&self, handle: DriverHandle) -> Result<&DriverRecord, DriverError> {
        self.drivers.get(handle).ok_or(DriverError::NoDevice)
    }

    pub fn driver_mut(&mut self, handle: DriverHandle) -> Result<&mut DriverRecord, DriverError> {
        self.drivers.get_mut(handle).ok_or(DriverError::NoDevice)
    }

    pub fn device(&self, handle: DeviceHandle) -> Result<&Arc<Device>, DriverError> {
        self.devices.get(handle).ok_or(DriverError::NoDevice)
    }

    fn find_driver(&self, name: &str) -> Option<DriverHandle> {
        self.drivers
            .iter()
            .find(|(_, record)| record.descriptor.name == name)
            .map(|(handle, _)| handle)
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    pub probes: AtomicU64,
    pub probe_time_us: AtomicU64,
    pub crashes: AtomicU64,
    pub permanent_failures: AtomicU64,
}

// ────────────────────────────────────────────────────────────────────────────
// DeviceFramework
// ────────────────────────────────────────────────────────────────────────────

/// Owns the driver and device tables and drives every device lifecycle
/// transition.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use devframe_hal::sim::{SimHal, SimSecurity};
/// use devframe_kernel::{Device, DeviceFramework, KernelConfig};
/// use devframe_types::{DeviceIdentity, DeviceState};
///
/// let framework = DeviceFramework::new(
///     Arc::new(SimHal::new()),
///     Arc::new(SimSecurity::new()),
///     KernelConfig::default(),
/// );
/// let handle = framework
///     .register_device(Device::new("nvme0", DeviceIdentity::new(0x144d, 0xa808, 0x01_08_02)))
///     .unwrap();
/// assert_eq!(framework.find_device(0x144d, 0xa808), Some(handle));
/// assert_eq!(framework.device(handle).unwrap().state(), DeviceState::Uninitialized);
/// ```
pub struct DeviceFramework {
    pub(crate) hal: Arc<dyn Hal>,
    pub(crate) security: Arc<dyn SecurityProvider>,
    pub(crate) config: KernelConfig,
    registry: Mutex<Registry>,
    pub(crate) counters: Counters,
}

impl DeviceFramework {
    pub fn new(
        hal: Arc<dyn Hal>,
        security: Arc<dyn SecurityProvider>,
        config: KernelConfig,
    ) -> Self {
        let registry = Registry {
            drivers: Arena::with_limit(config.max_drivers),
            devices: Arena::with_limit(config.max_devices),
            driver_order: Vec::new(),
        };
        Self {
            hal,
            security,
            config,
            registry: Mutex::new(registry),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn hal(&self) -> &Arc<dyn Hal> {
        &self.hal
    }

    pub(crate) fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── drivers ────────────────────────────────────────────────────────────

    /// Register a driver, create its sandbox and immediately try to bind it
    /// to every unbound device it matches.
    ///
    /// Probe failures during that initial enumeration are absorbed by crash
    /// recovery and do not fail the registration.
    ///
    /// # Errors
    ///
    /// * [`DriverError::Config`] for a malformed descriptor.
    /// * [`DriverError::NoMemory`] if the driver table is full or the
    ///   sandbox pool cannot be allocated.
    /// * [`DriverError::Busy`] if a driver with the same name exists.
    /// * Any security-provider error raised while creating the sandbox.
    pub fn register_driver(
        &self,
        descriptor: DriverDescriptor,
    ) -> Result<DriverHandle, DriverError> {
        descriptor.validate()?;
        let name = descriptor.name.clone();

        self.check_driver_slot(&self.lock_registry(), &name)?;

        // Sandbox setup talks to the HAL and the security provider; the
        // registry stays open meanwhile, so the slot is checked again below.
        let sandbox = SandboxEnvelope::create(
            &name,
            descriptor.driver_type,
            self.config.sandbox_pool_bytes,
            self.hal.as_ref(),
            self.security.as_ref(),
        )?;
        let record = DriverRecord {
            descriptor,
            sandbox: Arc::new(sandbox),
            load_time_us: self.hal.now_us(),
            bound_devices: 0,
            error_count: 0,
            retiring: false,
        };

        let inserted = {
            let mut registry = self.lock_registry();
            match self.check_driver_slot(&registry, &name) {
                Err(err) => Err((record, err)),
                Ok(()) => match registry.drivers.insert(record) {
                    Ok(handle) => {
                        registry.driver_order.push(handle);
                        Ok(handle)
                    }
                    Err(record) => Err((record, DriverError::NoMemory)),
                },
            }
        };
        let handle = match inserted {
            Ok(handle) => handle,
            Err((record, err)) => {
                record
                    .sandbox
                    .destroy(self.hal.as_ref(), self.security.as_ref());
                return Err(err);
            }
        };
        info!(driver = %name, %handle, "driver registered");

        let bound = self.enumerate_and_probe(handle).unwrap_or(0);
        if bound > 0 {
            info!(driver = %name, bound, "driver claimed existing devices");
        }
        Ok(handle)
    }

    fn check_driver_slot(&self, registry: &Registry, name: &str) -> Result<(), DriverError> {
        if registry.drivers.is_full() {
            warn!(driver = %name, limit = self.config.max_drivers, "driver table full");
            return Err(DriverError::NoMemory);
        }
        if registry.find_driver(name).is_some() {
            return Err(DriverError::Busy);
        }
        Ok(())
    }

    /// Unbind every device using the driver (calling `remove` on each),
    /// drop it from the table, then destroy its sandbox.
    ///
    /// Devices the driver had driven into `Error` return to
    /// `Uninitialized`, since the dead binding no longer exists.
    ///
    /// # Errors
    ///
    /// [`DriverError::NoDevice`] for a stale handle; [`DriverError::Busy`]
    /// while one of its devices is mid-probe or the driver is already being
    /// unregistered.
    pub fn unregister_driver(&self, handle: DriverHandle) -> Result<(), DriverError> {
        let bound: Vec<DeviceHandle> = {
            let mut registry = self.lock_registry();
            registry.driver(handle)?;
            let mut probing = false;
            let bound: Vec<DeviceHandle> = registry
                .devices
                .iter()
                .filter_map(|(device, dev)| {
                    let inner = dev.lock();
                    probing |= inner.driver == Some(handle) && inner.probing;
                    (inner.driver == Some(handle)).then_some(device)
                })
                .collect();
            let record = registry.driver_mut(handle)?;
            if record.retiring || probing {
                return Err(DriverError::Busy);
            }
            record.retiring = true;
            bound
        };

        for device in bound {
            if let Err(err) = self.unbind(device) {
                warn!(%device, driver = %handle, error = %err, "unbind during driver teardown failed");
            }
        }

        let record = {
            let mut registry = self.lock_registry();
            let record = registry.drivers.remove(handle);
            registry.driver_order.retain(|h| *h != handle);
            for (_, dev) in registry.devices.iter() {
                let mut inner = dev.lock();
                if inner.failed_driver == Some(handle) {
                    inner.failed_driver = None;
                    if inner.state == DeviceState::Error {
                        inner.state = DeviceState::Uninitialized;
                    }
                }
            }
            record
        };
        let record = record.ok_or(DriverError::NoDevice)?;
        record
            .sandbox
            .destroy(self.hal.as_ref(), self.security.as_ref());
        info!(driver = %record.descriptor.name, %handle, "driver unregistered");
        Ok(())
    }

    pub fn find_driver(&self, name: &str) -> Option<DriverHandle> {
        self.lock_registry().find_driver(name)
    }

    pub fn driver_info(&self, handle: DriverHandle) -> Result<DriverInfo, DriverError> {
        let registry = self.lock_registry();
        let record = registry.driver(handle)?;
        Ok(DriverInfo::from_record(handle, record))
    }

    pub fn driver_stats(&self, handle: DriverHandle) -> Result<DriverStats, DriverError> {
        Ok(self.lock_registry().driver(handle)?.stats())
    }

    /// The driver's sandbox. Outlives unregistration as a dead envelope
    /// whose pool is no longer reachable.
    pub fn sandbox(&self, handle: DriverHandle) -> Result<Arc<SandboxEnvelope>, DriverError> {
        Ok(Arc::clone(&self.lock_registry().driver(handle)?.sandbox))
    }

    pub fn crash_record(&self, driver: DriverHandle, device: DeviceHandle) -> Option<CrashRecord> {
        let registry = self.lock_registry();
        registry.drivers.get(driver)?.sandbox.crash_record(device)
    }

    /// Snapshot of every registered driver, in registration order.
    pub fn drivers(&self) -> Vec<DriverInfo> {
        let registry = self.lock_registry();
        registry
            .driver_order
            .iter()
            .filter_map(|handle| {
                registry
                    .drivers
                    .get(*handle)
                    .map(|record| DriverInfo::from_record(*handle, record))
            })
            .collect()
    }

    // ── devices ────────────────────────────────────────────────────────────

    /// Add a device to the registry. The device is not probed; see
    /// [`DeviceFramework::probe_device`] and [`DeviceFramework::auto_bind`].
    ///
    /// # Errors
    ///
    /// * [`DriverError::Config`] for an invalid name or too many resources.
    /// * [`DriverError::NoMemory`] if the device table is full.
    /// * [`DriverError::Busy`] if a device with the same name exists.
    /// * [`DriverError::NoDevice`] if the declared parent is unknown.
    pub fn register_device(&self, device: Device) -> Result<DeviceHandle, DriverError> {
        device.validate()?;
        let device = Arc::new(device);
        let handle = {
            let mut registry = self.lock_registry();
            if registry.devices.is_full() {
                warn!(name = device.name(), limit = self.config.max_devices, "device table full");
                return Err(DriverError::NoMemory);
            }
            if registry
                .devices
                .iter()
                .any(|(_, existing)| existing.name() == device.name())
            {
                return Err(DriverError::Busy);
            }
            let parent = match device.parent() {
                Some(parent) => Some(Arc::clone(registry.device(parent)?)),
                None => None,
            };
            let handle = registry
                .devices
                .insert(Arc::clone(&device))
                .map_err(|_| DriverError::NoMemory)?;
            device.assign_handle(handle);
            if let Some(parent) = parent {
                parent.lock().children.push(handle);
            }
            handle
        };
        let id = device.identity();
        info!(
            device = %handle,
            name = device.name(),
            vendor = format_args!("{:#06x}", id.vendor_id),
            product = format_args!("{:#06x}", id.device_id),
            "device registered"
        );
        Ok(handle)
    }

    /// Remove a device from the registry, unbinding it first. Threads still
    /// holding its `Arc` keep it alive until they drop it.
    ///
    /// # Errors
    ///
    /// [`DriverError::NoDevice`] for a stale handle; [`DriverError::Busy`]
    /// if it still has children or a probe/unbind is in flight.
    pub fn unregister_device(&self, handle: DeviceHandle) -> Result<(), DriverError> {
        loop {
            {
                let mut registry = self.lock_registry();
                let device = Arc::clone(registry.device(handle)?);
                let inner = device.lock();
                if !inner.children.is_empty() || inner.probing || inner.unbinding {
                    return Err(DriverError::Busy);
                }
                if inner.driver.is_none() {
                    drop(inner);
                    registry.devices.remove(handle);
                    if let Some(parent) = device.parent().and_then(|p| registry.devices.get(p)) {
                        parent.lock().children.retain(|child| *child != handle);
                    }
                    drop(registry);
                    debug!(
                        device = %handle,
                        name = device.name(),
                        refs = Arc::strong_count(&device) - 1,
                        "device unregistered"
                    );
                    return Ok(());
                }
            }
            self.unbind(handle)?;
        }
    }

    /// Surprise removal: mark the device (and its children) `Removed`,
    /// unbind and unregister them. An unbind already in flight on the device
    /// is waited out rather than reported.
    ///
    /// # Errors
    ///
    /// [`DriverError::NoDevice`] for a stale handle; [`DriverError::Busy`]
    /// while a probe is in flight on the device.
    pub fn hot_unplug(&self, handle: DeviceHandle) -> Result<(), DriverError> {
        let (device, children) = {
            let registry = self.lock_registry();
            let device = Arc::clone(registry.device(handle)?);
            let mut inner = device.lock();
            if inner.probing {
                return Err(DriverError::Busy);
            }
            inner.state = DeviceState::Removed;
            inner.power = PowerState::D3Cold;
            let children = inner.children.clone();
            drop(inner);
            (device, children)
        };
        for child in children {
            if let Err(err) = self.hot_unplug(child) {
                warn!(device = %child, error = %err, "child removal failed");
            }
        }
        // With no probe and no children left, only a `remove` still running
        // on another thread can hold the device.
        let unbind_in_flight = || {
            let inner = device.lock();
            !inner.probing && inner.children.is_empty()
        };
        loop {
            match self.unregister_device(handle) {
                Err(DriverError::Busy) if unbind_in_flight() => thread::sleep(UNBIND_POLL),
                result => break result?,
            }
        }
        info!(device = %handle, name = device.name(), "device hot-unplugged");
        Ok(())
    }

    /// Shared reference to a registered device.
    pub fn device(&self, handle: DeviceHandle) -> Result<Arc<Device>, DriverError> {
        self.lock_registry().device(handle).map(Arc::clone)
    }

    /// First registered device with the given vendor and device IDs.
    pub fn find_device(&self, vendor_id: u32, device_id: u32) -> Option<DeviceHandle> {
        self.lock_registry()
            .devices
            .iter()
            .find(|(_, dev)| {
                let id = dev.identity();
                id.vendor_id == vendor_id && id.device_id == device_id
            })
            .map(|(handle, _)| handle)
    }

    pub fn find_device_by_name(&self, name: &str) -> Option<DeviceHandle> {
        self.lock_registry()
            .devices
            .iter()
            .find(|(_, dev)| dev.name() == name)
            .map(|(handle, _)| handle)
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.lock_registry()
            .devices
            .iter()
            .map(|(handle, dev)| dev.info(handle))
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.lock_registry().devices.len()
    }

    pub fn driver_count(&self) -> usize {
        self.lock_registry().drivers.len()
    }

    /// Device plus the ops of its bound driver, if any.
    pub(crate) fn device_and_ops(
        &self,
        handle: DeviceHandle,
    ) -> Result<(Arc<Device>, Option<Arc<dyn Driver>>), DriverError> {
        let registry = self.lock_registry();
        let device = Arc::clone(registry.device(handle)?);
        if device.state() == DeviceState::Removed {
            return Err(DriverError::NoDevice);
        }
        let ops = device
            .driver()
            .and_then(|driver| registry.drivers.get(driver))
            .map(|record| Arc::clone(&record.descriptor.ops));
        Ok((device, ops))
    }

    pub fn stats(&self) -> FrameworkStats {
        FrameworkStats {
            probes: self.counters.probes.load(Ordering::Relaxed),
            total_probe_time_us: self.counters.probe_time_us.load(Ordering::Relaxed),
            crashes: self.counters.crashes.load(Ordering::Relaxed),
            permanent_failures: self.counters.permanent_failures.load(Ordering::Relaxed),
        }
    }

    /// Unregister every driver (newest first), then drop every device.
    pub fn shutdown(&self) {
        let drivers: Vec<DriverHandle> = self
            .lock_registry()
            .driver_order
            .iter()
            .rev()
            .copied()
            .collect();
        for driver in drivers {
            if let Err(err) = self.unregister_driver(driver) {
                warn!(%driver, error = %err, "driver teardown failed during shutdown");
            }
        }
        let devices = self.lock_registry().devices.drain();
        info!(devices = devices.len(), "device framework shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::testing::{DISK, MockDriver, NIC, disk_driver, harness, harness_with, nic_driver};
    use devframe_types::DeviceIdentity;

    #[test]
    fn duplicate_driver_name_is_busy() {
        let h = harness();
        h.framework
            .register_driver(nic_driver("e1000", Arc::new(MockDriver::new())))
            .unwrap();
        let err = h
            .framework
            .register_driver(nic_driver("e1000", Arc::new(MockDriver::new())))
            .unwrap_err();
        assert_eq!(err, DriverError::Busy);
        assert_eq!(h.framework.driver_count(), 1);
        assert_eq!(h.hal.outstanding_dma(), 1);
    }

    #[test]
    fn full_driver_table_reports_no_memory() {
        let h = harness_with(KernelConfig {
            max_drivers: 1,
            sandbox_pool_bytes: 1024,
            ..KernelConfig::default()
        });
        h.framework
            .register_driver(nic_driver("a", Arc::new(MockDriver::new())))
            .unwrap();
        let err = h
            .framework
            .register_driver(nic_driver("b", Arc::new(MockDriver::new())))
            .unwrap_err();
        assert_eq!(err, DriverError::NoMemory);
    }

    #[test]
    fn failed_security_context_leaves_no_half_registered_driver() {
        let h = harness();
        h.security.fail_context_creation(true);
        assert!(
            h.framework
                .register_driver(nic_driver("e1000", Arc::new(MockDriver::new())))
                .is_err()
        );
        assert_eq!(h.hal.outstanding_dma(), 0);
        assert_eq!(h.framework.driver_count(), 0);
        assert_eq!(h.framework.find_driver("e1000"), None);
    }

    #[test]
    fn slow_sandbox_setup_leaves_registry_usable() {
        let h = harness();
        h.security.set_create_delay(Some(Duration::from_millis(300)));
        std::thread::scope(|s| {
            let slow = s.spawn(|| {
                h.framework
                    .register_driver(nic_driver("e1000", Arc::new(MockDriver::new())))
            });
            std::thread::sleep(Duration::from_millis(50));
            let started = Instant::now();
            let device = h.framework.register_device(Device::new("nvme0", DISK)).unwrap();
            assert!(h.framework.device(device).is_ok());
            assert_eq!(h.framework.find_driver("e1000"), None);
            assert!(started.elapsed() < Duration::from_millis(200));
            slow.join().unwrap().unwrap();
        });
        assert_eq!(h.framework.driver_count(), 1);
    }

    #[test]
    fn racing_registrations_of_one_name_leave_one_sandbox() {
        let h = harness();
        h.security.set_create_delay(Some(Duration::from_millis(50)));
        let results: Vec<_> = std::thread::scope(|s| {
            let racers: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        h.framework
                            .register_driver(nic_driver("e1000", Arc::new(MockDriver::new())))
                    })
                })
                .collect();
            racers.into_iter().map(|r| r.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.contains(&Err(DriverError::Busy)));
        assert_eq!(h.framework.driver_count(), 1);
        assert_eq!(h.security.live_contexts(), 1);
        assert_eq!(h.hal.outstanding_dma(), 1);
    }

    #[test]
    fn registering_a_driver_claims_existing_devices() {
        let h = harness();
        let nic = h.framework.register_device(Device::new("eth0", NIC)).unwrap();
        let disk = h.framework.register_device(Device::new("nvme0", DISK)).unwrap();

        let ops = Arc::new(MockDriver::new());
        let driver = h
            .framework
            .register_driver(nic_driver("e1000", ops.clone()))
            .unwrap();

        let eth0 = h.framework.device(nic).unwrap();
        assert_eq!(eth0.state(), DeviceState::Active);
        assert_eq!(eth0.driver(), Some(driver));
        assert_eq!(eth0.power_state(), PowerState::D0);
        assert_eq!(eth0.match_data(), Some(0xE1000));
        assert_eq!(h.framework.device(disk).unwrap().driver(), None);
        assert_eq!(h.framework.driver_stats(driver).unwrap().bound_devices, 1);
        assert_eq!(ops.probe_count(), 1);
    }

    #[test]
    fn duplicate_device_and_full_table() {
        let h = harness_with(KernelConfig {
            max_devices: 2,
            ..KernelConfig::default()
        });
        h.framework.register_device(Device::new("a", NIC)).unwrap();
        assert_eq!(
            h.framework.register_device(Device::new("a", DISK)),
            Err(DriverError::Busy)
        );
        h.framework.register_device(Device::new("b", DISK)).unwrap();
        assert_eq!(
            h.framework.register_device(Device::new("c", DISK)),
            Err(DriverError::NoMemory)
        );
        assert_eq!(
            h.framework.register_device(Device::new("", DISK)),
            Err(DriverError::Config)
        );
    }

    #[test]
    fn lookups_by_ids_and_name() {
        let h = harness();
        let nic = h.framework.register_device(Device::new("eth0", NIC)).unwrap();
        assert_eq!(h.framework.find_device(0x8086, 0x100e), Some(nic));
        assert_eq!(h.framework.find_device(0x8086, 0xffff), None);
        assert_eq!(h.framework.find_device_by_name("eth0"), Some(nic));
        assert_eq!(h.framework.find_device_by_name("eth1"), None);
    }

    #[test]
    fn parent_tracks_children_and_blocks_unregistration() {
        let h = harness();
        let hub = h
            .framework
            .register_device(Device::new("hub0", DeviceIdentity::new(1, 1, 0x09_00_00)))
            .unwrap();
        let port = h
            .framework
            .register_device(Device::new("port1", DeviceIdentity::new(1, 2, 0)).with_parent(hub))
            .unwrap();
        assert_eq!(h.framework.device(hub).unwrap().children(), vec![port]);
        assert_eq!(h.framework.unregister_device(hub), Err(DriverError::Busy));

        h.framework.unregister_device(port).unwrap();
        assert!(h.framework.device(hub).unwrap().children().is_empty());
        h.framework.unregister_device(hub).unwrap();
        assert_eq!(h.framework.device_count(), 0);

        let orphan = Device::new("orphan", DeviceIdentity::default()).with_parent(hub);
        assert_eq!(h.framework.register_device(orphan), Err(DriverError::NoDevice));
    }

    #[test]
    fn unregister_device_unbinds_first() {
        let h = harness();
        let ops = Arc::new(MockDriver::new());
        h.framework.register_driver(nic_driver("e1000", ops.clone())).unwrap();
        let nic = h.framework.register_device(Device::new("eth0", NIC)).unwrap();
        h.framework.probe_device(nic).unwrap();

        h.framework.unregister_device(nic).unwrap();
        assert_eq!(ops.remove_count(), 1);
        assert_eq!(h.framework.device(nic).unwrap_err(), DriverError::NoDevice);
    }

    #[test]
    fn unregistered_device_stays_alive_while_referenced() {
        let h = harness();
        let handle = h.framework.register_device(Device::new("eth0", NIC)).unwrap();
        let held = h.framework.device(handle).unwrap();

        h.framework.unregister_device(handle).unwrap();
        assert_eq!(held.name(), "eth0");
        assert_eq!(held.handle(), Some(handle));
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[test]
    fn teardown_removes_both_devices_before_sandbox_is_destroyed() {
        let h = harness();
        let security = h.security.clone();
        let removed_with_live_sandbox = Arc::new(AtomicU64::new(0));
        let witness = removed_with_live_sandbox.clone();
        let ops = Arc::new(MockDriver::new().on_remove(move |_| {
            if security.live_contexts() == 1 {
                witness.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let a = h.framework.register_device(Device::new("eth0", NIC)).unwrap();
        let b = h.framework.register_device(Device::new("eth1", NIC)).unwrap();
        let driver = h.framework.register_driver(nic_driver("e1000", ops.clone())).unwrap();
        assert_eq!(h.framework.driver_stats(driver).unwrap().bound_devices, 2);

        h.framework.unregister_driver(driver).unwrap();

        assert_eq!(ops.remove_count(), 2);
        assert_eq!(removed_with_live_sandbox.load(Ordering::SeqCst), 2);
        assert_eq!(h.security.live_contexts(), 0);
        assert_eq!(h.hal.outstanding_dma(), 0);
        for handle in [a, b] {
            let dev = h.framework.device(handle).unwrap();
            assert_eq!(dev.state(), DeviceState::Uninitialized);
            assert_eq!(dev.driver(), None);
        }
        assert_eq!(h.framework.driver_stats(driver), Err(DriverError::NoDevice));
    }

    #[test]
    fn sandbox_pool_unreachable_after_unregistration() {
        let h = harness();
        let driver = h
            .framework
            .register_driver(disk_driver("nvme", Arc::new(MockDriver::new())))
            .unwrap();
        let sandbox = h.framework.sandbox(driver).unwrap();
        assert!(sandbox.with_pool(|mem| mem.len()).is_ok());

        h.framework.unregister_driver(driver).unwrap();
        assert_eq!(sandbox.with_pool(|mem| mem.len()), Err(DriverError::NoDevice));
        assert_eq!(h.framework.unregister_driver(driver), Err(DriverError::NoDevice));
    }

    #[test]
    fn stale_driver_handle_is_not_reused() {
        let h = harness();
        let first = h
            .framework
            .register_driver(nic_driver("a", Arc::new(MockDriver::new())))
            .unwrap();
        h.framework.unregister_driver(first).unwrap();
        let second = h
            .framework
            .register_driver(nic_driver("b", Arc::new(MockDriver::new())))
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(h.framework.driver_info(first), Err(DriverError::NoDevice));
        assert_eq!(h.framework.driver_info(second).unwrap().name, "b");
    }

    #[test]
    fn hot_unplug_marks_removed_and_detaches_children() {
        let h = harness();
        let ops = Arc::new(MockDriver::new());
        h.framework.register_driver(nic_driver("e1000", ops.clone())).unwrap();
        let bridge = h
            .framework
            .register_device(Device::new("bridge", DeviceIdentity::new(2, 2, 0x06_04_00)))
            .unwrap();
        let nic = h
            .framework
            .register_device(Device::new("eth0", NIC).with_parent(bridge))
            .unwrap();
        h.framework.probe_device(nic).unwrap();
        let nic_dev = h.framework.device(nic).unwrap();
        let bridge_dev = h.framework.device(bridge).unwrap();

        h.framework.hot_unplug(bridge).unwrap();

        assert_eq!(nic_dev.state(), DeviceState::Removed);
        assert_eq!(bridge_dev.state(), DeviceState::Removed);
        assert_eq!(ops.remove_count(), 1);
        assert_eq!(h.framework.device_count(), 0);
    }

    #[test]
    fn snapshots_list_drivers_in_registration_order() {
        let h = harness();
        h.framework
            .register_driver(nic_driver("e1000", Arc::new(MockDriver::new())))
            .unwrap();
        h.framework
            .register_driver(disk_driver("nvme", Arc::new(MockDriver::new())))
            .unwrap();
        h.framework.register_device(Device::new("nvme0", DISK)).unwrap();

        let names: Vec<String> = h.framework.drivers().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["e1000", "nvme"]);
        let devices = h.framework.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "nvme0");

        let json = serde_json::to_value(h.framework.drivers()).unwrap();
        assert_eq!(json[1]["driver_type"], "Storage");
    }

    #[test]
    fn shutdown_releases_every_sandbox() {
        let h = harness();
        let ops = Arc::new(MockDriver::new());
        h.framework.register_driver(nic_driver("e1000", ops.clone())).unwrap();
        h.framework
            .register_driver(disk_driver("nvme", Arc::new(MockDriver::new())))
            .unwrap();
        h.framework.register_device(Device::new("eth0", NIC)).unwrap();
        h.framework.probe_device(h.framework.find_device_by_name("eth0").unwrap()).unwrap();

        h.framework.shutdown();

        assert_eq!(ops.remove_count(), 1);
        assert_eq!(h.framework.driver_count(), 0);
        assert_eq!(h.framework.device_count(), 0);
        assert_eq!(h.hal.outstanding_dma(), 0);
        assert_eq!(h.security.live_contexts(), 0);
    }
}
