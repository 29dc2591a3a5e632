//! Matching & binding engine.
//!
//! `bind` claims the device under the registry lock, then probes with no
//! lock held. Each probe runs on its own thread joined with the configured
//! deadline; a timeout or a panic is fed to crash recovery like any other
//! probe failure. A probe thread that never returns is abandoned.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use devframe_types::{
    DeviceHandle, DeviceState, DriverError, DriverFlags, DriverHandle, MatchEntry, PowerState,
};
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::driver::{Driver, DriverRecord, IrqReturn};
use crate::framework::DeviceFramework;
use crate::sandbox::SandboxEnvelope;

/// Everything needed to probe a claimed device without touching the
/// registry.
pub(crate) struct Claim {
    pub device: Arc<Device>,
    pub handle: DeviceHandle,
    pub driver: DriverHandle,
    pub driver_name: String,
    pub ops: Arc<dyn Driver>,
    pub matched: Option<MatchEntry>,
    pub sandbox: Arc<SandboxEnvelope>,
}

impl Claim {
    pub fn new(
        device: Arc<Device>,
        handle: DeviceHandle,
        driver: DriverHandle,
        record: &DriverRecord,
        matched: Option<MatchEntry>,
    ) -> Self {
        Self {
            device,
            handle,
            driver,
            driver_name: record.descriptor.name.clone(),
            ops: Arc::clone(&record.descriptor.ops),
            matched,
            sandbox: Arc::clone(&record.sandbox),
        }
    }
}

impl DeviceFramework {
    /// Bind `driver` to `device` and probe it.
    ///
    /// # Errors
    ///
    /// * [`DriverError::Busy`] if the device already has a driver or is
    ///   mid-probe / mid-unbind.
    /// * [`DriverError::NotSupported`] if the driver does not match.
    /// * [`DriverError::Hardware`] if the device is in `Error`, or probe
    ///   kept failing until crash recovery gave up.
    /// * [`DriverError::NoDevice`] for stale handles, removed devices or a
    ///   driver being unregistered.
    pub fn bind(&self, device: DeviceHandle, driver: DriverHandle) -> Result<(), DriverError> {
        let claim = {
            let mut registry = self.lock_registry();
            let dev = Arc::clone(registry.device(device)?);
            let record = registry.driver_mut(driver)?;
            if record.retiring {
                return Err(DriverError::NoDevice);
            }
            let matched = {
                let mut inner = dev.lock();
                match inner.state {
                    DeviceState::Removed => return Err(DriverError::NoDevice),
                    DeviceState::Error => return Err(DriverError::Hardware),
                    _ => {}
                }
                if inner.driver.is_some() || inner.probing || inner.unbinding {
                    return Err(DriverError::Busy);
                }
                let matched = record
                    .descriptor
                    .find_match(&dev.identity())
                    .ok_or(DriverError::NotSupported)?;
                inner.driver = Some(driver);
                inner.match_data = matched.entry().map(|entry| entry.driver_data);
                inner.state = DeviceState::Initializing;
                inner.probing = true;
                matched
            };
            record.bound_devices += 1;
            Claim::new(dev, device, driver, record, matched.entry().copied())
        };
        debug!(%device, driver = %claim.driver_name, "probing device");

        let outcome = self.probe_with_recovery(&claim);
        self.finish_binding(&claim, outcome)
    }

    /// Detach the bound driver, calling its `remove` first. A device with no
    /// driver is left untouched.
    ///
    /// # Errors
    ///
    /// [`DriverError::NoDevice`] for a stale handle; [`DriverError::Busy`]
    /// while a probe or another unbind is in flight.
    pub fn unbind(&self, device: DeviceHandle) -> Result<(), DriverError> {
        let (dev, driver, ops) = {
            let registry = self.lock_registry();
            let dev = Arc::clone(registry.device(device)?);
            let mut inner = dev.lock();
            let Some(driver) = inner.driver else {
                return Ok(());
            };
            if inner.probing || inner.unbinding {
                return Err(DriverError::Busy);
            }
            inner.unbinding = true;
            drop(inner);
            let ops = registry
                .drivers
                .get(driver)
                .map(|record| Arc::clone(&record.descriptor.ops));
            (dev, driver, ops)
        };

        if let Some(ops) = ops
            && let Err(err) = ops.remove(&dev)
        {
            warn!(%device, %driver, error = %err, "driver remove reported an error");
        }

        {
            let mut registry = self.lock_registry();
            if let Some(record) = registry.drivers.get_mut(driver) {
                record.bound_devices = record.bound_devices.saturating_sub(1);
            }
            let mut inner = dev.lock();
            inner.driver = None;
            inner.match_data = None;
            inner.unbinding = false;
            if !matches!(inner.state, DeviceState::Removed | DeviceState::Error) {
                inner.state = DeviceState::Uninitialized;
            }
        }
        info!(%device, %driver, name = dev.name(), "device unbound");
        Ok(())
    }

    /// Try to bind `driver` to every unbound `Uninitialized` device it
    /// matches. Returns how many bindings succeeded.
    ///
    /// # Errors
    ///
    /// [`DriverError::NoDevice`] for a stale driver handle.
    pub fn enumerate_and_probe(&self, driver: DriverHandle) -> Result<usize, DriverError> {
        let candidates: Vec<DeviceHandle> = {
            let registry = self.lock_registry();
            let record = registry.driver(driver)?;
            registry
                .devices
                .iter()
                .filter(|(_, dev)| {
                    let inner = dev.lock();
                    inner.driver.is_none()
                        && !inner.probing
                        && inner.state == DeviceState::Uninitialized
                })
                .filter(|(_, dev)| record.descriptor.find_match(&dev.identity()).is_some())
                .map(|(handle, _)| handle)
                .collect()
        };

        let mut bound = 0;
        for device in candidates {
            match self.bind(device, driver) {
                Ok(()) => bound += 1,
                Err(err) => debug!(%device, %driver, error = %err, "enumeration bind failed"),
            }
        }
        Ok(bound)
    }

    /// Offer the device to every registered driver in registration order
    /// until one binds.
    pub fn probe_device(&self, device: DeviceHandle) -> Result<DriverHandle, DriverError> {
        self.bind_first(device, DriverFlags::empty())
    }

    /// Automatic driver load for hot-plugged hardware: like
    /// [`DeviceFramework::probe_device`] but only hot-plug capable drivers
    /// are considered.
    pub fn auto_bind(&self, device: DeviceHandle) -> Result<DriverHandle, DriverError> {
        self.bind_first(device, DriverFlags::HOTPLUG)
    }

    fn bind_first(
        &self,
        device: DeviceHandle,
        required: DriverFlags,
    ) -> Result<DriverHandle, DriverError> {
        let candidates: Vec<DriverHandle> = {
            let registry = self.lock_registry();
            let dev = registry.device(device)?;
            if dev.driver().is_some() {
                return Err(DriverError::Busy);
            }
            let identity = dev.identity();
            registry
                .driver_order
                .iter()
                .copied()
                .filter(|handle| {
                    registry.drivers.get(*handle).is_some_and(|record| {
                        !record.retiring
                            && record.descriptor.flags.contains(required)
                            && record.descriptor.find_match(&identity).is_some()
                    })
                })
                .collect()
        };

        let mut last = DriverError::NotSupported;
        for driver in candidates {
            match self.bind(device, driver) {
                Ok(()) => return Ok(driver),
                Err(err) => last = err,
            }
        }
        Err(last)
    }

    /// Run the bound driver's interrupt handler for `irq`. The device is
    /// held by reference for the duration, so a concurrent unregistration
    /// cannot free it.
    ///
    /// # Errors
    ///
    /// [`DriverError::NoDevice`] if the device is unknown or unbound;
    /// [`DriverError::NotSupported`] if the driver has no interrupt handler.
    pub fn dispatch_interrupt(
        &self,
        device: DeviceHandle,
        irq: u32,
    ) -> Result<IrqReturn, DriverError> {
        let (dev, ops) = self.device_and_ops(device)?;
        let ops = ops.ok_or(DriverError::NoDevice)?;
        let handler = ops.interrupt().ok_or(DriverError::NotSupported)?;
        Ok(handler.handle_interrupt(&dev, irq))
    }

    // ── probe plumbing ─────────────────────────────────────────────────────

    pub(crate) fn probe_with_recovery(&self, claim: &Claim) -> Result<(), DriverError> {
        loop {
            let fault = match self.run_probe(claim) {
                Ok(()) => return Ok(()),
                Err(fault) => fault,
            };
            self.absorb_fault(claim, fault)?;
        }
    }

    /// Settle a claim once probing (with recovery) is over.
    pub(crate) fn finish_binding(
        &self,
        claim: &Claim,
        outcome: Result<(), DriverError>,
    ) -> Result<(), DriverError> {
        match outcome {
            Ok(()) => {
                {
                    let mut inner = claim.device.lock();
                    inner.probing = false;
                    inner.state = DeviceState::Active;
                    inner.power = PowerState::D0;
                }
                info!(
                    device = %claim.handle,
                    name = claim.device.name(),
                    driver = %claim.driver_name,
                    "device bound"
                );
                Ok(())
            }
            Err(err) => {
                {
                    let mut registry = self.lock_registry();
                    if let Some(record) = registry.drivers.get_mut(claim.driver) {
                        record.bound_devices = record.bound_devices.saturating_sub(1);
                        record.error_count = record.error_count.saturating_add(1);
                    }
                    let mut inner = claim.device.lock();
                    inner.probing = false;
                    inner.driver = None;
                    inner.match_data = None;
                    if !matches!(inner.state, DeviceState::Error | DeviceState::Removed) {
                        inner.state = DeviceState::Uninitialized;
                    }
                }
                warn!(
                    device = %claim.handle,
                    driver = %claim.driver_name,
                    error = %err,
                    "binding rolled back"
                );
                Err(err)
            }
        }
    }

    fn run_probe(&self, claim: &Claim) -> Result<(), DriverError> {
        let started = self.hal.now_us();
        let result = match self.config.probe_timeout() {
            Some(deadline) => self.probe_on_thread(claim, deadline),
            None => panic::catch_unwind(AssertUnwindSafe(|| {
                claim.ops.probe(&claim.device, claim.matched.as_ref())
            }))
            .unwrap_or_else(|_| {
                warn!(device = %claim.handle, driver = %claim.driver_name, "probe panicked");
                Err(DriverError::Hardware)
            }),
        };
        self.counters.probes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .probe_time_us
            .fetch_add(self.hal.now_us().saturating_sub(started), Ordering::Relaxed);
        result
    }

    fn probe_on_thread(&self, claim: &Claim, deadline: Duration) -> Result<(), DriverError> {
        let (tx, rx) = mpsc::sync_channel(1);
        let ops = Arc::clone(&claim.ops);
        let device = Arc::clone(&claim.device);
        let matched = claim.matched;
        let spawned = thread::Builder::new()
            .name(format!("probe-{}", claim.driver_name))
            .spawn(move || {
                let _ = tx.send(ops.probe(&device, matched.as_ref()));
            });
        if let Err(err) = spawned {
            warn!(driver = %claim.driver_name, error = %err, "cannot spawn probe thread");
            return Err(DriverError::NoMemory);
        }

        match rx.recv_timeout(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    device = %claim.handle,
                    driver = %claim.driver_name,
                    timeout_ms = deadline.as_millis() as u64,
                    "probe missed its deadline; abandoning probe thread"
                );
                Err(DriverError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!(device = %claim.handle, driver = %claim.driver_name, "probe panicked");
                Err(DriverError::Hardware)
            }
        }
    }
}
