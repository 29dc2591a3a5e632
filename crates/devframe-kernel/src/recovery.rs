//! Crash recovery controller.
//!
//! Faults are counted per (driver, device) pair in the driver's sandbox.
//! Up to `crash_threshold` faults are absorbed: the device drops back to
//! `Uninitialized`, the faulting thread waits the fixed recovery delay and
//! probe runs again. The next fault after that marks the device `Error`
//! for good; the pair stays dead until the driver is unregistered.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use devframe_types::{DeviceHandle, DeviceState, DriverError};
use tracing::{error, warn};

use crate::binding::Claim;
use crate::framework::DeviceFramework;

impl DeviceFramework {
    /// Count `fault` against the claim's pair and either schedule another
    /// probe attempt (`Ok`) or disable the device (`Err(Hardware)`).
    pub(crate) fn absorb_fault(&self, claim: &Claim, fault: DriverError) -> Result<(), DriverError> {
        let crash_count = claim.sandbox.record_crash(claim.handle, self.hal.now_us());
        self.counters.crashes.fetch_add(1, Ordering::Relaxed);

        if crash_count > self.config.crash_threshold {
            {
                let mut inner = claim.device.lock();
                inner.state = DeviceState::Error;
                inner.failed_driver = Some(claim.driver);
            }
            self.counters
                .permanent_failures
                .fetch_add(1, Ordering::Relaxed);
            error!(
                device = %claim.handle,
                name = claim.device.name(),
                driver = %claim.driver_name,
                crash_count,
                %fault,
                "crash limit exceeded; device disabled"
            );
            return Err(DriverError::Hardware);
        }

        claim.device.lock().state = DeviceState::Uninitialized;
        warn!(
            device = %claim.handle,
            driver = %claim.driver_name,
            crash_count,
            threshold = self.config.crash_threshold,
            %fault,
            "driver fault absorbed; restarting"
        );
        self.hal.sleep(self.config.recovery_delay());
        claim.device.lock().state = DeviceState::Initializing;
        Ok(())
    }

    /// Feed a runtime fault of the bound driver into crash recovery.
    ///
    /// A device already in `Error` is left alone.
    ///
    /// # Errors
    ///
    /// * [`DriverError::Hardware`] if the device is (or ends up) disabled.
    /// * [`DriverError::NoDevice`] if the device is unknown or unbound.
    /// * [`DriverError::Busy`] while a probe or unbind is in flight.
    pub fn report_fault(&self, device: DeviceHandle) -> Result<(), DriverError> {
        let claim = {
            let registry = self.lock_registry();
            let dev = Arc::clone(registry.device(device)?);
            let mut inner = dev.lock();
            if inner.state == DeviceState::Error {
                return Err(DriverError::Hardware);
            }
            if inner.probing || inner.unbinding {
                return Err(DriverError::Busy);
            }
            let driver = inner.driver.ok_or(DriverError::NoDevice)?;
            let record = registry.driver(driver)?;
            inner.probing = true;
            drop(inner);
            let matched = record
                .descriptor
                .find_match(&dev.identity())
                .and_then(|m| m.entry().copied());
            Claim::new(dev, device, driver, record, matched)
        };
        warn!(%device, driver = %claim.driver_name, "runtime fault reported");

        let outcome = self
            .absorb_fault(&claim, DriverError::Hardware)
            .and_then(|()| self.probe_with_recovery(&claim));
        self.finish_binding(&claim, outcome)
    }
}
