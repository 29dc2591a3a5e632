//! Power state coordinator.
//!
//! Power hooks run with no framework lock held; the resulting state is
//! stored afterwards. A device whose driver has no power interface (or that
//! has no driver at all) simply records the requested state. A device that
//! a bind or unbind currently owns is refused with `Busy`.

use std::sync::Arc;

use devframe_types::{DeviceHandle, DeviceState, DriverError, DriverHandle, PowerState};
use tracing::{debug, info};

use crate::device::Device;
use crate::driver::Driver;
use crate::framework::DeviceFramework;

type PowerTarget = (Arc<Device>, Option<DriverHandle>, Option<Arc<dyn Driver>>);

impl DeviceFramework {
    /// The device, its driver and that driver's ops, read in one registry
    /// critical section.
    fn power_target(&self, device: DeviceHandle) -> Result<PowerTarget, DriverError> {
        let registry = self.lock_registry();
        let dev = Arc::clone(registry.device(device)?);
        let bound = {
            let inner = dev.lock();
            if inner.state == DeviceState::Removed {
                return Err(DriverError::NoDevice);
            }
            if inner.probing || inner.unbinding {
                return Err(DriverError::Busy);
            }
            inner.driver
        };
        let ops = bound
            .and_then(|driver| registry.drivers.get(driver))
            .map(|record| Arc::clone(&record.descriptor.ops));
        Ok((dev, bound, ops))
    }

    /// Move a device to `state`, delegating to the bound driver when it
    /// supports power management and adopting its result.
    ///
    /// # Errors
    ///
    /// [`DriverError::NoDevice`] for an unknown or removed device,
    /// [`DriverError::Busy`] while a bind or unbind owns the device or if
    /// its binding changed under the hook, or whatever the driver's hook
    /// reports. On error the stored state is unchanged.
    pub fn set_power_state(&self, device: DeviceHandle, state: PowerState) -> Result<(), DriverError> {
        let (dev, bound, ops) = self.power_target(device)?;
        let mut delegated = false;
        if let Some(ops) = &ops
            && let Some(pm) = ops.power()
        {
            pm.set_power_state(&dev, state)?;
            delegated = true;
        }
        {
            let mut inner = dev.lock();
            if inner.state == DeviceState::Removed {
                return Err(DriverError::NoDevice);
            }
            if inner.probing || inner.unbinding || inner.driver != bound {
                debug!(%device, %state, "binding changed during power transition");
                return Err(DriverError::Busy);
            }
            inner.power = state;
        }
        debug!(%device, %state, delegated, "power state set");
        Ok(())
    }

    /// `Active` → `Suspended` (power `D3hot`).
    ///
    /// # Errors
    ///
    /// [`DriverError::Busy`] while a bind or unbind owns the device,
    /// [`DriverError::NotSupported`] unless the device is `Active`, or the
    /// driver's suspend error.
    pub fn suspend(&self, device: DeviceHandle) -> Result<(), DriverError> {
        let (dev, _, ops) = self.power_target(device)?;
        if dev.state() != DeviceState::Active {
            return Err(DriverError::NotSupported);
        }
        if let Some(ops) = &ops
            && let Some(pm) = ops.power()
        {
            pm.suspend(&dev)?;
        }
        {
            let mut inner = dev.lock();
            if inner.state == DeviceState::Active {
                inner.state = DeviceState::Suspended;
                inner.power = PowerState::D3Hot;
            }
        }
        info!(%device, name = dev.name(), "device suspended");
        Ok(())
    }

    /// `Suspended` → `Active` (power `D0`).
    ///
    /// # Errors
    ///
    /// [`DriverError::Busy`] while a bind or unbind owns the device,
    /// [`DriverError::NotSupported`] unless the device is `Suspended`, or
    /// the driver's resume error.
    pub fn resume(&self, device: DeviceHandle) -> Result<(), DriverError> {
        let (dev, _, ops) = self.power_target(device)?;
        if dev.state() != DeviceState::Suspended {
            return Err(DriverError::NotSupported);
        }
        if let Some(ops) = &ops
            && let Some(pm) = ops.power()
        {
            pm.resume(&dev)?;
        }
        {
            let mut inner = dev.lock();
            if inner.state == DeviceState::Suspended {
                inner.state = DeviceState::Active;
                inner.power = PowerState::D0;
            }
        }
        info!(%device, name = dev.name(), "device resumed");
        Ok(())
    }
}
