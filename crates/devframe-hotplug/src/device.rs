//! [`HotplugDevice`] – hardware observed by the detector.
//!
//! A hot-plug record is separate from the registry's
//! [`Device`](devframe_kernel::Device): it exists from the scan that first
//! sees the hardware until its removal has been processed, and carries a
//! back-reference to the registry device once one is created.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use bitflags::bitflags;
use devframe_hal::UsbDeviceInfo;
use devframe_types::{
    BusKind, BusLocation, DeviceHandle, DeviceIdentity, DriverHandle, HotplugState,
};
use serde::{Deserialize, Serialize};

bitflags! {
    /// What the hardware tolerates when it leaves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct HotplugCaps: u32 {
        /// May disappear without warning.
        const SURPRISE_REMOVAL = 1 << 0;
        /// Can be ejected on request.
        const EJECTABLE = 1 << 1;
    }
}

#[derive(Debug)]
struct Tracking {
    state: HotplugState,
    /// State to fall back to if a removal is abandoned.
    before_removal: Option<HotplugState>,
    device: Option<DeviceHandle>,
    driver: Option<DriverHandle>,
    driver_loaded_at_us: Option<u64>,
    insertions: u32,
    removals: u32,
    failures: u32,
}

/// One piece of hot-pluggable hardware.
#[derive(Debug)]
pub struct HotplugDevice {
    id: u64,
    location: BusLocation,
    identity: DeviceIdentity,
    path: String,
    name: String,
    caps: HotplugCaps,
    detected_at_us: u64,
    tracking: Mutex<Tracking>,
}

impl HotplugDevice {
    /// A PCIe function found at `location`.
    pub fn pcie(id: u64, location: BusLocation, identity: DeviceIdentity, now_us: u64) -> Self {
        let path = match location {
            BusLocation::Pci {
                bus,
                device,
                function,
            } => format!(
                "PCI\\VEN_{:04X}&DEV_{:04X}\\{bus:02X}{device:02X}{function:02X}",
                identity.vendor_id, identity.device_id
            ),
            BusLocation::Usb { .. } => String::new(),
        };
        let name = format!(
            "PCIe Device {:04x}:{:04x}",
            identity.vendor_id, identity.device_id
        );
        Self::build(id, location, identity, path, name, HotplugCaps::SURPRISE_REMOVAL, now_us)
    }

    /// A USB device enumerated on a root-hub port.
    pub fn usb(id: u64, controller: u8, port: u8, info: &UsbDeviceInfo, now_us: u64) -> Self {
        let identity = DeviceIdentity::new(
            u32::from(info.vendor_id),
            u32::from(info.product_id),
            info.class_code(),
        );
        let instance = if info.serial.is_empty() {
            format!("{controller}&{port}")
        } else {
            info.serial.clone()
        };
        let path = format!(
            "USB\\VEN_{:04X}&PID_{:04X}\\{instance}",
            info.vendor_id, info.product_id
        );
        let name = format!("USB Device {:04x}:{:04x}", info.vendor_id, info.product_id);
        Self::build(
            id,
            BusLocation::usb(controller, port),
            identity,
            path,
            name,
            HotplugCaps::SURPRISE_REMOVAL | HotplugCaps::EJECTABLE,
            now_us,
        )
    }

    fn build(
        id: u64,
        location: BusLocation,
        identity: DeviceIdentity,
        path: String,
        name: String,
        caps: HotplugCaps,
        detected_at_us: u64,
    ) -> Self {
        Self {
            id,
            location,
            identity,
            path,
            name,
            caps,
            detected_at_us,
            tracking: Mutex::new(Tracking {
                state: HotplugState::Arriving,
                before_removal: None,
                device: None,
                driver: None,
                driver_loaded_at_us: None,
                insertions: 1,
                removals: 0,
                failures: 0,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bus(&self) -> BusKind {
        self.location.kind()
    }

    pub fn location(&self) -> BusLocation {
        self.location
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    /// Instance path, e.g. `PCI\VEN_8086&DEV_100E\000100`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn caps(&self) -> HotplugCaps {
        self.caps
    }

    pub fn detected_at_us(&self) -> u64 {
        self.detected_at_us
    }

    pub fn state(&self) -> HotplugState {
        self.lock().state
    }

    /// Registry device created for this hardware.
    pub fn device(&self) -> Option<DeviceHandle> {
        self.lock().device
    }

    pub fn driver(&self) -> Option<DriverHandle> {
        self.lock().driver
    }

    pub fn driver_loaded_at_us(&self) -> Option<u64> {
        self.lock().driver_loaded_at_us
    }

    pub fn snapshot(&self) -> HotplugDeviceInfo {
        let tracking = self.lock();
        HotplugDeviceInfo {
            id: self.id,
            location: self.location,
            identity: self.identity,
            path: self.path.clone(),
            name: self.name.clone(),
            caps: self.caps,
            state: tracking.state,
            device: tracking.device,
            driver: tracking.driver,
            detected_at_us: self.detected_at_us,
            driver_loaded_at_us: tracking.driver_loaded_at_us,
            insertions: tracking.insertions,
            removals: tracking.removals,
            failures: tracking.failures,
        }
    }

    /// True while the detector should treat the location as occupied.
    pub(crate) fn is_live(&self) -> bool {
        self.state() != HotplugState::Removed
    }

    /// `Active`/`Failed` → `Removing`; false from any other state.
    pub(crate) fn begin_removal(&self) -> bool {
        let mut tracking = self.lock();
        if !matches!(tracking.state, HotplugState::Active | HotplugState::Failed) {
            return false;
        }
        tracking.before_removal = Some(tracking.state);
        tracking.state = HotplugState::Removing;
        true
    }

    /// Undo [`HotplugDevice::begin_removal`] so the next scan reports it again.
    pub(crate) fn abort_removal(&self) {
        let mut tracking = self.lock();
        if tracking.state == HotplugState::Removing
            && let Some(previous) = tracking.before_removal.take()
        {
            tracking.state = previous;
        }
    }

    pub(crate) fn attach_device(&self, device: DeviceHandle) {
        self.lock().device = Some(device);
    }

    pub(crate) fn mark_active(&self, driver: Option<DriverHandle>, now_us: u64) {
        let mut tracking = self.lock();
        tracking.state = HotplugState::Active;
        tracking.driver = driver;
        if driver.is_some() {
            tracking.driver_loaded_at_us = Some(now_us);
        }
    }

    pub(crate) fn mark_failed(&self) {
        let mut tracking = self.lock();
        tracking.state = HotplugState::Failed;
        tracking.failures += 1;
    }

    pub(crate) fn mark_removed(&self) {
        let mut tracking = self.lock();
        tracking.state = HotplugState::Removed;
        tracking.before_removal = None;
        tracking.removals += 1;
        tracking.driver = None;
    }

    fn lock(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Display for HotplugDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} {} {}", self.id, self.bus(), self.location, self.path)
    }
}

/// Point-in-time view of a [`HotplugDevice`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HotplugDeviceInfo {
    pub id: u64,
    pub location: BusLocation,
    pub identity: DeviceIdentity,
    pub path: String,
    pub name: String,
    pub caps: HotplugCaps,
    pub state: HotplugState,
    pub device: Option<DeviceHandle>,
    pub driver: Option<DriverHandle>,
    pub detected_at_us: u64,
    pub driver_loaded_at_us: Option<u64>,
    pub insertions: u32,
    pub removals: u32,
    pub failures: u32,
}
