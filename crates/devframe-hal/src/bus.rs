//! Bus collaborators used by the hot-plug detector.
//!
//! Only the handful of registers needed to identify a function are named
//! here; everything else about config space belongs to the bus driver.

use std::sync::Arc;

use devframe_types::DriverError;

/// Config-space offset of the vendor (low half) and device (high half) IDs.
pub const PCI_ID_OFFSET: u8 = 0x00;
/// Config-space offset of the revision (low byte) and 24-bit class code.
pub const PCI_CLASS_OFFSET: u8 = 0x08;
/// Config-space offset of the dword holding the header type in bits 16..24.
pub const PCI_HEADER_OFFSET: u8 = 0x0C;
/// Header-type bit marking a multi-function device.
pub const PCI_HEADER_MULTIFUNCTION: u8 = 0x80;
/// Vendor ID read back from an empty slot.
pub const PCI_VENDOR_NONE: u16 = 0xFFFF;

pub const PCI_BUS_COUNT: u16 = 256;
pub const PCI_DEVICES_PER_BUS: u8 = 32;
pub const PCI_FUNCTIONS_PER_DEVICE: u8 = 8;

/// Callback invoked from the PCI hot-plug interrupt with the affected
/// `(bus, device, function)`. Runs in interrupt context: it must not block.
pub type PciHotplugHandler = Arc<dyn Fn(u8, u8, u8) + Send + Sync>;

/// Callback invoked from the USB port-change interrupt with
/// `(controller, port)`. Runs in interrupt context: it must not block.
pub type UsbPortChangeHandler = Arc<dyn Fn(u8, u8) + Send + Sync>;

/// PCI / PCIe configuration access.
pub trait PciBus: Send + Sync {
    /// Read one dword of config space. Empty slots read as all ones.
    fn read_config_u32(&self, bus: u8, device: u8, function: u8, offset: u8) -> u32;

    /// Install the hot-plug interrupt handler, replacing any previous one.
    fn set_hotplug_handler(&self, handler: PciHotplugHandler);

    fn vendor_id(&self, bus: u8, device: u8, function: u8) -> u16 {
        (self.read_config_u32(bus, device, function, PCI_ID_OFFSET) & 0xFFFF) as u16
    }

    fn device_id(&self, bus: u8, device: u8, function: u8) -> u16 {
        (self.read_config_u32(bus, device, function, PCI_ID_OFFSET) >> 16) as u16
    }

    /// 24-bit class code (class, subclass, prog-if).
    fn class_code(&self, bus: u8, device: u8, function: u8) -> u32 {
        self.read_config_u32(bus, device, function, PCI_CLASS_OFFSET) >> 8
    }

    fn header_type(&self, bus: u8, device: u8, function: u8) -> u8 {
        ((self.read_config_u32(bus, device, function, PCI_HEADER_OFFSET) >> 16) & 0xFF) as u8
    }
}

/// Descriptor summary of an enumerated USB device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UsbDeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub serial: String,
}

impl UsbDeviceInfo {
    /// Class triple packed the same way as a PCI class code.
    pub fn class_code(&self) -> u32 {
        (u32::from(self.class) << 16) | (u32::from(self.subclass) << 8) | u32::from(self.protocol)
    }
}

/// USB host controllers and their root hubs.
pub trait UsbBus: Send + Sync {
    fn controller_count(&self) -> u8;

    fn root_port_count(&self, controller: u8) -> u8;

    /// Current connect status of a root-hub port.
    fn port_connected(&self, controller: u8, port: u8) -> bool;

    /// Reset and address the device on a connected port.
    ///
    /// # Errors
    ///
    /// [`DriverError::NoDevice`] if the port is empty, or any error the
    /// controller reports while enumerating.
    fn enumerate_device(&self, controller: u8, port: u8) -> Result<UsbDeviceInfo, DriverError>;

    /// Install the port-change interrupt handler, replacing any previous one.
    fn set_port_change_handler(&self, handler: UsbPortChangeHandler);
}
