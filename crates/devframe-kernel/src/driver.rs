//! [`Driver`] – the operation contract every concrete driver implements,
//! plus the [`DriverDescriptor`] used to register it.
//!
//! `probe` and `remove` are mandatory. Power management and interrupt
//! handling are optional capabilities a driver exposes by overriding
//! [`Driver::power`] / [`Driver::interrupt`]; the framework resolves them at
//! call time instead of checking nullable function slots.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use devframe_kernel::{Device, Driver, DriverDescriptor};
//! use devframe_types::{DriverError, DriverFlags, DriverType, MatchEntry};
//!
//! struct E1000;
//!
//! impl Driver for E1000 {
//!     fn probe(&self, _device: &Device, _matched: Option<&MatchEntry>) -> Result<(), DriverError> {
//!         Ok(())
//!     }
//!     fn remove(&self, _device: &Device) -> Result<(), DriverError> {
//!         Ok(())
//!     }
//! }
//!
//! let descriptor = DriverDescriptor::new("e1000", DriverType::Network, Arc::new(E1000))
//!     .with_flags(DriverFlags::HOTPLUG)
//!     .with_match(MatchEntry::pci(0x8086, 0x100e));
//! assert!(descriptor.validate().is_ok());
//! ```

use std::fmt;
use std::sync::Arc;

use devframe_types::{
    DRIVER_API_VERSION, DeviceIdentity, DriverError, DriverFlags, DriverHandle, DriverStats,
    DriverType, MatchEntry, NAME_MAX, Permissions, PowerState,
};
use serde::Serialize;

use crate::device::Device;
use crate::sandbox::SandboxEnvelope;

// ────────────────────────────────────────────────────────────────────────────
// Operation traits
// ────────────────────────────────────────────────────────────────────────────

/// Operations the framework invokes on a driver. Never called with a
/// framework lock held, so implementations may block or register
/// sub-devices.
pub trait Driver: Send + Sync {
    /// Claim and initialise `device`. `matched` is the ID-table row that
    /// selected this driver, or `None` when a custom matcher did.
    fn probe(&self, device: &Device, matched: Option<&MatchEntry>) -> Result<(), DriverError>;

    /// Release `device`. Errors are logged; the device is unbound anyway.
    fn remove(&self, device: &Device) -> Result<(), DriverError>;

    fn power(&self) -> Option<&dyn PowerManagement> {
        None
    }

    fn interrupt(&self) -> Option<&dyn InterruptHandler> {
        None
    }
}

/// Optional power-management capability.
pub trait PowerManagement: Send + Sync {
    fn suspend(&self, device: &Device) -> Result<(), DriverError>;
    fn resume(&self, device: &Device) -> Result<(), DriverError>;
    fn set_power_state(&self, device: &Device, state: PowerState) -> Result<(), DriverError>;
}

/// Outcome of an interrupt handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    Handled,
    NotMine,
}

/// Optional interrupt capability. Runs in interrupt context: must not block.
pub trait InterruptHandler: Send + Sync {
    fn handle_interrupt(&self, device: &Device, irq: u32) -> IrqReturn;
}

/// Custom match predicate overriding the ID table.
pub type MatchFn = Arc<dyn Fn(&DeviceIdentity) -> bool + Send + Sync>;

// ────────────────────────────────────────────────────────────────────────────
// Descriptor
// ────────────────────────────────────────────────────────────────────────────

/// Everything a driver declares when it registers.
#[derive(Clone)]
pub struct DriverDescriptor {
    pub name: String,
    pub description: String,
    pub author: String,
    pub license: String,
    pub version: u32,
    pub api_version: u32,
    pub driver_type: DriverType,
    pub flags: DriverFlags,
    pub id_table: Vec<MatchEntry>,
    pub matcher: Option<MatchFn>,
    pub ops: Arc<dyn Driver>,
}

impl fmt::Debug for DriverDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverDescriptor")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("driver_type", &self.driver_type)
            .field("flags", &self.flags)
            .field("id_table", &self.id_table)
            .field("matcher", &self.matcher.as_ref().map(|_| "<fn>"))
            .finish_non_exhaustive()
    }
}

/// How a driver matched a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    /// The custom predicate accepted the device.
    Custom,
    Entry(MatchEntry),
}

impl Match {
    pub fn entry(&self) -> Option<&MatchEntry> {
        match self {
            Self::Custom => None,
            Self::Entry(entry) => Some(entry),
        }
    }
}

impl DriverDescriptor {
    pub fn new(name: impl Into<String>, driver_type: DriverType, ops: Arc<dyn Driver>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            author: String::new(),
            license: String::new(),
            version: 1,
            api_version: DRIVER_API_VERSION,
            driver_type,
            flags: DriverFlags::LOADABLE,
            id_table: Vec::new(),
            matcher: None,
            ops,
        }
    }

    pub fn with_flags(mut self, flags: DriverFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_match(mut self, entry: MatchEntry) -> Self {
        self.id_table.push(entry);
        self
    }

    pub fn with_matcher(
        mut self,
        matcher: impl Fn(&DeviceIdentity) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.matcher = Some(Arc::new(matcher));
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_api_version(mut self, api_version: u32) -> Self {
        self.api_version = api_version;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.license = license.into();
        self
    }

    /// Reject malformed registrations.
    ///
    /// # Errors
    ///
    /// [`DriverError::Config`] for an empty or over-long name, or an API
    /// version other than [`DRIVER_API_VERSION`].
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.name.is_empty() || self.name.len() > NAME_MAX {
            return Err(DriverError::Config);
        }
        if self.api_version != DRIVER_API_VERSION {
            return Err(DriverError::Config);
        }
        Ok(())
    }

    /// Custom predicate first, then the first matching ID-table row.
    pub fn find_match(&self, identity: &DeviceIdentity) -> Option<Match> {
        if let Some(matcher) = &self.matcher {
            return matcher(identity).then_some(Match::Custom);
        }
        self.id_table
            .iter()
            .find(|entry| entry.matches(identity))
            .map(|entry| Match::Entry(*entry))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Registry record
// ────────────────────────────────────────────────────────────────────────────

/// A registered driver. Lives in the registry arena; every mutable field is
/// guarded by the registry lock.
pub(crate) struct DriverRecord {
    pub descriptor: DriverDescriptor,
    pub sandbox: Arc<SandboxEnvelope>,
    pub load_time_us: u64,
    pub bound_devices: u32,
    pub error_count: u32,
    /// Set while the driver is being unregistered; refuses new bindings.
    pub retiring: bool,
}

impl DriverRecord {
    pub fn stats(&self) -> DriverStats {
        DriverStats {
            load_time_us: self.load_time_us,
            bound_devices: self.bound_devices,
            error_count: self.error_count,
        }
    }
}

/// Read-only view of a registered driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverInfo {
    pub handle: DriverHandle,
    pub name: String,
    pub description: String,
    pub version: u32,
    pub driver_type: DriverType,
    pub flags: DriverFlags,
    pub permissions: Permissions,
    pub stats: DriverStats,
}

impl DriverInfo {
    pub(crate) fn from_record(handle: DriverHandle, record: &DriverRecord) -> Self {
        Self {
            handle,
            name: record.descriptor.name.clone(),
            description: record.descriptor.description.clone(),
            version: record.descriptor.version,
            driver_type: record.descriptor.driver_type,
            flags: record.descriptor.flags,
            permissions: record.sandbox.permissions(),
            stats: record.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devframe_types::MATCH_ANY;

    struct Nop;

    impl Driver for Nop {
        fn probe(&self, _device: &Device, _matched: Option<&MatchEntry>) -> Result<(), DriverError> {
            Ok(())
        }
        fn remove(&self, _device: &Device) -> Result<(), DriverError> {
            Ok(())
        }
    }

    fn descriptor(name: &str) -> DriverDescriptor {
        DriverDescriptor::new(name, DriverType::Storage, Arc::new(Nop))
    }

    #[test]
    fn validate_rejects_bad_names_and_api_versions() {
        assert!(descriptor("nvme").validate().is_ok());
        assert_eq!(descriptor("").validate(), Err(DriverError::Config));
        assert_eq!(
            descriptor(&"x".repeat(NAME_MAX + 1)).validate(),
            Err(DriverError::Config)
        );
        assert_eq!(
            descriptor("nvme").with_api_version(2).validate(),
            Err(DriverError::Config)
        );
    }

    #[test]
    fn first_matching_row_wins() {
        let desc = descriptor("ahci")
            .with_match(MatchEntry::pci(0x8086, 0x2922).with_driver_data(1))
            .with_match(MatchEntry::class(0x01_06_00, 0xFF_FF_00).with_driver_data(2));

        let exact = desc.find_match(&DeviceIdentity::new(0x8086, 0x2922, 0x01_06_01));
        assert_eq!(exact.and_then(|m| m.entry().map(|e| e.driver_data)), Some(1));

        let by_class = desc.find_match(&DeviceIdentity::new(0x1b4b, 0x9215, 0x01_06_01));
        assert_eq!(by_class.and_then(|m| m.entry().map(|e| e.driver_data)), Some(2));

        assert!(desc.find_match(&DeviceIdentity::new(0x1b4b, 0x9215, 0x02_00_00)).is_none());
    }

    #[test]
    fn custom_matcher_overrides_table() {
        let desc = descriptor("virtio")
            .with_match(MatchEntry {
                vendor_id: MATCH_ANY,
                device_id: MATCH_ANY,
                class_id: MATCH_ANY,
                class_mask: 0,
                driver_data: 0,
            })
            .with_matcher(|id| id.vendor_id == 0x1af4);

        assert_eq!(
            desc.find_match(&DeviceIdentity::new(0x1af4, 0x1000, 0)),
            Some(Match::Custom)
        );
        assert_eq!(desc.find_match(&DeviceIdentity::new(0x8086, 0x1000, 0)), None);
    }

    #[test]
    fn builder_accumulates_flags_and_metadata() {
        let desc = descriptor("snd")
            .with_flags(DriverFlags::HOTPLUG)
            .with_flags(DriverFlags::POWER_MANAGED)
            .with_version(3)
            .with_description("HD audio")
            .with_author("devframe")
            .with_license("MIT");
        assert!(desc.flags.contains(DriverFlags::LOADABLE | DriverFlags::HOTPLUG));
        assert!(desc.flags.contains(DriverFlags::POWER_MANAGED));
        assert_eq!(desc.version, 3);
        assert_eq!(desc.license, "MIT");
        assert!(format!("{desc:?}").contains("snd"));
    }
}
