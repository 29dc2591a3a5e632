//! Shared vocabulary of the devframe driver framework.
//!
//! Every other crate in the workspace speaks in these types: the closed
//! [`DriverError`] taxonomy, device identities and match-table entries,
//! driver type tags and flag sets, the sandbox [`Permissions`] bitmask,
//! the device / power / hot-plug lifecycle enums and the statistics
//! snapshots handed out to diagnostics callers.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version of the driver operation contract. Drivers declaring any other
/// value are rejected at registration.
pub const DRIVER_API_VERSION: u32 = 1;

/// Wildcard for vendor, device and class fields of a [`MatchEntry`].
pub const MATCH_ANY: u32 = 0xFFFF_FFFF;

/// Longest accepted driver or device name, in bytes.
pub const NAME_MAX: usize = 64;

/// Maximum number of resource descriptors attached to one device.
pub const MAX_RESOURCES: usize = 8;

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Closed set of failure kinds returned by every framework operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverError {
    #[error("no such device or driver")]
    NoDevice,

    #[error("out of memory or table capacity")]
    NoMemory,

    #[error("resource busy")]
    Busy,

    #[error("operation timed out")]
    Timeout,

    #[error("operation not supported")]
    NotSupported,

    #[error("malformed registration")]
    Config,

    #[error("hardware failed permanently")]
    Hardware,

    #[error("event queue full")]
    QueueFull,
}

// ────────────────────────────────────────────────────────────────────────────
// Handles
// ────────────────────────────────────────────────────────────────────────────

macro_rules! arena_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            index: u32,
            generation: u32,
        }

        impl $name {
            /// Assemble a handle from its slot index and slot generation.
            pub const fn from_raw_parts(index: u32, generation: u32) -> Self {
                Self { index, generation }
            }

            pub const fn index(self) -> u32 {
                self.index
            }

            pub const fn generation(self) -> u32 {
                self.generation
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}.{}"), self.index, self.generation)
            }
        }
    };
}

arena_handle!(
    /// Stable reference to a registered driver. Goes stale (and resolves to
    /// [`DriverError::NoDevice`]) once the driver is unregistered.
    DriverHandle,
    "drv"
);

arena_handle!(
    /// Stable reference to a registered device.
    DeviceHandle,
    "dev"
);

// ────────────────────────────────────────────────────────────────────────────
// Driver classification
// ────────────────────────────────────────────────────────────────────────────

/// Class of hardware a driver serves. Determines its sandbox permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DriverType {
    #[default]
    Unknown,
    Bus,
    Storage,
    Network,
    Audio,
    Video,
    Input,
    Sensor,
    Power,
    Crypto,
    Ai,
    Virtual,
    Platform,
    Misc,
}

impl DriverType {
    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Bus => "Bus Controller",
            Self::Storage => "Storage",
            Self::Network => "Network",
            Self::Audio => "Audio",
            Self::Video => "Video/Graphics",
            Self::Input => "Input",
            Self::Sensor => "Sensor",
            Self::Power => "Power Management",
            Self::Crypto => "Cryptographic",
            Self::Ai => "AI/ML Accelerator",
            Self::Virtual => "Virtual",
            Self::Platform => "Platform",
            Self::Misc => "Miscellaneous",
        }
    }
}

impl fmt::Display for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

bitflags! {
    /// Capability flags a driver declares at registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DriverFlags: u32 {
        const LOADABLE = 1 << 0;
        const BUILTIN = 1 << 1;
        /// Eligible for automatic binding to hot-plugged devices.
        const HOTPLUG = 1 << 2;
        const EXCLUSIVE = 1 << 3;
        const SHARED = 1 << 4;
        const REAL_TIME = 1 << 5;
        const POWER_MANAGED = 1 << 6;
    }
}

bitflags! {
    /// Access rights applied to a driver's security context.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Permissions: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const DMA = 1 << 2;
        const NETWORK = 1 << 3;
        const MMIO = 1 << 4;
    }
}

impl Permissions {
    /// Fixed permission table keyed by driver type.
    pub const fn for_driver_type(driver_type: DriverType) -> Self {
        let base = Self::READ.union(Self::WRITE);
        match driver_type {
            DriverType::Storage => base.union(Self::DMA),
            DriverType::Network => base.union(Self::NETWORK),
            DriverType::Audio | DriverType::Video => base.union(Self::DMA).union(Self::MMIO),
            _ => base,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Device lifecycle
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceState {
    #[default]
    Uninitialized,
    Initializing,
    Active,
    Suspended,
    /// Permanently failed; only cleared when the failing driver is
    /// unregistered.
    Error,
    /// Hot-unplugged. Terminal.
    Removed,
}

impl DeviceState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Initializing => "Initializing",
            Self::Active => "Active",
            Self::Suspended => "Suspended",
            Self::Error => "Error",
            Self::Removed => "Removed",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// PCI-style device power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PowerState {
    /// Fully powered.
    D0,
    D1,
    D2,
    /// Power off, context preserved.
    D3Hot,
    /// Power off, context lost.
    #[default]
    D3Cold,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::D0 => "D0",
            Self::D1 => "D1",
            Self::D2 => "D2",
            Self::D3Hot => "D3hot",
            Self::D3Cold => "D3cold",
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Identity and matching
// ────────────────────────────────────────────────────────────────────────────

/// Vendor / device / class triple read from the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u32,
    pub device_id: u32,
    pub class_id: u32,
}

impl DeviceIdentity {
    pub const fn new(vendor_id: u32, device_id: u32, class_id: u32) -> Self {
        Self {
            vendor_id,
            device_id,
            class_id,
        }
    }
}

/// One row of a driver's device-ID table.
///
/// `vendor_id` and `device_id` match exactly or via [`MATCH_ANY`]; the class
/// matches when `class_id` is [`MATCH_ANY`] or when
/// `device.class_id & class_mask == class_id`.
///
/// ```
/// use devframe_types::{DeviceIdentity, MatchEntry};
///
/// let nvme = MatchEntry::class(0x01_08_02, 0xFF_FF_FF);
/// assert!(nvme.matches(&DeviceIdentity::new(0x144d, 0xa808, 0x01_08_02)));
/// assert!(!nvme.matches(&DeviceIdentity::new(0x144d, 0xa808, 0x02_00_00)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchEntry {
    pub vendor_id: u32,
    pub device_id: u32,
    pub class_id: u32,
    pub class_mask: u32,
    /// Opaque value handed back to the driver's probe on a match.
    pub driver_data: u64,
}

impl MatchEntry {
    /// Exact PCI vendor/device pair, any class.
    pub const fn pci(vendor_id: u16, device_id: u16) -> Self {
        Self {
            vendor_id: vendor_id as u32,
            device_id: device_id as u32,
            class_id: MATCH_ANY,
            class_mask: 0,
            driver_data: 0,
        }
    }

    /// Exact USB vendor/product pair, any class.
    pub const fn usb(vendor_id: u16, product_id: u16) -> Self {
        Self::pci(vendor_id, product_id)
    }

    /// Any vendor and device whose masked class equals `class_id`.
    pub const fn class(class_id: u32, class_mask: u32) -> Self {
        Self {
            vendor_id: MATCH_ANY,
            device_id: MATCH_ANY,
            class_id,
            class_mask,
            driver_data: 0,
        }
    }

    pub const fn with_driver_data(mut self, driver_data: u64) -> Self {
        self.driver_data = driver_data;
        self
    }

    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        (self.vendor_id == MATCH_ANY || self.vendor_id == identity.vendor_id)
            && (self.device_id == MATCH_ANY || self.device_id == identity.device_id)
            && (self.class_id == MATCH_ANY
                || identity.class_id & self.class_mask == self.class_id)
    }
}

/// Hardware resource claimed by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    Memory { start: u64, size: u64, flags: u32 },
    Io { start: u16, end: u16 },
    Irq { irq: u32, flags: u32 },
    Dma { channel: u32, flags: u32 },
}

// ────────────────────────────────────────────────────────────────────────────
// Hot-plug vocabulary
// ────────────────────────────────────────────────────────────────────────────

/// Bus family a hot-plugged device was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusKind {
    Pcie,
    Usb,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pcie => "PCIe",
            Self::Usb => "USB",
        })
    }
}

/// Bus-specific position of a hot-pluggable device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusLocation {
    Pci { bus: u8, device: u8, function: u8 },
    /// Root-hub port of a USB host controller.
    Usb { controller: u8, port: u8 },
}

impl BusLocation {
    pub const fn pci(bus: u8, device: u8, function: u8) -> Self {
        Self::Pci {
            bus,
            device,
            function,
        }
    }

    pub const fn usb(controller: u8, port: u8) -> Self {
        Self::Usb { controller, port }
    }

    pub const fn kind(&self) -> BusKind {
        match self {
            Self::Pci { .. } => BusKind::Pcie,
            Self::Usb { .. } => BusKind::Usb,
        }
    }
}

impl fmt::Display for BusLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pci {
                bus,
                device,
                function,
            } => write!(f, "{bus:02x}:{device:02x}.{function:x}"),
            Self::Usb { controller, port } => write!(f, "usb{controller}-{port}"),
        }
    }
}

/// Lifecycle of a hot-plug observation, distinct from [`DeviceState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HotplugState {
    Arriving,
    Active,
    Removing,
    Removed,
    /// No driver could be loaded for the device.
    Failed,
}

impl fmt::Display for HotplugState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Arriving => "arriving",
            Self::Active => "active",
            Self::Removing => "removing",
            Self::Removed => "removed",
            Self::Failed => "failed",
        })
    }
}

/// What happened to a hot-plug device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HotplugEventKind {
    Arrival,
    Removal,
}

// ────────────────────────────────────────────────────────────────────────────
// Statistics snapshots
// ────────────────────────────────────────────────────────────────────────────

/// Per-driver counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DriverStats {
    /// Monotonic timestamp (µs) at which the driver was registered.
    pub load_time_us: u64,
    pub bound_devices: u32,
    pub error_count: u32,
}

/// Framework-wide binding counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameworkStats {
    pub probes: u64,
    pub total_probe_time_us: u64,
    pub crashes: u64,
    /// Devices driven into [`DeviceState::Error`].
    pub permanent_failures: u64,
}

/// Hot-plug pipeline counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HotplugStats {
    pub total_detected: u64,
    pub arrivals: u64,
    pub removals: u64,
    pub failures: u64,
    pub active_devices: u32,
    pub avg_detection_time_us: u64,
    pub avg_driver_load_time_us: u64,
    pub dropped_events: u64,
}
