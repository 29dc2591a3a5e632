//! Collaborator contracts of the devframe driver framework.
//!
//! The framework never touches hardware directly. Everything it needs from
//! the platform goes through four narrow traits:
//!
//! | Trait | Provides |
//! |---|---|
//! | [`Hal`] | monotonic clock, sleep, DMA-coherent allocation |
//! | [`SecurityProvider`] | security contexts and permission policies |
//! | [`PciBus`] | config-space reads and the hot-plug IRQ hook |
//! | [`UsbBus`] | root-hub port status, enumeration and the port-change IRQ hook |
//!
//! [`SystemHal`] and [`PermissiveSecurity`] back the first two with the
//! standard library. The [`sim`] module provides fully simulated versions
//! of all four for headless tests.

pub mod bus;
pub mod platform;
pub mod security;
pub mod sim;

pub use bus::{PciBus, PciHotplugHandler, UsbBus, UsbDeviceInfo, UsbPortChangeHandler};
pub use platform::{DmaRegion, Hal, SystemHal};
pub use security::{PermissiveSecurity, SecurityContextId, SecurityProvider};
