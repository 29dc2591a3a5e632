//! Hot-plug detection and event processing on top of
//! [`devframe_kernel::DeviceFramework`].
//!
//! Data flows one way:
//!
//! ```text
//! PciBus / UsbBus ──scan or IRQ──▶ HotplugDetector ──post──▶ EventQueue
//!                                                              │
//!                      DeviceFramework ◀──register/bind── HotplugProcessor
//! ```
//!
//! The [`DeviceTracker`] is shared by the detector and the processor and
//! holds every device between its first sighting and its processed
//! removal. Threads are not started here; `devframe-runtime` owns them.

pub mod config;
pub mod detector;
pub mod device;
pub mod event;
pub mod processor;
pub mod queue;
pub mod shutdown;
pub mod tracker;

pub use config::HotplugConfig;
pub use detector::{HotplugDetector, ScanReport};
pub use device::{HotplugCaps, HotplugDevice, HotplugDeviceInfo};
pub use event::HotplugEvent;
pub use processor::{HotplugListener, HotplugProcessor};
pub use queue::EventQueue;
pub use shutdown::{Doorbell, Shutdown};
pub use tracker::DeviceTracker;
