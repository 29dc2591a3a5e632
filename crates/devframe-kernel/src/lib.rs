//! Device/driver registry, binding engine, driver sandboxes, crash recovery
//! and power coordination.
//!
//! The entry point is [`DeviceFramework`]. Drivers implement [`Driver`] and
//! register through a [`DriverDescriptor`]; devices are described with
//! [`Device`] and referred to afterwards by
//! [`DeviceHandle`](devframe_types::DeviceHandle).

mod arena;
mod binding;
pub mod config;
pub mod device;
pub mod driver;
mod framework;
mod power;
mod recovery;
pub mod sandbox;

#[cfg(test)]
mod testing;

pub use config::KernelConfig;
pub use device::{Device, DeviceInfo};
pub use driver::{
    Driver, DriverDescriptor, DriverInfo, InterruptHandler, IrqReturn, Match, MatchFn,
    PowerManagement,
};
pub use framework::DeviceFramework;
pub use sandbox::{CrashRecord, SandboxEnvelope};
