//! [`Device`] – one hardware instance known to the registry.
//!
//! Devices are shared as `Arc<Device>`: the registry holds one reference and
//! any thread mid-operation (a probe thread, an interrupt dispatch) may hold
//! more, so unregistering never frees a device out from under a user. The
//! mutable part sits behind a per-device lock, which keeps one device's
//! probe from blocking operations on an unrelated device.

use std::sync::{Mutex, MutexGuard, OnceLock};

use devframe_types::{
    DeviceHandle, DeviceIdentity, DeviceState, DriverError, DriverHandle, MAX_RESOURCES, NAME_MAX,
    PowerState, Resource,
};
use serde::Serialize;

#[derive(Debug)]
pub(crate) struct DeviceInner {
    pub state: DeviceState,
    pub power: PowerState,
    pub driver: Option<DriverHandle>,
    /// `driver_data` of the matching ID-table row.
    pub match_data: Option<u64>,
    /// A probe (or recovery) is in flight; unbind must wait.
    pub probing: bool,
    pub unbinding: bool,
    pub children: Vec<DeviceHandle>,
    /// Driver whose binding with this device is dead.
    pub failed_driver: Option<DriverHandle>,
}

/// A registered (or about to be registered) device.
#[derive(Debug)]
pub struct Device {
    name: String,
    identity: DeviceIdentity,
    parent: Option<DeviceHandle>,
    resources: Vec<Resource>,
    handle: OnceLock<DeviceHandle>,
    inner: Mutex<DeviceInner>,
}

impl Device {
    /// A new device in state `Uninitialized`, power `D3Cold`, unbound.
    pub fn new(name: impl Into<String>, identity: DeviceIdentity) -> Self {
        Self {
            name: name.into(),
            identity,
            parent: None,
            resources: Vec::new(),
            handle: OnceLock::new(),
            inner: Mutex::new(DeviceInner {
                state: DeviceState::Uninitialized,
                power: PowerState::D3Cold,
                driver: None,
                match_data: None,
                probing: false,
                unbinding: false,
                children: Vec::new(),
                failed_driver: None,
            }),
        }
    }

    pub fn with_parent(mut self, parent: DeviceHandle) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn parent(&self) -> Option<DeviceHandle> {
        self.parent
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Registry handle, once registered.
    pub fn handle(&self) -> Option<DeviceHandle> {
        self.handle.get().copied()
    }

    pub fn state(&self) -> DeviceState {
        self.lock().state
    }

    pub fn power_state(&self) -> PowerState {
        self.lock().power
    }

    pub fn driver(&self) -> Option<DriverHandle> {
        self.lock().driver
    }

    /// `driver_data` of the ID-table row the bound driver matched on.
    pub fn match_data(&self) -> Option<u64> {
        self.lock().match_data
    }

    pub fn children(&self) -> Vec<DeviceHandle> {
        self.lock().children.clone()
    }

    pub(crate) fn validate(&self) -> Result<(), DriverError> {
        if self.name.is_empty() || self.name.len() > NAME_MAX {
            return Err(DriverError::Config);
        }
        if self.resources.len() > MAX_RESOURCES {
            return Err(DriverError::Config);
        }
        Ok(())
    }

    pub(crate) fn assign_handle(&self, handle: DeviceHandle) {
        let _ = self.handle.set(handle);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DeviceInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn info(&self, handle: DeviceHandle) -> DeviceInfo {
        let inner = self.lock();
        DeviceInfo {
            handle,
            name: self.name.clone(),
            identity: self.identity,
            state: inner.state,
            power: inner.power,
            driver: inner.driver,
            parent: self.parent,
            children: inner.children.clone(),
        }
    }
}

/// Point-in-time view of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub handle: DeviceHandle,
    pub name: String,
    pub identity: DeviceIdentity,
    pub state: DeviceState,
    pub power: PowerState,
    pub driver: Option<DriverHandle>,
    pub parent: Option<DeviceHandle>,
    pub children: Vec<DeviceHandle>,
}
