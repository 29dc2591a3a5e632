//! Simulated collaborators for headless tests.
//!
//! | Type | Behaviour |
//! |---|---|
//! | [`SimHal`] | Virtual clock; `sleep` advances it instantly. Tracks outstanding DMA regions and can be told to fail allocations. |
//! | [`SimSecurity`] | Tracks live contexts and applied permissions. Context creation and policy application can be made to fail, and creation can be made to stall. |
//! | [`SimPciBus`] | Sparse config space keyed by `(bus, device, function)`. Inserting or removing a function fires the hot-plug IRQ handler if one is installed. |
//! | [`SimUsbBus`] | Fixed controller/port topology. Attaching or detaching a device fires the port-change handler if one is installed. Enumeration can be made to fail or stall. |
//!
//! # Example
//!
//! ```rust
//! use devframe_hal::sim::{SimPciBus, SimPciFunction};
//! use devframe_hal::PciBus;
//!
//! let bus = SimPciBus::new();
//! bus.insert(0, 1, 0, SimPciFunction::new(0x8086, 0x100e, 0x02_00_00));
//! assert_eq!(bus.vendor_id(0, 1, 0), 0x8086);
//! assert_eq!(bus.vendor_id(0, 2, 0), 0xFFFF);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use devframe_types::{DriverError, Permissions};

use crate::bus::{
    PCI_CLASS_OFFSET, PCI_HEADER_MULTIFUNCTION, PCI_HEADER_OFFSET, PCI_ID_OFFSET, PciBus,
    PciHotplugHandler, UsbBus, UsbDeviceInfo, UsbPortChangeHandler,
};
use crate::platform::{DmaRegion, Hal};
use crate::security::{SecurityContextId, SecurityProvider};

// ────────────────────────────────────────────────────────────────────────────
// HAL
// ────────────────────────────────────────────────────────────────────────────

/// [`Hal`] with a virtual clock and an instrumented DMA allocator.
#[derive(Debug, Default)]
pub struct SimHal {
    clock_us: AtomicU64,
    next_region: AtomicU64,
    outstanding: Mutex<HashSet<u64>>,
    fail_dma: AtomicBool,
    sleeps: Mutex<Vec<Duration>>,
}

impl SimHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the virtual clock forward.
    pub fn advance(&self, by: Duration) {
        let micros = u64::try_from(by.as_micros()).unwrap_or(u64::MAX);
        self.clock_us.fetch_add(micros, Ordering::AcqRel);
    }

    /// Make every following DMA allocation fail with `NoMemory`.
    pub fn fail_dma_allocations(&self, fail: bool) {
        self.fail_dma.store(fail, Ordering::Release);
    }

    /// Regions allocated and not yet freed.
    pub fn outstanding_dma(&self) -> usize {
        self.outstanding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Every duration passed to [`Hal::sleep`], in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Hal for SimHal {
    fn now_us(&self) -> u64 {
        self.clock_us.load(Ordering::Acquire)
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
        self.advance(duration);
    }

    fn alloc_dma_coherent(&self, size: usize) -> Result<DmaRegion, DriverError> {
        if self.fail_dma.load(Ordering::Acquire) {
            return Err(DriverError::NoMemory);
        }
        let id = self.next_region.fetch_add(1, Ordering::Relaxed) + 1;
        let region = DmaRegion::zeroed(id, size)?;
        self.outstanding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
        Ok(region)
    }

    fn free_dma_coherent(&self, region: DmaRegion) {
        self.outstanding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&region.id());
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Security
// ────────────────────────────────────────────────────────────────────────────

/// [`SecurityProvider`] with context accounting and fault injection.
#[derive(Debug, Default)]
pub struct SimSecurity {
    next_id: AtomicU64,
    live: Mutex<HashMap<SecurityContextId, Permissions>>,
    fail_create: AtomicBool,
    fail_apply: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
}

impl SimSecurity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_context_creation(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::Release);
    }

    pub fn fail_policy_application(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::Release);
    }

    /// Make context creation stall for `delay`, like a slow policy engine.
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        *self.create_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn live_contexts(&self) -> usize {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Permissions most recently applied to `context`, if it is live.
    pub fn permissions_of(&self, context: SecurityContextId) -> Option<Permissions> {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&context)
            .copied()
    }
}

impl SecurityProvider for SimSecurity {
    fn create_context(&self, _label: &str) -> Result<SecurityContextId, DriverError> {
        let delay = *self.create_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.fail_create.load(Ordering::Acquire) {
            return Err(DriverError::NoMemory);
        }
        let id = SecurityContextId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Permissions::empty());
        Ok(id)
    }

    fn destroy_context(&self, context: SecurityContextId) {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&context);
    }

    fn apply_permissions(
        &self,
        context: SecurityContextId,
        permissions: Permissions,
    ) -> Result<(), DriverError> {
        if self.fail_apply.load(Ordering::Acquire) {
            return Err(DriverError::Config);
        }
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        let slot = live.get_mut(&context).ok_or(DriverError::NoDevice)?;
        *slot = permissions;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PCI
// ────────────────────────────────────────────────────────────────────────────

/// One simulated PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimPciFunction {
    pub vendor_id: u16,
    pub device_id: u16,
    /// 24-bit class code.
    pub class_code: u32,
    pub multifunction: bool,
}

impl SimPciFunction {
    pub fn new(vendor_id: u16, device_id: u16, class_code: u32) -> Self {
        Self {
            vendor_id,
            device_id,
            class_code: class_code & 0x00FF_FFFF,
            multifunction: false,
        }
    }

    pub fn multifunction(mut self) -> Self {
        self.multifunction = true;
        self
    }
}

/// Sparse simulated PCI segment.
#[derive(Default)]
pub struct SimPciBus {
    functions: Mutex<HashMap<(u8, u8, u8), SimPciFunction>>,
    handler: Mutex<Option<PciHotplugHandler>>,
    reads: AtomicUsize,
}

impl SimPciBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a function into `(bus, device, function)`.
    pub fn insert(&self, bus: u8, device: u8, function: u8, info: SimPciFunction) {
        self.functions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((bus, device, function), info);
        self.raise_irq(bus, device, function);
    }

    /// Pull the function at `(bus, device, function)`.
    pub fn remove(&self, bus: u8, device: u8, function: u8) {
        let removed = self
            .functions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(bus, device, function));
        if removed.is_some() {
            self.raise_irq(bus, device, function);
        }
    }

    /// Total config-space reads served so far.
    pub fn config_reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn has_handler(&self) -> bool {
        self.handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn raise_irq(&self, bus: u8, device: u8, function: u8) {
        // Clone out so the handler runs without our locks held.
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler(bus, device, function);
        }
    }
}

impl PciBus for SimPciBus {
    fn read_config_u32(&self, bus: u8, device: u8, function: u8, offset: u8) -> u32 {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let functions = self.functions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(info) = functions.get(&(bus, device, function)) else {
            return u32::MAX;
        };
        match offset {
            PCI_ID_OFFSET => (u32::from(info.device_id) << 16) | u32::from(info.vendor_id),
            PCI_CLASS_OFFSET => info.class_code << 8,
            PCI_HEADER_OFFSET if info.multifunction => {
                u32::from(PCI_HEADER_MULTIFUNCTION) << 16
            }
            _ => 0,
        }
    }

    fn set_hotplug_handler(&self, handler: PciHotplugHandler) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// USB
// ────────────────────────────────────────────────────────────────────────────

/// Simulated USB host controllers with fixed root-hub sizes.
pub struct SimUsbBus {
    ports_per_controller: Vec<u8>,
    attached: Mutex<HashMap<(u8, u8), UsbDeviceInfo>>,
    handler: Mutex<Option<UsbPortChangeHandler>>,
    fail_enumeration: AtomicBool,
    enumeration_delay: Mutex<Option<Duration>>,
}

impl SimUsbBus {
    /// One controller per entry of `ports_per_controller`.
    pub fn new(ports_per_controller: &[u8]) -> Self {
        Self {
            ports_per_controller: ports_per_controller.to_vec(),
            attached: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            fail_enumeration: AtomicBool::new(false),
            enumeration_delay: Mutex::new(None),
        }
    }

    pub fn attach(&self, controller: u8, port: u8, info: UsbDeviceInfo) {
        self.attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((controller, port), info);
        self.raise_irq(controller, port);
    }

    pub fn detach(&self, controller: u8, port: u8) {
        let removed = self
            .attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(controller, port));
        if removed.is_some() {
            self.raise_irq(controller, port);
        }
    }

    /// Make enumeration of connected ports fail with `Hardware`.
    pub fn fail_enumeration(&self, fail: bool) {
        self.fail_enumeration.store(fail, Ordering::Release);
    }

    /// Make every enumeration stall for `delay`, like a slow descriptor read.
    pub fn set_enumeration_delay(&self, delay: Option<Duration>) {
        *self
            .enumeration_delay
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = delay;
    }

    fn raise_irq(&self, controller: u8, port: u8) {
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler(controller, port);
        }
    }
}

impl UsbBus for SimUsbBus {
    fn controller_count(&self) -> u8 {
        u8::try_from(self.ports_per_controller.len()).unwrap_or(u8::MAX)
    }

    fn root_port_count(&self, controller: u8) -> u8 {
        self.ports_per_controller
            .get(usize::from(controller))
            .copied()
            .unwrap_or(0)
    }

    fn port_connected(&self, controller: u8, port: u8) -> bool {
        self.attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(controller, port))
    }

    fn enumerate_device(&self, controller: u8, port: u8) -> Result<UsbDeviceInfo, DriverError> {
        let delay = *self
            .enumeration_delay
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.fail_enumeration.load(Ordering::Acquire) {
            return Err(DriverError::Hardware);
        }
        self.attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(controller, port))
            .cloned()
            .ok_or(DriverError::NoDevice)
    }

    fn set_port_change_handler(&self, handler: UsbPortChangeHandler) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sim_hal_sleep_advances_virtual_clock() {
        let hal = SimHal::new();
        assert_eq!(hal.now_us(), 0);
        hal.sleep(Duration::from_millis(1000));
        assert_eq!(hal.now_us(), 1_000_000);
        assert_eq!(hal.sleeps(), vec![Duration::from_millis(1000)]);
    }

    #[test]
    fn sim_hal_counts_outstanding_and_injects_failures() {
        let hal = SimHal::new();
        let region = hal.alloc_dma_coherent(4096).unwrap();
        assert_eq!(hal.outstanding_dma(), 1);
        hal.free_dma_coherent(region);
        assert_eq!(hal.outstanding_dma(), 0);

        hal.fail_dma_allocations(true);
        assert_eq!(
            hal.alloc_dma_coherent(4096).unwrap_err(),
            DriverError::NoMemory
        );
        assert_eq!(hal.outstanding_dma(), 0);
    }

    #[test]
    fn sim_security_tracks_applied_permissions() {
        let security = SimSecurity::new();
        let ctx = security.create_context("nvme").unwrap();
        security
            .apply_permissions(ctx, Permissions::READ | Permissions::DMA)
            .unwrap();
        assert_eq!(
            security.permissions_of(ctx),
            Some(Permissions::READ | Permissions::DMA)
        );

        security.fail_context_creation(true);
        assert!(security.create_context("other").is_err());
        assert_eq!(security.live_contexts(), 1);

        security.destroy_context(ctx);
        assert_eq!(security.live_contexts(), 0);
    }

    #[test]
    fn sim_pci_reports_header_and_fires_irq() {
        let bus = SimPciBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.set_hotplug_handler(Arc::new(move |b, d, f| {
            sink.lock().unwrap().push((b, d, f));
        }));

        bus.insert(2, 3, 0, SimPciFunction::new(0x10de, 0x2204, 0x03_00_00).multifunction());
        assert_eq!(bus.class_code(2, 3, 0), 0x03_00_00);
        assert_eq!(bus.header_type(2, 3, 0), PCI_HEADER_MULTIFUNCTION);

        bus.remove(2, 3, 0);
        bus.remove(2, 3, 0);
        assert_eq!(*seen.lock().unwrap(), vec![(2, 3, 0), (2, 3, 0)]);
        assert_eq!(bus.vendor_id(2, 3, 0), 0xFFFF);
    }

    #[test]
    fn sim_usb_topology_and_enumeration() {
        let bus = SimUsbBus::new(&[4, 2]);
        assert_eq!(bus.controller_count(), 2);
        assert_eq!(bus.root_port_count(1), 2);
        assert_eq!(bus.root_port_count(5), 0);

        let info = UsbDeviceInfo {
            vendor_id: 0x046d,
            product_id: 0xc52b,
            serial: "A1".into(),
            ..UsbDeviceInfo::default()
        };
        bus.attach(0, 2, info.clone());
        assert!(bus.port_connected(0, 2));
        assert_eq!(bus.enumerate_device(0, 2).unwrap(), info);
        assert_eq!(bus.enumerate_device(0, 3).unwrap_err(), DriverError::NoDevice);

        bus.set_enumeration_delay(Some(Duration::from_millis(20)));
        let started = std::time::Instant::now();
        assert_eq!(bus.enumerate_device(0, 2).unwrap(), info);
        assert!(started.elapsed() >= Duration::from_millis(20));
        bus.set_enumeration_delay(None);

        bus.fail_enumeration(true);
        assert_eq!(bus.enumerate_device(0, 2).unwrap_err(), DriverError::Hardware);

        bus.detach(0, 2);
        assert!(!bus.port_connected(0, 2));
    }
}
