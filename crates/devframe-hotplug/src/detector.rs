//! [`HotplugDetector`] – finds arrivals and removals on PCIe and USB.
//!
//! Two sources feed the same queue: the periodic scans
//! ([`HotplugDetector::scan_pcie`], [`HotplugDetector::scan_usb`], driven by
//! the poll loops) and the bus interrupt hooks installed by
//! [`HotplugDetector::install_irq_handlers`]. The interrupt hooks never
//! block: they post what a register read can tell them and leave USB
//! enumeration to the `hotplug-usb` poller. Either way nothing sticks
//! unless its event was posted: an arrival is tracked only after the post
//! succeeds and a removal is rolled back on a full queue, so a dropped event
//! is simply rediscovered on the next tick.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use devframe_hal::bus::{
    PCI_BUS_COUNT, PCI_DEVICES_PER_BUS, PCI_FUNCTIONS_PER_DEVICE, PCI_HEADER_MULTIFUNCTION,
    PCI_VENDOR_NONE,
};
use devframe_hal::{Hal, PciBus, UsbBus};
use devframe_types::{BusKind, BusLocation, DeviceIdentity};
use tracing::{debug, info, warn};

use crate::config::HotplugConfig;
use crate::device::HotplugDevice;
use crate::event::HotplugEvent;
use crate::queue::EventQueue;
use crate::shutdown::{Doorbell, Shutdown};
use crate::tracker::DeviceTracker;

/// Outcome of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub arrivals: usize,
    pub removals: usize,
}

pub struct HotplugDetector {
    hal: Arc<dyn Hal>,
    pci: Option<Arc<dyn PciBus>>,
    usb: Option<Arc<dyn UsbBus>>,
    queue: Arc<EventQueue>,
    tracker: Arc<DeviceTracker>,
    config: HotplugConfig,
    usb_doorbell: Doorbell,
}

impl HotplugDetector {
    pub fn new(
        hal: Arc<dyn Hal>,
        queue: Arc<EventQueue>,
        tracker: Arc<DeviceTracker>,
        config: HotplugConfig,
    ) -> Self {
        Self {
            hal,
            pci: None,
            usb: None,
            queue,
            tracker,
            config,
            usb_doorbell: Doorbell::new(),
        }
    }

    pub fn with_pci(mut self, bus: Arc<dyn PciBus>) -> Self {
        self.pci = Some(bus);
        self
    }

    pub fn with_usb(mut self, bus: Arc<dyn UsbBus>) -> Self {
        self.usb = Some(bus);
        self
    }

    pub fn has_pci(&self) -> bool {
        self.pci.is_some()
    }

    pub fn has_usb(&self) -> bool {
        self.usb.is_some()
    }

    // ── PCIe ───────────────────────────────────────────────────────────────

    /// Walk every bus/device/function once.
    pub fn scan_pcie(&self) -> ScanReport {
        let mut report = ScanReport::default();
        let Some(pci) = &self.pci else {
            return report;
        };
        let started = self.hal.now_us();
        let mut present = HashSet::new();

        for bus in 0..PCI_BUS_COUNT {
            let bus = bus as u8;
            for device in 0..PCI_DEVICES_PER_BUS {
                for function in 0..PCI_FUNCTIONS_PER_DEVICE {
                    let vendor = pci.vendor_id(bus, device, function);
                    if vendor == PCI_VENDOR_NONE {
                        if function == 0 {
                            break;
                        }
                        continue;
                    }
                    let location = BusLocation::pci(bus, device, function);
                    present.insert(location);
                    if self.pcie_arrival(pci.as_ref(), location, started) {
                        report.arrivals += 1;
                    }
                    if function == 0
                        && pci.header_type(bus, device, 0) & PCI_HEADER_MULTIFUNCTION == 0
                    {
                        break;
                    }
                }
            }
        }

        for known in self.tracker.known_on(BusKind::Pcie) {
            if !present.contains(&known.location()) && self.depart(&known) {
                report.removals += 1;
            }
        }
        report
    }

    /// PCI hot-plug interrupt entry point for one function.
    pub fn on_pci_hotplug(&self, bus: u8, device: u8, function: u8) {
        let Some(pci) = &self.pci else {
            return;
        };
        let location = BusLocation::pci(bus, device, function);
        if pci.vendor_id(bus, device, function) == PCI_VENDOR_NONE {
            if let Some(known) = self.tracker.find(location) {
                self.depart(&known);
            }
        } else {
            self.pcie_arrival(pci.as_ref(), location, self.hal.now_us());
        }
    }

    fn pcie_arrival(&self, pci: &dyn PciBus, location: BusLocation, scan_started_us: u64) -> bool {
        let BusLocation::Pci {
            bus,
            device,
            function,
        } = location
        else {
            return false;
        };
        self.arrive(location, scan_started_us, |id, now| {
            let identity = DeviceIdentity::new(
                u32::from(pci.vendor_id(bus, device, function)),
                u32::from(pci.device_id(bus, device, function)),
                pci.class_code(bus, device, function),
            );
            Some(HotplugDevice::pcie(id, location, identity, now))
        })
    }

    // ── USB ────────────────────────────────────────────────────────────────

    /// Check every root-hub port of every controller once.
    pub fn scan_usb(&self) -> ScanReport {
        let mut report = ScanReport::default();
        let Some(usb) = &self.usb else {
            return report;
        };
        let started = self.hal.now_us();
        for controller in 0..usb.controller_count() {
            for port in 0..usb.root_port_count(controller) {
                match self.usb_port(usb.as_ref(), controller, port, started) {
                    Some(true) => report.arrivals += 1,
                    Some(false) => report.removals += 1,
                    None => {}
                }
            }
        }
        report
    }

    /// USB port-change interrupt entry point. A disconnect posts its removal
    /// here; a connect only rings the USB poller, which does the enumeration.
    pub fn on_usb_port_change(&self, controller: u8, port: u8) {
        let Some(usb) = &self.usb else {
            return;
        };
        let location = BusLocation::usb(controller, port);
        if usb.port_connected(controller, port) {
            debug!(%location, "USB connect deferred to poller");
            self.usb_doorbell.ring();
        } else if let Some(known) = self.tracker.find(location) {
            self.depart(&known);
        }
    }

    /// `Some(true)` for a reported arrival, `Some(false)` for a removal.
    fn usb_port(&self, usb: &dyn UsbBus, controller: u8, port: u8, started: u64) -> Option<bool> {
        let location = BusLocation::usb(controller, port);
        if usb.port_connected(controller, port) {
            let arrived = self.arrive(location, started, |id, now| {
                match usb.enumerate_device(controller, port) {
                    Ok(info) => Some(HotplugDevice::usb(id, controller, port, &info, now)),
                    Err(err) => {
                        warn!(%location, error = %err, "USB enumeration failed; retrying next tick");
                        None
                    }
                }
            });
            arrived.then_some(true)
        } else {
            let known = self.tracker.find(location)?;
            self.depart(&known).then_some(false)
        }
    }

    // ── shared ─────────────────────────────────────────────────────────────

    /// Report an arrival at `location` unless a live entry already exists.
    ///
    /// `describe` may touch the bus, so it runs without the tracker lock and
    /// the location is checked again before anything is posted.
    fn arrive(
        &self,
        location: BusLocation,
        scan_started_us: u64,
        describe: impl FnOnce(u64, u64) -> Option<HotplugDevice>,
    ) -> bool {
        if DeviceTracker::live_at(&self.tracker.lock(), location).is_some() {
            return false;
        }
        let now = self.hal.now_us();
        let Some(device) = describe(self.tracker.next_id(), now) else {
            return false;
        };
        let device = Arc::new(device);

        let mut devices = self.tracker.lock();
        if DeviceTracker::live_at(&devices, location).is_some() {
            debug!(%location, "arrival already reported");
            return false;
        }
        if self
            .queue
            .post_event(HotplugEvent::arrival(Arc::clone(&device), now))
            .is_err()
        {
            return false;
        }
        devices.push(Arc::clone(&device));
        drop(devices);

        self.tracker
            .record_detection(now.saturating_sub(scan_started_us));
        info!(
            device = %device,
            name = device.name(),
            "hot-plug arrival detected"
        );
        true
    }

    /// Report a removal for an `Active` or `Failed` device.
    fn depart(&self, device: &Arc<HotplugDevice>) -> bool {
        if !device.begin_removal() {
            return false;
        }
        let event = HotplugEvent::removal(Arc::clone(device), self.hal.now_us());
        if self.queue.post_event(event).is_err() {
            device.abort_removal();
            return false;
        }
        info!(device = %device, "hot-plug removal detected");
        true
    }

    // ── drivers of the detector ───────────────────────────────────────────

    /// Route bus hot-plug interrupts into this detector. The buses only hold
    /// a weak reference, so dropping the detector disarms the hooks.
    pub fn install_irq_handlers(self: &Arc<Self>) {
        if let Some(pci) = &self.pci {
            let weak: Weak<Self> = Arc::downgrade(self);
            pci.set_hotplug_handler(Arc::new(move |bus, device, function| {
                if let Some(detector) = weak.upgrade() {
                    detector.on_pci_hotplug(bus, device, function);
                }
            }));
        }
        if let Some(usb) = &self.usb {
            let weak: Weak<Self> = Arc::downgrade(self);
            usb.set_port_change_handler(Arc::new(move |controller, port| {
                if let Some(detector) = weak.upgrade() {
                    detector.on_usb_port_change(controller, port);
                }
            }));
        }
        debug!(pci = self.has_pci(), usb = self.has_usb(), "hot-plug IRQ handlers installed");
    }

    /// Cut the USB poller's current sleep short. Call after triggering
    /// shutdown so the loop notices without waiting out its interval.
    pub fn wake_pollers(&self) {
        self.usb_doorbell.ring();
    }

    pub fn run_pcie_loop(&self, shutdown: &Shutdown) {
        self.poll_loop(BusKind::Pcie, shutdown, || self.scan_pcie(), |interval| {
            shutdown.wait_timeout(interval);
        });
    }

    /// Also wakes early when a port-change interrupt rings the doorbell.
    pub fn run_usb_loop(&self, shutdown: &Shutdown) {
        self.poll_loop(BusKind::Usb, shutdown, || self.scan_usb(), |interval| {
            self.usb_doorbell.wait_timeout(interval);
        });
    }

    fn poll_loop(
        &self,
        bus: BusKind,
        shutdown: &Shutdown,
        scan: impl Fn() -> ScanReport,
        sleep: impl Fn(Duration),
    ) {
        info!(%bus, interval_ms = self.config.poll_interval_ms, "hot-plug poller started");
        while !shutdown.is_triggered() {
            let started = Instant::now();
            let report = scan();
            let elapsed = started.elapsed();
            if elapsed > self.config.detection_timeout() {
                warn!(
                    %bus,
                    elapsed_ms = elapsed.as_millis() as u64,
                    limit_ms = self.config.detection_timeout_ms,
                    "hot-plug scan exceeded detection timeout"
                );
            }
            if report != ScanReport::default() {
                debug!(%bus, arrivals = report.arrivals, removals = report.removals, "scan complete");
            }
            sleep(self.config.poll_interval());
        }
        info!(%bus, "hot-plug poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devframe_hal::UsbDeviceInfo;
    use devframe_hal::sim::{SimHal, SimPciBus, SimPciFunction, SimUsbBus};
    use devframe_types::{DriverError, HotplugEventKind, HotplugState};

    struct Rig {
        pci: Arc<SimPciBus>,
        usb: Arc<SimUsbBus>,
        queue: Arc<EventQueue>,
        tracker: Arc<DeviceTracker>,
        detector: Arc<HotplugDetector>,
    }

    fn rig(capacity: usize) -> Rig {
        let pci = Arc::new(SimPciBus::new());
        let usb = Arc::new(SimUsbBus::new(&[4]));
        let queue = Arc::new(EventQueue::new(capacity));
        let tracker = Arc::new(DeviceTracker::new());
        let detector = Arc::new(
            HotplugDetector::new(
                Arc::new(SimHal::new()),
                Arc::clone(&queue),
                Arc::clone(&tracker),
                HotplugConfig::default(),
            )
            .with_pci(pci.clone())
            .with_usb(usb.clone()),
        );
        Rig {
            pci,
            usb,
            queue,
            tracker,
            detector,
        }
    }

    fn nic() -> SimPciFunction {
        SimPciFunction::new(0x8086, 0x100e, 0x02_00_00)
    }

    #[test]
    fn new_pcie_function_is_reported_once() {
        let r = rig(8);
        r.pci.insert(0, 1, 0, nic());

        assert_eq!(r.detector.scan_pcie().arrivals, 1);
        assert_eq!(r.detector.scan_pcie(), ScanReport::default());
        assert_eq!(r.queue.len(), 1);

        let event = r.queue.try_pop().unwrap();
        assert_eq!(event.kind, HotplugEventKind::Arrival);
        assert_eq!(event.device.location(), BusLocation::pci(0, 1, 0));
        assert_eq!(event.device.identity().class_id, 0x02_00_00);
        assert_eq!(r.tracker.stats(0).total_detected, 1);
    }

    #[test]
    fn functions_beyond_zero_need_multifunction_header() {
        let r = rig(8);
        r.pci.insert(0, 3, 0, nic());
        r.pci.insert(0, 3, 1, nic());
        assert_eq!(r.detector.scan_pcie().arrivals, 1);

        let r = rig(8);
        r.pci.insert(0, 3, 0, nic().multifunction());
        r.pci.insert(0, 3, 1, nic());
        assert_eq!(r.detector.scan_pcie().arrivals, 2);
    }

    #[test]
    fn removal_only_for_processed_devices() {
        let r = rig(8);
        r.pci.insert(0, 1, 0, nic());
        r.detector.scan_pcie();
        r.pci.remove(0, 1, 0);

        // Still `Arriving`: nothing to remove yet.
        assert_eq!(r.detector.scan_pcie().removals, 0);

        let known = r.tracker.find(BusLocation::pci(0, 1, 0)).unwrap();
        known.mark_active(None, 0);
        assert_eq!(r.detector.scan_pcie().removals, 1);
        assert_eq!(known.state(), HotplugState::Removing);
        assert_eq!(r.detector.scan_pcie().removals, 0);
    }

    #[test]
    fn dropped_arrival_is_rediscovered() {
        let r = rig(1);
        r.pci.insert(0, 1, 0, nic());
        r.pci.insert(0, 2, 0, nic());

        assert_eq!(r.detector.scan_pcie().arrivals, 1);
        assert_eq!(r.queue.dropped(), 1);
        assert_eq!(r.tracker.devices().len(), 1);

        r.queue.try_pop().unwrap();
        assert_eq!(r.detector.scan_pcie().arrivals, 1);
        assert_eq!(r.tracker.devices().len(), 2);
    }

    #[test]
    fn dropped_removal_leaves_device_active() {
        let r = rig(1);
        r.pci.insert(0, 1, 0, nic());
        r.detector.scan_pcie();
        let known = r.queue.try_pop().unwrap().device;
        known.mark_active(None, 0);

        r.pci.insert(0, 2, 0, nic());
        r.detector.scan_pcie();
        assert_eq!(r.queue.len(), 1);

        r.pci.remove(0, 1, 0);
        assert_eq!(r.detector.scan_pcie().removals, 0);
        assert_eq!(known.state(), HotplugState::Active);
        assert_eq!(
            r.queue.post_event(HotplugEvent::removal(known.clone(), 0)),
            Err(DriverError::QueueFull)
        );
    }

    #[test]
    fn usb_ports_are_scanned_per_controller() {
        let r = rig(8);
        let info = UsbDeviceInfo {
            vendor_id: 0x0781,
            product_id: 0x5581,
            class: 0x08,
            subclass: 0x06,
            protocol: 0x50,
            serial: "SD1".into(),
        };
        r.usb.attach(0, 2, info);
        assert_eq!(r.detector.scan_usb().arrivals, 1);

        let known = r.tracker.find(BusLocation::usb(0, 2)).unwrap();
        assert_eq!(known.path(), "USB\\VEN_0781&PID_5581\\SD1");
        known.mark_active(None, 0);

        r.usb.detach(0, 2);
        assert_eq!(r.detector.scan_usb().removals, 1);
    }

    #[test]
    fn failed_usb_enumeration_is_retried() {
        let r = rig(8);
        r.usb.fail_enumeration(true);
        r.usb.attach(0, 1, UsbDeviceInfo::default());
        assert_eq!(r.detector.scan_usb().arrivals, 0);

        r.usb.fail_enumeration(false);
        assert_eq!(r.detector.scan_usb().arrivals, 1);
    }

    #[test]
    fn interrupts_post_events_without_polling() {
        let r = rig(8);
        r.detector.install_irq_handlers();
        assert!(r.pci.has_handler());

        r.pci.insert(0, 4, 0, nic());
        assert_eq!(r.queue.len(), 1);
        // A poll right after sees nothing new.
        assert_eq!(r.detector.scan_pcie().arrivals, 0);

        // USB connects are enumerated by the poller, disconnects post directly.
        r.usb.attach(0, 0, UsbDeviceInfo::default());
        assert_eq!(r.queue.len(), 1);
        assert_eq!(r.detector.scan_usb().arrivals, 1);
        r.tracker
            .find(BusLocation::usb(0, 0))
            .unwrap()
            .mark_active(None, 0);
        r.usb.detach(0, 0);
        assert_eq!(r.queue.len(), 3);
        assert_eq!(r.detector.scan_usb(), ScanReport::default());
    }

    #[test]
    fn usb_interrupt_never_waits_on_enumeration() {
        let r = rig(8);
        r.detector.install_irq_handlers();
        r.usb.set_enumeration_delay(Some(Duration::from_millis(500)));

        let started = Instant::now();
        r.usb.attach(0, 2, UsbDeviceInfo::default());
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(r.queue.is_empty());

        // The tracker stays usable while a slow enumeration is in flight.
        std::thread::scope(|s| {
            let scan = s.spawn(|| r.detector.scan_usb());
            std::thread::sleep(Duration::from_millis(50));
            let started = Instant::now();
            assert!(r.tracker.find(BusLocation::usb(0, 2)).is_none());
            assert!(started.elapsed() < Duration::from_millis(250));
            assert_eq!(scan.join().unwrap().arrivals, 1);
        });
        assert_eq!(r.queue.len(), 1);
    }

    #[test]
    fn usb_interrupt_wakes_poller_early() {
        let mut r = rig(8);
        let mut config = HotplugConfig::default();
        config.poll_interval_ms = 60_000;
        r.detector = Arc::new(
            HotplugDetector::new(
                Arc::new(SimHal::new()),
                Arc::clone(&r.queue),
                Arc::clone(&r.tracker),
                config,
            )
            .with_usb(r.usb.clone()),
        );
        r.detector.install_irq_handlers();

        let shutdown = Arc::new(Shutdown::new());
        let detector = Arc::clone(&r.detector);
        let stop = Arc::clone(&shutdown);
        let poller = std::thread::spawn(move || detector.run_usb_loop(&stop));

        std::thread::sleep(Duration::from_millis(20));
        r.usb.attach(0, 1, UsbDeviceInfo::default());
        let deadline = Instant::now() + Duration::from_secs(5);
        while r.queue.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(r.queue.len(), 1);

        shutdown.trigger();
        r.detector.wake_pollers();
        poller.join().unwrap();
    }

    #[test]
    fn poll_loop_stops_on_shutdown() {
        let r = rig(8);
        let shutdown = Arc::new(Shutdown::new());
        let detector = Arc::clone(&r.detector);
        let stop = Arc::clone(&shutdown);
        let poller = std::thread::spawn(move || detector.run_usb_loop(&stop));

        r.usb.attach(0, 3, UsbDeviceInfo::default());
        let deadline = Instant::now() + Duration::from_secs(5);
        while r.queue.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        shutdown.trigger();
        r.detector.wake_pollers();
        poller.join().unwrap();
        assert_eq!(r.queue.len(), 1);
    }
}
