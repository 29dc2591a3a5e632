//! [`HotplugProcessor`] – the single consumer of the event queue.
//!
//! Arrivals become registry devices and, with `auto_driver_load`, get a
//! hot-plug capable driver bound; removals tear the registry device down.
//! Driver faults raised while binding are absorbed by crash recovery inside
//! the kernel and only surface here as a failed arrival.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use devframe_hotplug::{HotplugProcessor, Shutdown};
//! # fn demo(processor: Arc<HotplugProcessor>, shutdown: Arc<Shutdown>) {
//! let consumer = std::thread::spawn(move || processor.run(&shutdown));
//! # }
//! ```

use std::fmt::Write as _;
use std::sync::{Arc, RwLock};

use devframe_hal::Hal;
use devframe_kernel::{Device, DeviceFramework};
use devframe_types::{DriverError, HotplugEventKind, HotplugState, HotplugStats};
use tracing::{debug, info, warn};

use crate::config::HotplugConfig;
use crate::device::HotplugDevice;
use crate::event::HotplugEvent;
use crate::queue::EventQueue;
use crate::shutdown::Shutdown;
use crate::tracker::DeviceTracker;

/// Callbacks fired by the processor after an event has been handled.
///
/// Called on the consumer thread with no framework lock held.
pub trait HotplugListener: Send + Sync {
    fn on_arrival(&self, _device: &HotplugDevice) {}
    fn on_removal(&self, _device: &HotplugDevice) {}
    fn on_failure(&self, _device: &HotplugDevice, _error: DriverError) {}
}

pub struct HotplugProcessor {
    framework: Arc<DeviceFramework>,
    hal: Arc<dyn Hal>,
    queue: Arc<EventQueue>,
    tracker: Arc<DeviceTracker>,
    config: HotplugConfig,
    listeners: RwLock<Vec<Arc<dyn HotplugListener>>>,
}

impl HotplugProcessor {
    pub fn new(
        framework: Arc<DeviceFramework>,
        queue: Arc<EventQueue>,
        tracker: Arc<DeviceTracker>,
        config: HotplugConfig,
    ) -> Self {
        let hal = Arc::clone(framework.hal());
        Self {
            framework,
            hal,
            queue,
            tracker,
            config,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn HotplugListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    fn listeners(&self) -> Vec<Arc<dyn HotplugListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // ── event handling ─────────────────────────────────────────────────────

    pub fn process_event(&self, event: HotplugEvent) {
        debug!(event = %event.id, kind = ?event.kind, device = %event.device, "processing hot-plug event");
        match event.kind {
            HotplugEventKind::Arrival => self.handle_arrival(&event.device),
            HotplugEventKind::Removal => self.handle_removal(&event.device),
        }
    }

    /// Handle everything currently queued; returns the number of events.
    pub fn process_pending(&self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.queue.try_pop() {
            self.process_event(event);
            handled += 1;
        }
        handled
    }

    /// Consumer loop: dequeue in FIFO order until `shutdown` fires, idling
    /// for `idle_wait` whenever the queue is empty.
    pub fn run(&self, shutdown: &Shutdown) {
        info!("hot-plug event processor started");
        while !shutdown.is_triggered() {
            if let Some(event) = self.queue.pop_timeout(self.config.idle_wait()) {
                self.process_event(event);
            }
        }
        info!(pending = self.queue.len(), "hot-plug event processor stopped");
    }

    fn handle_arrival(&self, hp: &Arc<HotplugDevice>) {
        if hp.state() != HotplugState::Arriving {
            debug!(device = %hp, state = %hp.state(), "stale arrival ignored");
            return;
        }
        let started = self.hal.now_us();
        self.tracker.record_arrival();

        let device = Device::new(format!("hotplug{}", hp.id()), hp.identity());
        let handle = match self.framework.register_device(device) {
            Ok(handle) => handle,
            Err(err) => return self.fail(hp, err),
        };
        hp.attach_device(handle);

        if !self.config.auto_driver_load {
            hp.mark_active(None, started);
            info!(device = %hp, handle = %handle, "hot-plug device registered without driver");
            self.notify(|l| l.on_arrival(hp));
            return;
        }

        match self.framework.auto_bind(handle) {
            Ok(driver) => {
                let now = self.hal.now_us();
                hp.mark_active(Some(driver), now);
                let load_us = now.saturating_sub(started);
                self.tracker.record_driver_load(load_us);
                info!(
                    device = %hp,
                    handle = %handle,
                    driver = %driver,
                    load_us,
                    "hot-plug device initialised"
                );
                self.notify(|l| l.on_arrival(hp));
            }
            Err(err) => self.fail(hp, err),
        }
    }

    fn fail(&self, hp: &Arc<HotplugDevice>, err: DriverError) {
        hp.mark_failed();
        self.tracker.record_failure();
        warn!(device = %hp, error = %err, "failed to load driver for hot-plug device");
        self.notify(|l| l.on_failure(hp, err));
    }

    fn handle_removal(&self, hp: &Arc<HotplugDevice>) {
        if hp.state() != HotplugState::Removing {
            debug!(device = %hp, state = %hp.state(), "stale removal ignored");
            return;
        }
        if let Some(handle) = hp.device() {
            match self.framework.hot_unplug(handle) {
                Ok(()) | Err(DriverError::NoDevice) => {}
                Err(err) => {
                    // Retried on the next scan.
                    warn!(device = %hp, error = %err, "hot-unplug refused");
                    hp.abort_removal();
                    return;
                }
            }
        }
        hp.mark_removed();
        self.tracker.record_removal();
        self.tracker.prune(hp.id());
        info!(device = %hp, "hot-plug device removed");
        self.notify(|l| l.on_removal(hp));
    }

    fn notify(&self, call: impl Fn(&dyn HotplugListener)) {
        for listener in self.listeners() {
            call(listener.as_ref());
        }
    }

    // ── reporting ──────────────────────────────────────────────────────────

    pub fn stats(&self) -> HotplugStats {
        self.tracker.stats(self.queue.dropped())
    }

    /// Human-readable summary plus the table of active devices.
    pub fn status_report(&self) -> String {
        let stats = self.stats();
        let mut out = String::new();
        let _ = writeln!(out, "Hot-Plug System Status:");
        let _ = writeln!(out, "  Active devices: {}", stats.active_devices);
        let _ = writeln!(out, "  Total arrivals: {}", stats.arrivals);
        let _ = writeln!(out, "  Total removals: {}", stats.removals);
        let _ = writeln!(out, "  Failures: {}", stats.failures);
        let _ = writeln!(out, "  Dropped events: {}", stats.dropped_events);
        let _ = writeln!(
            out,
            "  Average detection time: {:.2} ms",
            stats.avg_detection_time_us as f64 / 1000.0
        );
        let _ = writeln!(
            out,
            "  Average driver load time: {:.2} ms",
            stats.avg_driver_load_time_us as f64 / 1000.0
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "Active Devices:");
        for device in self.tracker.devices() {
            if device.state != HotplugState::Active {
                continue;
            }
            let driver = device
                .driver
                .and_then(|handle| self.framework.driver_info(handle).ok())
                .map_or_else(|| "No driver".to_string(), |info| info.name);
            let _ = writeln!(
                out,
                "  {} ({:04x}:{:04x}) - {driver}",
                device.name, device.identity.vendor_id, device.identity.device_id
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use devframe_hal::UsbDeviceInfo;
    use devframe_hal::sim::{SimHal, SimPciBus, SimPciFunction, SimSecurity, SimUsbBus};
    use devframe_kernel::{Driver, DriverDescriptor, KernelConfig};
    use devframe_types::{BusLocation, DeviceState, DriverFlags, DriverType, MatchEntry};

    use crate::detector::HotplugDetector;

    #[derive(Default)]
    struct NicDriver {
        probes: AtomicUsize,
        removes: AtomicUsize,
        broken: bool,
    }

    impl Driver for NicDriver {
        fn probe(&self, _device: &Device, _matched: Option<&MatchEntry>) -> Result<(), DriverError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.broken {
                Err(DriverError::Hardware)
            } else {
                Ok(())
            }
        }

        fn remove(&self, _device: &Device) -> Result<(), DriverError> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl HotplugListener for Recorder {
        fn on_arrival(&self, device: &HotplugDevice) {
            self.push(format!("arrival {}", device.location()));
        }
        fn on_removal(&self, device: &HotplugDevice) {
            self.push(format!("removal {}", device.location()));
        }
        fn on_failure(&self, device: &HotplugDevice, error: DriverError) {
            self.push(format!("failure {} {error:?}", device.location()));
        }
    }

    impl Recorder {
        fn push(&self, line: String) {
            self.events.lock().unwrap().push(line);
        }
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    struct Rig {
        pci: Arc<SimPciBus>,
        usb: Arc<SimUsbBus>,
        framework: Arc<DeviceFramework>,
        tracker: Arc<DeviceTracker>,
        detector: Arc<HotplugDetector>,
        processor: HotplugProcessor,
    }

    fn rig(config: HotplugConfig) -> Rig {
        let hal = Arc::new(SimHal::new());
        let kernel = KernelConfig {
            sandbox_pool_bytes: 4096,
            ..KernelConfig::default()
        };
        let framework = Arc::new(DeviceFramework::new(
            hal.clone(),
            Arc::new(SimSecurity::new()),
            kernel,
        ));
        let pci = Arc::new(SimPciBus::new());
        let usb = Arc::new(SimUsbBus::new(&[2]));
        let queue = Arc::new(EventQueue::new(config.queue_capacity));
        let tracker = Arc::new(DeviceTracker::new());
        let detector = Arc::new(
            HotplugDetector::new(hal, Arc::clone(&queue), Arc::clone(&tracker), config.clone())
                .with_pci(pci.clone())
                .with_usb(usb.clone()),
        );
        let processor =
            HotplugProcessor::new(Arc::clone(&framework), queue, Arc::clone(&tracker), config);
        Rig {
            pci,
            usb,
            framework,
            tracker,
            detector,
            processor,
        }
    }

    fn register_nic(framework: &DeviceFramework, ops: Arc<NicDriver>) {
        let descriptor = DriverDescriptor::new("e1000", DriverType::Network, ops)
            .with_flags(DriverFlags::HOTPLUG)
            .with_match(MatchEntry::pci(0x8086, 0x100e));
        framework.register_driver(descriptor).unwrap();
    }

    fn nic() -> SimPciFunction {
        SimPciFunction::new(0x8086, 0x100e, 0x02_00_00)
    }

    #[test]
    fn pcie_round_trip_binds_then_removes_once() {
        let r = rig(HotplugConfig::default());
        let ops = Arc::new(NicDriver::default());
        register_nic(&r.framework, ops.clone());
        let location = BusLocation::pci(0, 1, 0);

        r.pci.insert(0, 1, 0, nic());
        r.detector.scan_pcie();
        assert_eq!(r.processor.process_pending(), 1);

        let hp = r.tracker.find(location).unwrap();
        assert_eq!(hp.state(), HotplugState::Active);
        let handle = hp.device().unwrap();
        let device = r.framework.device(handle).unwrap();
        assert_eq!(device.state(), DeviceState::Active);
        assert_eq!(device.driver(), hp.driver());
        assert_eq!(device.driver(), r.framework.find_driver("e1000"));
        assert_eq!(device.name(), format!("hotplug{}", hp.id()));

        r.pci.remove(0, 1, 0);
        assert_eq!(r.detector.scan_pcie().removals, 1);
        assert_eq!(r.processor.process_pending(), 1);

        assert_eq!(hp.state(), HotplugState::Removed);
        assert_eq!(ops.removes.load(Ordering::SeqCst), 1);
        assert_eq!(r.framework.device_count(), 0);
        assert!(r.tracker.find(location).is_none());

        // Nothing left to do on later ticks.
        assert_eq!(r.detector.scan_pcie(), Default::default());
        assert_eq!(r.processor.process_pending(), 0);
        assert_eq!(ops.removes.load(Ordering::SeqCst), 1);

        let stats = r.processor.stats();
        assert_eq!(stats.arrivals, 1);
        assert_eq!(stats.removals, 1);
        assert_eq!(stats.active_devices, 0);
    }

    #[test]
    fn interrupt_driven_arrival_needs_no_poll() {
        let r = rig(HotplugConfig::default());
        let ops = Arc::new(NicDriver::default());
        register_nic(&r.framework, ops.clone());
        r.detector.install_irq_handlers();

        r.pci.insert(0, 5, 0, nic());
        r.processor.process_pending();
        assert_eq!(ops.probes.load(Ordering::SeqCst), 1);

        r.pci.remove(0, 5, 0);
        r.processor.process_pending();
        assert_eq!(ops.removes.load(Ordering::SeqCst), 1);
        assert!(r.tracker.devices().is_empty());
    }

    #[test]
    fn failing_driver_marks_device_failed_and_notifies() {
        let r = rig(HotplugConfig::default());
        let ops = Arc::new(NicDriver {
            broken: true,
            ..NicDriver::default()
        });
        register_nic(&r.framework, ops.clone());
        let recorder = Arc::new(Recorder::default());
        r.processor.add_listener(recorder.clone());

        r.pci.insert(0, 1, 0, nic());
        r.detector.scan_pcie();
        r.processor.process_pending();

        let hp = r.tracker.find(BusLocation::pci(0, 1, 0)).unwrap();
        assert_eq!(hp.state(), HotplugState::Failed);
        assert_eq!(hp.snapshot().failures, 1);
        // Initial probe plus three recoveries.
        assert_eq!(ops.probes.load(Ordering::SeqCst), 4);
        let device = r.framework.device(hp.device().unwrap()).unwrap();
        assert_eq!(device.state(), DeviceState::Error);
        assert_eq!(recorder.events(), vec!["failure 00:01.0 Hardware".to_string()]);

        // A failed device can still be pulled.
        r.pci.remove(0, 1, 0);
        assert_eq!(r.detector.scan_pcie().removals, 1);
        r.processor.process_pending();
        assert_eq!(hp.state(), HotplugState::Removed);
        assert_eq!(r.framework.device_count(), 0);
        assert_eq!(recorder.events().len(), 2);
        assert_eq!(r.processor.stats().failures, 1);
    }

    #[test]
    fn no_matching_driver_is_a_failure() {
        let r = rig(HotplugConfig::default());
        r.pci.insert(0, 1, 0, nic());
        r.detector.scan_pcie();
        r.processor.process_pending();

        let hp = r.tracker.find(BusLocation::pci(0, 1, 0)).unwrap();
        assert_eq!(hp.state(), HotplugState::Failed);
        assert_eq!(r.framework.device_count(), 1);
    }

    #[test]
    fn auto_load_off_registers_without_binding() {
        let r = rig(HotplugConfig {
            auto_driver_load: false,
            ..HotplugConfig::default()
        });
        let ops = Arc::new(NicDriver::default());
        register_nic(&r.framework, ops.clone());

        r.pci.insert(0, 1, 0, nic());
        r.detector.scan_pcie();
        r.processor.process_pending();

        let hp = r.tracker.find(BusLocation::pci(0, 1, 0)).unwrap();
        assert_eq!(hp.state(), HotplugState::Active);
        assert_eq!(hp.driver(), None);
        // Registration alone never probes.
        assert_eq!(ops.probes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn usb_arrival_and_listener_order() {
        let r = rig(HotplugConfig::default());
        let recorder = Arc::new(Recorder::default());
        r.processor.add_listener(recorder.clone());
        let ops = Arc::new(NicDriver::default());
        let descriptor = DriverDescriptor::new("usb-storage", DriverType::Storage, ops.clone())
            .with_flags(DriverFlags::HOTPLUG)
            .with_match(MatchEntry::usb(0x0781, 0x5581));
        r.framework.register_driver(descriptor).unwrap();

        let info = UsbDeviceInfo {
            vendor_id: 0x0781,
            product_id: 0x5581,
            class: 0x08,
            ..UsbDeviceInfo::default()
        };
        r.usb.attach(0, 1, info);
        r.detector.scan_usb();
        r.processor.process_pending();
        r.usb.detach(0, 1);
        r.detector.scan_usb();
        r.processor.process_pending();

        assert_eq!(
            recorder.events(),
            vec!["arrival usb0-1".to_string(), "removal usb0-1".to_string()]
        );
        assert_eq!(ops.removes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_report_lists_active_devices() {
        let r = rig(HotplugConfig::default());
        register_nic(&r.framework, Arc::new(NicDriver::default()));
        r.pci.insert(0, 1, 0, nic());
        r.detector.scan_pcie();
        r.processor.process_pending();

        let report = r.processor.status_report();
        assert!(report.contains("Active devices: 1"));
        assert!(report.contains("PCIe Device 8086:100e (8086:100e) - e1000"));
    }

    #[test]
    fn consumer_loop_drains_until_shutdown() {
        let r = rig(HotplugConfig::default());
        let ops = Arc::new(NicDriver::default());
        register_nic(&r.framework, ops.clone());
        r.pci.insert(0, 1, 0, nic());
        r.detector.scan_pcie();

        let processor = Arc::new(r.processor);
        let shutdown = Arc::new(Shutdown::new());
        let consumer = {
            let processor = Arc::clone(&processor);
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || processor.run(&shutdown))
        };

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while ops.probes.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        shutdown.trigger();
        consumer.join().unwrap();
        assert_eq!(ops.probes.load(Ordering::SeqCst), 1);
    }
}
