//! [`HotplugService`] – owns the hot-plug threads.
//!
//! | Thread | Work |
//! |---|---|
//! | `hotplug-pcie` | [`HotplugDetector::run_pcie_loop`] |
//! | `hotplug-usb` | [`HotplugDetector::run_usb_loop`] |
//! | `hotplug-events` | [`HotplugProcessor::run`] |
//!
//! A poll thread is only started for a bus that is both present and enabled
//! in [`HotplugConfig`]. Bus IRQ hooks are installed for every present bus.

use std::sync::Arc;
use std::thread::JoinHandle;

use devframe_hal::{PciBus, UsbBus};
use devframe_hotplug::{
    DeviceTracker, EventQueue, HotplugConfig, HotplugDetector, HotplugListener,
    HotplugProcessor, Shutdown,
};
use devframe_kernel::DeviceFramework;
use devframe_types::{DriverError, HotplugStats};
use tracing::{error, info};

/// Bus collaborators handed to the service. Absent buses are not scanned.
#[derive(Clone, Default)]
pub struct Buses {
    pub pci: Option<Arc<dyn PciBus>>,
    pub usb: Option<Arc<dyn UsbBus>>,
}

pub struct HotplugService {
    framework: Arc<DeviceFramework>,
    detector: Arc<HotplugDetector>,
    processor: Arc<HotplugProcessor>,
    tracker: Arc<DeviceTracker>,
    shutdown: Arc<Shutdown>,
    workers: Vec<JoinHandle<()>>,
}

impl HotplugService {
    /// Wire the detector and processor to `framework` and start the threads.
    ///
    /// # Errors
    ///
    /// [`DriverError::NoMemory`] if a thread cannot be spawned; threads that
    /// were already started are stopped again.
    pub fn start(
        framework: Arc<DeviceFramework>,
        buses: Buses,
        config: HotplugConfig,
    ) -> Result<Self, DriverError> {
        let queue = Arc::new(EventQueue::new(config.queue_capacity));
        let tracker = Arc::new(DeviceTracker::new());

        let mut detector = HotplugDetector::new(
            Arc::clone(framework.hal()),
            Arc::clone(&queue),
            Arc::clone(&tracker),
            config.clone(),
        );
        if let Some(pci) = buses.pci {
            detector = detector.with_pci(pci);
        }
        if let Some(usb) = buses.usb {
            detector = detector.with_usb(usb);
        }
        let detector = Arc::new(detector);
        let processor = Arc::new(HotplugProcessor::new(
            Arc::clone(&framework),
            queue,
            Arc::clone(&tracker),
            config.clone(),
        ));

        let mut service = Self {
            framework,
            detector,
            processor,
            tracker,
            shutdown: Arc::new(Shutdown::new()),
            workers: Vec::new(),
        };

        service.spawn("hotplug-events", |svc| {
            let processor = Arc::clone(&svc.processor);
            let shutdown = Arc::clone(&svc.shutdown);
            move || processor.run(&shutdown)
        })?;
        if config.pcie_enabled && service.detector.has_pci() {
            service.spawn("hotplug-pcie", |svc| {
                let detector = Arc::clone(&svc.detector);
                let shutdown = Arc::clone(&svc.shutdown);
                move || detector.run_pcie_loop(&shutdown)
            })?;
        }
        if config.usb_enabled && service.detector.has_usb() {
            service.spawn("hotplug-usb", |svc| {
                let detector = Arc::clone(&svc.detector);
                let shutdown = Arc::clone(&svc.shutdown);
                move || detector.run_usb_loop(&shutdown)
            })?;
        }
        service.detector.install_irq_handlers();

        info!(
            threads = service.workers.len(),
            poll_interval_ms = config.poll_interval_ms,
            auto_driver_load = config.auto_driver_load,
            "hot-plug service started"
        );
        Ok(service)
    }

    fn spawn<F, W>(&mut self, name: &str, make: F) -> Result<(), DriverError>
    where
        F: FnOnce(&Self) -> W,
        W: FnOnce() + Send + 'static,
    {
        let work = make(self);
        match std::thread::Builder::new().name(name.to_string()).spawn(work) {
            Ok(handle) => {
                self.workers.push(handle);
                Ok(())
            }
            Err(err) => {
                error!(thread = name, error = %err, "failed to spawn hot-plug thread");
                self.stop();
                Err(DriverError::NoMemory)
            }
        }
    }

    pub fn framework(&self) -> &Arc<DeviceFramework> {
        &self.framework
    }

    pub fn detector(&self) -> &Arc<HotplugDetector> {
        &self.detector
    }

    pub fn tracker(&self) -> &Arc<DeviceTracker> {
        &self.tracker
    }

    pub fn add_listener(&self, listener: Arc<dyn HotplugListener>) {
        self.processor.add_listener(listener);
    }

    pub fn stats(&self) -> HotplugStats {
        self.processor.stats()
    }

    pub fn status_report(&self) -> String {
        self.processor.status_report()
    }

    /// Names of the running worker threads.
    pub fn threads(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter_map(|handle| handle.thread().name().map(str::to_string))
            .collect()
    }

    /// Signal every thread and wait for them to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.trigger();
        self.detector.wake_pollers();
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("hotplug").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "hot-plug thread panicked");
            }
        }
        info!("hot-plug service stopped");
    }
}

impl Drop for HotplugService {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop();
        }
    }
}
