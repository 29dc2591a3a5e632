//! [`DeviceTracker`] – the list of known hot-plug devices and the pipeline
//! counters, shared by the detector and the processor.
//!
//! At most one live entry exists per bus location. The detector holds the
//! list lock across "look up, post, insert" so a poll tick and an interrupt
//! can never both report the same arrival.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use devframe_types::{BusKind, BusLocation, HotplugState, HotplugStats};

use crate::device::{HotplugDevice, HotplugDeviceInfo};

#[derive(Debug, Default)]
struct Totals {
    detected: u64,
    detection_time_us: u64,
    arrivals: u64,
    removals: u64,
    failures: u64,
    loads: u64,
    load_time_us: u64,
}

#[derive(Debug, Default)]
pub struct DeviceTracker {
    devices: Mutex<Vec<Arc<HotplugDevice>>>,
    next_id: AtomicU64,
    totals: Mutex<Totals>,
}

impl DeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<Arc<HotplugDevice>>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live entry at `location` in an already locked list.
    pub(crate) fn live_at(
        devices: &[Arc<HotplugDevice>],
        location: BusLocation,
    ) -> Option<&Arc<HotplugDevice>> {
        devices
            .iter()
            .find(|dev| dev.location() == location && dev.is_live())
    }

    /// Forget a fully removed device.
    pub(crate) fn prune(&self, id: u64) {
        self.lock().retain(|dev| dev.id() != id);
    }

    pub fn find(&self, location: BusLocation) -> Option<Arc<HotplugDevice>> {
        Self::live_at(&self.lock(), location).cloned()
    }

    pub fn devices(&self) -> Vec<HotplugDeviceInfo> {
        self.lock().iter().map(|dev| dev.snapshot()).collect()
    }

    pub fn known_on(&self, bus: BusKind) -> Vec<Arc<HotplugDevice>> {
        self.lock()
            .iter()
            .filter(|dev| dev.bus() == bus)
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> u32 {
        let active = self
            .lock()
            .iter()
            .filter(|dev| dev.state() == HotplugState::Active)
            .count();
        u32::try_from(active).unwrap_or(u32::MAX)
    }

    // ── counters ───────────────────────────────────────────────────────────

    fn totals(&self) -> MutexGuard<'_, Totals> {
        self.totals.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn record_detection(&self, elapsed_us: u64) {
        let mut totals = self.totals();
        totals.detected += 1;
        totals.detection_time_us += elapsed_us;
    }

    pub(crate) fn record_arrival(&self) {
        self.totals().arrivals += 1;
    }

    pub(crate) fn record_driver_load(&self, elapsed_us: u64) {
        let mut totals = self.totals();
        totals.loads += 1;
        totals.load_time_us += elapsed_us;
    }

    pub(crate) fn record_failure(&self) {
        self.totals().failures += 1;
    }

    pub(crate) fn record_removal(&self) {
        self.totals().removals += 1;
    }

    /// Counters snapshot. `dropped_events` is supplied by the caller, which
    /// owns the queue.
    pub fn stats(&self, dropped_events: u64) -> HotplugStats {
        let active_devices = self.active_count();
        let totals = self.totals();
        HotplugStats {
            total_detected: totals.detected,
            arrivals: totals.arrivals,
            removals: totals.removals,
            failures: totals.failures,
            active_devices,
            avg_detection_time_us: totals
                .detection_time_us
                .checked_div(totals.detected)
                .unwrap_or(0),
            avg_driver_load_time_us: totals.load_time_us.checked_div(totals.loads).unwrap_or(0),
            dropped_events,
        }
    }
}
