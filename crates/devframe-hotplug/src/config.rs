//! [`HotplugConfig`] – polling cadence, queue size and timeouts of the
//! hot-plug pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotplugConfig {
    /// Pause between two scans of the same bus.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Capacity of the event queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Bind hot-plug capable drivers to arriving devices.
    #[serde(default = "default_true")]
    pub auto_driver_load: bool,

    /// A scan slower than this is reported.
    #[serde(default = "default_detection_timeout_ms")]
    pub detection_timeout_ms: u64,

    /// How long the consumer waits on an empty queue before re-checking
    /// for shutdown.
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,

    #[serde(default = "default_true")]
    pub pcie_enabled: bool,

    #[serde(default = "default_true")]
    pub usb_enabled: bool,
}

fn default_poll_interval_ms() -> u64 {
    50
}
fn default_queue_capacity() -> usize {
    256
}
fn default_detection_timeout_ms() -> u64 {
    100
}
fn default_idle_wait_ms() -> u64 {
    10
}
fn default_true() -> bool {
    true
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            queue_capacity: default_queue_capacity(),
            auto_driver_load: true,
            detection_timeout_ms: default_detection_timeout_ms(),
            idle_wait_ms: default_idle_wait_ms(),
            pcie_enabled: true,
            usb_enabled: true,
        }
    }
}

impl HotplugConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}
