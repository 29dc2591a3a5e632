//! [`KernelConfig`] – tunables of the registry, sandbox and recovery policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Framework-wide limits and timeouts. Every field has a default, so an
/// empty `[kernel]` table is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Capacity of the driver table.
    #[serde(default = "default_max_drivers")]
    pub max_drivers: usize,

    /// Capacity of the device table.
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,

    /// Size of the memory pool reserved for each driver sandbox.
    #[serde(default = "default_sandbox_pool_bytes")]
    pub sandbox_pool_bytes: usize,

    /// Faults absorbed per (driver, device) pair before the device is
    /// marked `Error`.
    #[serde(default = "default_crash_threshold")]
    pub crash_threshold: u32,

    /// Fixed pause between a fault and the next probe attempt.
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,

    /// Deadline for one probe call. `0` runs probe inline on the calling
    /// thread with no deadline.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_max_drivers() -> usize {
    256
}
fn default_max_devices() -> usize {
    1024
}
fn default_sandbox_pool_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_crash_threshold() -> u32 {
    3
}
fn default_recovery_delay_ms() -> u64 {
    1000
}
fn default_probe_timeout_ms() -> u64 {
    2000
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_drivers: default_max_drivers(),
            max_devices: default_max_devices(),
            sandbox_pool_bytes: default_sandbox_pool_bytes(),
            crash_threshold: default_crash_threshold(),
            recovery_delay_ms: default_recovery_delay_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl KernelConfig {
    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    /// `None` when probes run inline.
    pub fn probe_timeout(&self) -> Option<Duration> {
        (self.probe_timeout_ms > 0).then(|| Duration::from_millis(self.probe_timeout_ms))
    }

    /// Longest time one bind can stall its caller inside crash recovery.
    pub fn worst_case_recovery_stall(&self) -> Duration {
        let per_attempt = self.recovery_delay() + self.probe_timeout().unwrap_or_default();
        per_attempt * self.crash_threshold
    }
}
