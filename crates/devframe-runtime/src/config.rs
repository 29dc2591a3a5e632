//! Framework configuration file – `devframe.toml`.
//!
//! ```toml
//! [kernel]
//! crash_threshold = 3
//! recovery_delay_ms = 1000
//!
//! [hotplug]
//! poll_interval_ms = 50
//! auto_driver_load = true
//! ```
//!
//! Every key is optional; missing keys and tables take their defaults.

use std::fs;
use std::path::{Path, PathBuf};

use devframe_hotplug::HotplugConfig;
use devframe_kernel::KernelConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything the runtime needs to start a framework and its hot-plug
/// service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkConfig {
    #[serde(default)]
    pub kernel: KernelConfig,
    #[serde(default)]
    pub hotplug: HotplugConfig,
}

impl FrameworkConfig {
    /// Reject values the framework cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.kernel.max_drivers == 0, "kernel.max_drivers must be non-zero"),
            (self.kernel.max_devices == 0, "kernel.max_devices must be non-zero"),
            (self.hotplug.queue_capacity == 0, "hotplug.queue_capacity must be non-zero"),
            (self.hotplug.poll_interval_ms == 0, "hotplug.poll_interval_ms must be non-zero"),
            (self.hotplug.idle_wait_ms == 0, "hotplug.idle_wait_ms must be non-zero"),
        ];
        match checks.iter().find(|(bad, _)| *bad) {
            Some((_, reason)) => Err(ConfigError::Invalid((*reason).to_string())),
            None => Ok(()),
        }
    }
}

/// Load the config from `path`. Returns `None` if the file does not exist.
///
/// Environment overrides are applied on top of the file and the result is
/// validated.
pub fn load_from(path: &Path) -> Result<Option<FrameworkConfig>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg: FrameworkConfig = toml::from_str(&raw)?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Like [`load_from`], falling back to defaults (plus environment
/// overrides) when the file is missing.
pub fn load_or_default(path: &Path) -> Result<FrameworkConfig, ConfigError> {
    if let Some(cfg) = load_from(path)? {
        return Ok(cfg);
    }
    let mut cfg = FrameworkConfig::default();
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Write `cfg` to `path`, creating parent directories as needed.
pub fn save_to(cfg: &FrameworkConfig, path: &Path) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let raw = toml::to_string_pretty(cfg)?;
    fs::write(path, raw).map_err(io_err)
}

/// Apply `DEVFRAME_*` environment variable overrides to `cfg`. Values that
/// do not parse are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `DEVFRAME_POLL_INTERVAL_MS` | `hotplug.poll_interval_ms` |
/// | `DEVFRAME_QUEUE_CAPACITY` | `hotplug.queue_capacity` |
/// | `DEVFRAME_AUTO_DRIVER_LOAD` | `hotplug.auto_driver_load` |
/// | `DEVFRAME_PROBE_TIMEOUT_MS` | `kernel.probe_timeout_ms` |
/// | `DEVFRAME_RECOVERY_DELAY_MS` | `kernel.recovery_delay_ms` |
pub fn apply_env_overrides(cfg: &mut FrameworkConfig) {
    if let Ok(v) = std::env::var("DEVFRAME_POLL_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.hotplug.poll_interval_ms = ms;
    }
    if let Ok(v) = std::env::var("DEVFRAME_QUEUE_CAPACITY")
        && let Ok(capacity) = v.parse::<usize>()
    {
        cfg.hotplug.queue_capacity = capacity;
    }
    if let Ok(v) = std::env::var("DEVFRAME_AUTO_DRIVER_LOAD")
        && let Ok(enabled) = v.parse::<bool>()
    {
        cfg.hotplug.auto_driver_load = enabled;
    }
    if let Ok(v) = std::env::var("DEVFRAME_PROBE_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.kernel.probe_timeout_ms = ms;
    }
    if let Ok(v) = std::env::var("DEVFRAME_RECOVERY_DELAY_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.kernel.recovery_delay_ms = ms;
    }
}
