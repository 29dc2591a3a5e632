//! Process-level glue for the devframe driver framework.
//!
//! * [`config`] – `devframe.toml` loading with `DEVFRAME_*` overrides.
//! * [`telemetry`] – `tracing` subscriber setup.
//! * [`service`] – the hot-plug poll and event-consumer threads.
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use devframe_hal::{PermissiveSecurity, SystemHal};
//! use devframe_kernel::DeviceFramework;
//! use devframe_runtime::{Buses, HotplugService, config, telemetry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! telemetry::init_tracing()?;
//! let cfg = config::load_or_default(Path::new("/etc/devframe.toml"))?;
//! let framework = Arc::new(DeviceFramework::new(
//!     Arc::new(SystemHal::new()),
//!     Arc::new(PermissiveSecurity::new()),
//!     cfg.kernel.clone(),
//! ));
//! let service = HotplugService::start(framework, Buses::default(), cfg.hotplug)?;
//! // ...
//! service.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod service;
pub mod telemetry;

pub use config::{ConfigError, FrameworkConfig};
pub use service::{Buses, HotplugService};
pub use telemetry::{LogFormat, TelemetryError, init_tracing};
