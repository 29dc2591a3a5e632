//! [`SandboxEnvelope`] – the isolated memory pool and security context
//! granted to each registered driver, plus its per-device fault counters.
//!
//! Creation is all-or-nothing: if any step after the pool allocation fails,
//! everything acquired so far is released before the error is returned.
//! After [`SandboxEnvelope::destroy`] the pool is gone and every access
//! through [`SandboxEnvelope::with_pool`] fails with `NoDevice`.

use std::collections::HashMap;
use std::sync::Mutex;

use devframe_hal::{DmaRegion, Hal, SecurityContextId, SecurityProvider};
use devframe_types::{DeviceHandle, DriverError, DriverType, Permissions};
use serde::Serialize;
use tracing::{debug, warn};

/// Fault history of one (driver, device) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CrashRecord {
    pub crash_count: u32,
    pub last_crash_time_us: u64,
}

#[derive(Debug)]
pub struct SandboxEnvelope {
    driver: String,
    permissions: Permissions,
    pool_bytes: usize,
    pool: Mutex<Option<DmaRegion>>,
    context: Mutex<Option<SecurityContextId>>,
    crashes: Mutex<HashMap<DeviceHandle, CrashRecord>>,
}

impl SandboxEnvelope {
    /// Allocate the pool, create a security context and apply the
    /// permission set derived from `driver_type`.
    ///
    /// # Errors
    ///
    /// [`DriverError::NoMemory`] if the pool cannot be allocated, otherwise
    /// whatever the security provider reports. Nothing is leaked on error.
    pub fn create(
        driver: &str,
        driver_type: DriverType,
        pool_bytes: usize,
        hal: &dyn Hal,
        security: &dyn SecurityProvider,
    ) -> Result<Self, DriverError> {
        let pool = hal
            .alloc_dma_coherent(pool_bytes)
            .map_err(|_| DriverError::NoMemory)?;

        let context = match security.create_context(driver) {
            Ok(context) => context,
            Err(err) => {
                warn!(driver, error = %err, "security context creation failed; releasing pool");
                hal.free_dma_coherent(pool);
                return Err(err);
            }
        };

        let permissions = Permissions::for_driver_type(driver_type);
        if let Err(err) = security.apply_permissions(context, permissions) {
            warn!(driver, error = %err, "permission policy rejected; releasing sandbox");
            security.destroy_context(context);
            hal.free_dma_coherent(pool);
            return Err(err);
        }

        debug!(driver, %context, pool_bytes, ?permissions, "sandbox created");
        Ok(Self {
            driver: driver.to_string(),
            permissions,
            pool_bytes,
            pool: Mutex::new(Some(pool)),
            context: Mutex::new(Some(context)),
            crashes: Mutex::new(HashMap::new()),
        })
    }

    /// Release the pool and the security context. Each half is released if
    /// present, so calling this twice is harmless.
    pub fn destroy(&self, hal: &dyn Hal, security: &dyn SecurityProvider) {
        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner()).take();
        let context = self.context.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pool) = pool {
            hal.free_dma_coherent(pool);
        }
        if let Some(context) = context {
            security.destroy_context(context);
        }
        self.crashes.lock().unwrap_or_else(|e| e.into_inner()).clear();
        debug!(driver = %self.driver, "sandbox destroyed");
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn pool_bytes(&self) -> usize {
        self.pool_bytes
    }

    pub fn context(&self) -> Option<SecurityContextId> {
        *self.context.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_live(&self) -> bool {
        self.pool.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Run `f` against the driver's memory pool.
    ///
    /// # Errors
    ///
    /// [`DriverError::NoDevice`] once the sandbox has been destroyed.
    pub fn with_pool<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, DriverError> {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        let region = pool.as_mut().ok_or(DriverError::NoDevice)?;
        Ok(f(region.as_mut_slice()))
    }

    /// Count one more fault for `device` and return the new total.
    pub(crate) fn record_crash(&self, device: DeviceHandle, now_us: u64) -> u32 {
        let mut crashes = self.crashes.lock().unwrap_or_else(|e| e.into_inner());
        let record = crashes.entry(device).or_default();
        record.crash_count = record.crash_count.saturating_add(1);
        record.last_crash_time_us = now_us;
        record.crash_count
    }

    pub fn crash_record(&self, device: DeviceHandle) -> Option<CrashRecord> {
        self.crashes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&device)
            .copied()
    }
}
