//! [`Shutdown`] – stop signal shared by the poll loops and the consumer.
//! [`Doorbell`] – early wake-up for a single poll loop.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// One-shot stop flag that sleeping loops can wait on.
#[derive(Debug, Default)]
pub struct Shutdown {
    triggered: Mutex<bool>,
    wake: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every waiter.
    pub fn trigger(&self) {
        *self.triggered.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.wake.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep up to `timeout`, returning early (with `true`) on shutdown.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.triggered.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |triggered| !*triggered)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// Wakes one sleeping poller ahead of its interval. A ring that lands while
/// the poller is busy is kept for its next wait.
#[derive(Debug, Default)]
pub struct Doorbell {
    rung: Mutex<bool>,
    wake: Condvar,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never blocks beyond the flag's own lock.
    pub fn ring(&self) {
        *self.rung.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.wake.notify_all();
    }

    /// Sleep up to `timeout`; `true` if a ring ended the wait. Consumes the ring.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.rung.lock().unwrap_or_else(|e| e.into_inner());
        let (mut guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |rung| !*rung)
            .unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *guard)
    }
}
