//! [`EventQueue`] – bounded FIFO between the detectors and the consumer.
//!
//! The queue has its own lock, distinct from the registry lock, and posting
//! never waits for space: a full queue rejects the newest event with
//! [`DriverError::QueueFull`] and counts the drop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use devframe_types::DriverError;
use tracing::warn;

use crate::event::HotplugEvent;

#[derive(Debug)]
pub struct EventQueue {
    ring: Mutex<VecDeque<HotplugEvent>>,
    ready: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue `event` without waiting for space.
    ///
    /// # Errors
    ///
    /// [`DriverError::QueueFull`] when the queue is at capacity. The event
    /// is dropped.
    pub fn post_event(&self, event: HotplugEvent) -> Result<(), DriverError> {
        let mut ring = self.lock();
        if ring.len() >= self.capacity {
            drop(ring);
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                event = %event.id,
                kind = ?event.kind,
                device = %event.device,
                dropped,
                "event queue full; dropping event"
            );
            return Err(DriverError::QueueFull);
        }
        ring.push_back(event);
        drop(ring);
        self.ready.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<HotplugEvent> {
        self.lock().pop_front()
    }

    /// Oldest event, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<HotplugEvent> {
        let ring = self.lock();
        let (mut ring, _) = self
            .ready
            .wait_timeout_while(ring, timeout, |ring| ring.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        ring.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<HotplugEvent>> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }
}
