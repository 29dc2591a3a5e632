//! [`HotplugEvent`] – one arrival or removal travelling through the queue.

use std::sync::Arc;

use devframe_types::{BusKind, HotplugEventKind};
use uuid::Uuid;

use crate::device::HotplugDevice;

/// Immutable once posted. Consumed (and dropped) by the processor.
#[derive(Debug, Clone)]
pub struct HotplugEvent {
    pub id: Uuid,
    pub kind: HotplugEventKind,
    pub bus: BusKind,
    pub device: Arc<HotplugDevice>,
    pub timestamp_us: u64,
}

impl HotplugEvent {
    pub fn new(kind: HotplugEventKind, device: Arc<HotplugDevice>, timestamp_us: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            bus: device.bus(),
            device,
            timestamp_us,
        }
    }

    pub fn arrival(device: Arc<HotplugDevice>, timestamp_us: u64) -> Self {
        Self::new(HotplugEventKind::Arrival, device, timestamp_us)
    }

    pub fn removal(device: Arc<HotplugDevice>, timestamp_us: u64) -> Self {
        Self::new(HotplugEventKind::Removal, device, timestamp_us)
    }
}
