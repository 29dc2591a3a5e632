//! [`Hal`] – clock, sleep and DMA-coherent memory.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use devframe_types::DriverError;
use tracing::debug;

/// Zeroed, physically contiguous buffer handed out by [`Hal::alloc_dma_coherent`].
///
/// Ownership of the region is the only way to reach its memory, so once it
/// has been passed back to [`Hal::free_dma_coherent`] nothing can touch it.
#[derive(Debug)]
pub struct DmaRegion {
    id: u64,
    bus_address: u64,
    buffer: Box<[u8]>,
}

impl DmaRegion {
    /// Allocate a zeroed buffer of `size` bytes tagged with `id`.
    ///
    /// # Errors
    ///
    /// [`DriverError::NoMemory`] if the allocator cannot satisfy the request.
    pub fn zeroed(id: u64, size: usize) -> Result<Self, DriverError> {
        let mut memory = Vec::new();
        memory
            .try_reserve_exact(size)
            .map_err(|_| DriverError::NoMemory)?;
        memory.resize(size, 0u8);
        let buffer = memory.into_boxed_slice();
        let bus_address = buffer.as_ptr() as u64;
        Ok(Self {
            id,
            bus_address,
            buffer,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address the device would use to reach the buffer.
    pub fn bus_address(&self) -> u64 {
        self.bus_address
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

/// Platform services consumed by the framework.
///
/// Locks and threads come from `std::sync` / `std::thread`; the trait only
/// covers what has to be substitutable in tests.
pub trait Hal: Send + Sync {
    /// Monotonic timestamp in microseconds.
    fn now_us(&self) -> u64;

    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);

    /// Allocate a zeroed DMA-coherent region.
    ///
    /// # Errors
    ///
    /// [`DriverError::NoMemory`] when the allocation cannot be satisfied.
    fn alloc_dma_coherent(&self, size: usize) -> Result<DmaRegion, DriverError>;

    /// Return a region to the allocator.
    fn free_dma_coherent(&self, region: DmaRegion);
}

/// [`Hal`] backed by the standard library.
#[derive(Debug)]
pub struct SystemHal {
    epoch: Instant,
    next_region: AtomicU64,
    outstanding: AtomicUsize,
}

impl Default for SystemHal {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
            next_region: AtomicU64::new(1),
            outstanding: AtomicUsize::new(0),
        }
    }
}

impl SystemHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of DMA regions allocated and not yet freed.
    pub fn outstanding_dma(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl Hal for SystemHal {
    fn now_us(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn alloc_dma_coherent(&self, size: usize) -> Result<DmaRegion, DriverError> {
        let id = self.next_region.fetch_add(1, Ordering::Relaxed);
        let region = DmaRegion::zeroed(id, size)?;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        debug!(region = id, size, "dma region allocated");
        Ok(region)
    }

    fn free_dma_coherent(&self, region: DmaRegion) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug!(region = region.id(), size = region.len(), "dma region freed");
    }
}
