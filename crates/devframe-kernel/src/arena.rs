//! Generational slot arena backing the driver and device tables.
//!
//! Removing an entry bumps its slot's generation and pushes the slot onto a
//! free list, so an old handle can never alias a newer occupant.

use devframe_types::{DeviceHandle, DriverHandle};

/// A handle type the arena can mint.
pub(crate) trait ArenaHandle: Copy {
    fn from_raw_parts(index: u32, generation: u32) -> Self;
    fn index(self) -> u32;
    fn generation(self) -> u32;
}

impl ArenaHandle for DriverHandle {
    fn from_raw_parts(index: u32, generation: u32) -> Self {
        DriverHandle::from_raw_parts(index, generation)
    }
    fn index(self) -> u32 {
        DriverHandle::index(self)
    }
    fn generation(self) -> u32 {
        DriverHandle::generation(self)
    }
}

impl ArenaHandle for DeviceHandle {
    fn from_raw_parts(index: u32, generation: u32) -> Self {
        DeviceHandle::from_raw_parts(index, generation)
    }
    fn index(self) -> u32 {
        DeviceHandle::index(self)
    }
    fn generation(self) -> u32 {
        DeviceHandle::generation(self)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub(crate) struct Arena<H, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    limit: usize,
    _handle: std::marker::PhantomData<fn() -> H>,
}

impl<H: ArenaHandle, T> Arena<H, T> {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            limit,
            _handle: std::marker::PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.limit
    }

    /// Store `value`, handing it back if the arena is at its limit.
    pub fn insert(&mut self, value: T) -> Result<H, T> {
        if self.is_full() {
            return Err(value);
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let Ok(index) = u32::try_from(self.slots.len()) else {
                    return Err(value);
                };
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                index
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.value = Some(value);
        self.len += 1;
        Ok(H::from_raw_parts(index, slot.generation))
    }

    pub fn get(&self, handle: H) -> Option<&T> {
        self.slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: H) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn remove(&mut self, handle: H) -> Option<T> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let value = slot.value.take()?;
        self.free.push(handle.index());
        self.len -= 1;
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (H::from_raw_parts(index as u32, slot.generation), value))
        })
    }

    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                self.free.push(index as u32);
                out.push(value);
            }
        }
        self.len = 0;
        out
    }
}
