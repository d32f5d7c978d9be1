// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use base::debug;
use base::warn;

use crate::Error;
use crate::Handle;
use crate::ObjectKind;
use crate::Result;
use crate::MAX_OBJECTS;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Allocated,
    /// Reserved for later reuse but invisible to `get`.
    Suspended,
}

struct Slot<T> {
    generation: u8,
    state: SlotState,
    value: Option<T>,
}

/// Slot allocator for one kind of object.
///
/// Freed slots are reused in LIFO order: the most recently freed slot is handed out first.
pub struct ObjectHeap<T> {
    kind: ObjectKind,
    slots: Vec<Slot<T>>,
    free_list: Vec<usize>,
    max_objects: usize,
    live: usize,
}

impl<T> ObjectHeap<T> {
    /// Creates a heap that grows up to the full index space.
    pub fn new(kind: ObjectKind) -> ObjectHeap<T> {
        ObjectHeap {
            kind,
            slots: Vec::new(),
            free_list: Vec::new(),
            max_objects: MAX_OBJECTS,
            live: 0,
        }
    }

    /// Creates a heap that refuses to hold more than `max_objects` objects at once.
    pub fn with_capacity(kind: ObjectKind, max_objects: usize) -> Result<ObjectHeap<T>> {
        if max_objects == 0 || max_objects > MAX_OBJECTS {
            return Err(Error::InvalidCapacity {
                requested: max_objects,
                max: MAX_OBJECTS,
            });
        }
        let mut heap = ObjectHeap::new(kind);
        heap.max_objects = max_objects;
        Ok(heap)
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Number of allocated or suspended objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Stores `value` in a free slot and returns its handle.
    pub fn allocate(&mut self, value: T) -> Result<Handle> {
        if self.live >= self.max_objects {
            return Err(Error::HeapFull(self.kind));
        }
        let index = match self.free_list.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    state: SlotState::Free,
                    value: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.state = SlotState::Allocated;
        slot.value = Some(value);
        self.live += 1;
        Ok(Handle::new(self.kind, slot.generation, index))
    }

    // Resolves `handle` to a slot index whose state is not `Free`.
    fn resolve(&self, handle: Handle) -> Result<usize> {
        if handle.kind() != Some(self.kind) {
            return Err(Error::WrongKind {
                handle,
                expected: self.kind,
            });
        }
        let index = handle.index();
        match self.slots.get(index) {
            Some(slot) if slot.generation == handle.generation() && slot.state != SlotState::Free => {
                Ok(index)
            }
            _ => Err(Error::InvalidHandle(handle)),
        }
    }

    fn state(&self, handle: Handle) -> Option<SlotState> {
        self.resolve(handle).ok().map(|index| self.slots[index].state)
    }

    /// Looks up a live object. Suspended, freed, stale and foreign handles yield `None`.
    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.state(handle)? {
            SlotState::Allocated => self.slots[handle.index()].value.as_ref(),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.state(handle)? {
            SlotState::Allocated => self.slots[handle.index()].value.as_mut(),
            _ => None,
        }
    }

    /// Like `get`, but also returns suspended objects.
    pub fn get_retained(&self, handle: Handle) -> Option<&T> {
        let index = self.resolve(handle).ok()?;
        self.slots[index].value.as_ref()
    }

    pub fn get_retained_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let index = self.resolve(handle).ok()?;
        self.slots[index].value.as_mut()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.state(handle) == Some(SlotState::Allocated)
    }

    pub fn is_suspended(&self, handle: Handle) -> bool {
        self.state(handle) == Some(SlotState::Suspended)
    }

    /// Releases the slot behind `handle` and returns its payload.
    ///
    /// Suspended objects can be freed directly. Freeing twice fails with `InvalidHandle` because
    /// the generation no longer matches.
    pub fn free(&mut self, handle: Handle) -> Result<T> {
        let index = self.resolve(handle)?;
        let slot = &mut self.slots[index];
        let value = slot.value.take().ok_or(Error::InvalidHandle(handle))?;
        slot.state = SlotState::Free;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(index);
        self.live -= 1;
        Ok(value)
    }

    /// Hides a live object from `get` while keeping its slot and handle reserved.
    pub fn suspend(&mut self, handle: Handle) -> Result<()> {
        let index = self.resolve(handle)?;
        let slot = &mut self.slots[index];
        if slot.state == SlotState::Suspended {
            return Err(Error::AlreadySuspended(handle));
        }
        slot.state = SlotState::Suspended;
        Ok(())
    }

    /// Makes a suspended object visible again under the same handle.
    pub fn unsuspend(&mut self, handle: Handle) -> Result<()> {
        let index = self.resolve(handle)?;
        let slot = &mut self.slots[index];
        if slot.state != SlotState::Suspended {
            return Err(Error::NotSuspended(handle));
        }
        slot.state = SlotState::Allocated;
        Ok(())
    }

    /// Walks every allocated or suspended object in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> + '_ {
        let kind = self.kind;
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state != SlotState::Free)
            .filter_map(move |(index, slot)| {
                slot.value
                    .as_ref()
                    .map(|value| (Handle::new(kind, slot.generation, index), value))
            })
    }

    /// Snapshot of the handles `iter` would visit, for sweeps that free while walking.
    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Drops the heap. Returns how many objects were still present.
    pub fn destroy(self) -> usize {
        if self.live > 0 {
            warn!("{} heap destroyed with {} objects left", self.kind, self.live);
        } else {
            debug!("{} heap destroyed", self.kind);
        }
        self.live
    }
}
