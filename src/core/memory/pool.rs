/*!
 * Slot Pool
 * Fixed-capacity indexed allocator with an intrusive free list
 *
 * # Performance
 *
 * - `allocate` / `free`: O(1), pop/push on the free-list head
 * - Freed indices are reused LIFO, before any never-used slot
 * - Capacity is fixed at creation; a full pool reports an error instead of growing
 *
 * Not internally synchronized. Owners wrap it in their own lock.
 */

use crate::core::errors::{IpcError, IpcResult};
use crate::core::types::SlotIndex;

struct Slot<T> {
    value: Option<T>,
    next_free: Option<SlotIndex>,
}

/// Fixed-capacity slot pool
pub struct SlotPool<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<SlotIndex>,
    active: usize,
}

impl<T> SlotPool<T> {
    /// Create a pool with `capacity` empty slots
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|i| Slot {
                value: None,
                next_free: (i + 1 < capacity).then_some(i + 1),
            })
            .collect();

        Self {
            slots,
            free_head: (capacity > 0).then_some(0),
            active: 0,
        }
    }

    /// Store `value` in a free slot and return its index
    ///
    /// Fails with `ResourceExhausted` when every slot is in use.
    pub fn allocate(&mut self, value: T) -> IpcResult<SlotIndex> {
        let index = self.free_head.ok_or_else(|| {
            IpcError::ResourceExhausted(format!("slot pool full ({} slots)", self.slots.len()))
        })?;

        let slot = &mut self.slots[index];
        self.free_head = slot.next_free.take();
        slot.value = Some(value);
        self.active += 1;
        Ok(index)
    }

    /// Release a slot and hand back its value
    ///
    /// Freeing an unused or out-of-range index is a no-op.
    pub fn free(&mut self, index: SlotIndex) -> Option<T> {
        let slot = self.slots.get_mut(index)?;
        let value = slot.value.take()?;
        slot.next_free = self.free_head;
        self.free_head = Some(index);
        self.active -= 1;
        Some(value)
    }

    #[inline]
    pub fn get(&self, index: SlotIndex) -> Option<&T> {
        self.slots.get(index)?.value.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, index: SlotIndex) -> Option<&mut T> {
        self.slots.get_mut(index)?.value.as_mut()
    }

    #[inline]
    pub fn is_active(&self, index: SlotIndex) -> bool {
        self.get(index).is_some()
    }

    #[inline]
    pub fn has_capacity(&self) -> bool {
        self.free_head.is_some()
    }

    /// Number of slots in use
    #[inline]
    pub fn len(&self) -> usize {
        self.active
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Iterate over `(index, value)` for every slot in use
    pub fn iter_active(&self) -> impl Iterator<Item = (SlotIndex, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.value.as_ref().map(|v| (i, v)))
    }

    /// Free every slot, returning the values in index order
    pub fn drain(&mut self) -> Vec<T> {
        let indices: Vec<SlotIndex> = self.iter_active().map(|(i, _)| i).collect();
        indices.into_iter().filter_map(|i| self.free(i)).collect()
    }
}
