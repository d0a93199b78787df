/*!
 * Linear Lockable Pool
 *
 * Fixed-capacity table addressed by caller-chosen indices, where every
 * entry carries its own lock. Locking one entry never blocks work on
 * another.
 *
 * # Locking
 *
 * - The pool-wide lock guards only the `active` flags
 * - Each entry's lock guards its value
 * - No operation holds both at once, so there is no lock ordering to get wrong
 *
 * An entry's value is the authority on liveness once its lock is held;
 * the flags are the structural view used by `find_free` and snapshots.
 * `set` only fills an inactive index, and `remove` clears the value before
 * the flag, so a flag is never cleared while a value is still present.
 */

use crate::core::errors::{IpcError, IpcResult};
use crate::core::types::SlotIndex;
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};

/// Fixed-capacity pool with per-entry locks
pub struct LinearPool<T> {
    active: Mutex<Vec<bool>>,
    entries: Box<[Mutex<Option<T>>]>,
}

impl<T> LinearPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            active: Mutex::new(vec![false; capacity]),
            entries: (0..capacity).map(|_| Mutex::new(None)).collect(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn check_index(&self, index: SlotIndex) -> IpcResult<()> {
        if index < self.entries.len() {
            Ok(())
        } else {
            Err(IpcError::InvalidParam(format!(
                "index {} out of range (capacity {})",
                index,
                self.entries.len()
            )))
        }
    }

    /// Place `value` at a caller-chosen inactive index
    pub fn set(&self, index: SlotIndex, value: T) -> IpcResult<()> {
        self.check_index(index)?;
        {
            let mut active = self.active.lock();
            if active[index] {
                return Err(IpcError::InvalidParam(format!("slot {} already in use", index)));
            }
            active[index] = true;
        }
        *self.entries[index].lock() = Some(value);
        Ok(())
    }

    /// Place `value` at the lowest inactive index
    pub fn insert(&self, value: T) -> IpcResult<SlotIndex> {
        let index = {
            let mut active = self.active.lock();
            let index = active.iter().position(|a| !a).ok_or_else(|| {
                IpcError::ResourceExhausted(format!(
                    "linear pool full ({} slots)",
                    self.entries.len()
                ))
            })?;
            active[index] = true;
            index
        };
        *self.entries[index].lock() = Some(value);
        Ok(index)
    }

    /// Remove and return the value at `index`
    ///
    /// Waits for any holder of the entry lock to release it first.
    pub fn remove(&self, index: SlotIndex) -> Option<T> {
        let value = self.entries.get(index)?.lock().take()?;
        self.mark_inactive(index);
        Some(value)
    }

    fn mark_inactive(&self, index: SlotIndex) {
        self.active.lock()[index] = false;
    }

    /// Lowest index not currently in use
    pub fn find_free(&self) -> Option<SlotIndex> {
        self.active.lock().iter().position(|a| !a)
    }

    #[inline]
    pub fn is_active(&self, index: SlotIndex) -> bool {
        self.active.lock().get(index).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.active.lock().iter().filter(|a| **a).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices in use at the moment of the call
    pub fn active_indices(&self) -> Vec<SlotIndex> {
        self.active
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.then_some(i))
            .collect()
    }

    /// Lock one entry, blocking until its lock is free
    ///
    /// Liveness is checked before and after acquiring the lock; `None` if
    /// the entry is inactive or was removed while this call waited.
    pub fn lock_entry(&self, index: SlotIndex) -> Option<EntryGuard<'_, T>> {
        if !self.is_active(index) {
            return None;
        }
        let guard = self.entries[index].lock();
        self.confirm(index, guard)
    }

    /// Non-blocking `lock_entry`; `None` if the entry is busy or inactive
    pub fn try_lock_entry(&self, index: SlotIndex) -> Option<EntryGuard<'_, T>> {
        if !self.is_active(index) {
            return None;
        }
        let guard = self.entries[index].try_lock()?;
        self.confirm(index, guard)
    }

    fn confirm<'a>(
        &'a self,
        index: SlotIndex,
        guard: MutexGuard<'a, Option<T>>,
    ) -> Option<EntryGuard<'a, T>> {
        guard.is_some().then(|| EntryGuard {
            pool: self,
            index,
            guard,
        })
    }

    /// Run `f` on the entry at `index` under its lock
    pub fn with_entry<R>(&self, index: SlotIndex, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut entry = self.lock_entry(index)?;
        Some(f(&mut entry))
    }
}

/// Exclusive access to one live pool entry; the lock drops with the guard
pub struct EntryGuard<'a, T> {
    pool: &'a LinearPool<T>,
    index: SlotIndex,
    guard: MutexGuard<'a, Option<T>>,
}

impl<'a, T> EntryGuard<'a, T> {
    #[inline]
    pub fn index(&self) -> SlotIndex {
        self.index
    }

    /// Remove the locked entry and release its lock
    pub fn remove(mut self) -> T {
        let value = self.guard.take();
        let (pool, index) = (self.pool, self.index);
        drop(self);
        pool.mark_inactive(index);
        match value {
            Some(v) => v,
            None => unreachable!("entry guard always holds a live entry"),
        }
    }
}

impl<'a, T> Deref for EntryGuard<'a, T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        match self.guard.as_ref() {
            Some(v) => v,
            None => unreachable!("entry guard always holds a live entry"),
        }
    }
}

impl<'a, T> DerefMut for EntryGuard<'a, T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        match self.guard.as_mut() {
            Some(v) => v,
            None => unreachable!("entry guard always holds a live entry"),
        }
    }
}
