//! KV slot pool management.

use super::SlotId;
use crate::error::{CanopyError, Result};
use std::collections::{HashSet, VecDeque};

/// Fixed-capacity pool of KV slots with free list management.
///
/// The pool is the single source of truth for KV memory. The prefix cache
/// borrows slot indices but reclaims them only by calling [`SlotPool::free`].
#[derive(Debug, Clone)]
pub struct SlotPool {
    /// Allocation flag per slot.
    allocated: Vec<bool>,
    /// Free slot IDs, reused in FIFO order.
    free_list: VecDeque<SlotId>,
}

impl SlotPool {
    /// Create a new pool with `capacity` slots, all free.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity >= u32::MAX as usize {
            return Err(CanopyError::InvalidConfig(format!(
                "slot pool capacity {capacity} out of range"
            )));
        }

        let free_list = (0..capacity as u32).map(SlotId).collect();

        Ok(Self {
            allocated: vec![false; capacity],
            free_list,
        })
    }

    /// Allocate `n` slots. Never allocates partially.
    pub fn alloc(&mut self, n: usize) -> Result<Vec<SlotId>> {
        if n > self.free_list.len() {
            return Err(CanopyError::Insufficient {
                requested: n,
                available: self.free_list.len(),
            });
        }

        let slots: Vec<SlotId> = self.free_list.drain(..n).collect();
        for slot in &slots {
            self.allocated[slot.index()] = true;
        }
        Ok(slots)
    }

    /// Return slots to the pool.
    ///
    /// Fails without freeing anything if any slot is out of range or not
    /// currently allocated.
    pub fn free(&mut self, slots: &[SlotId]) -> Result<()> {
        let mut seen = HashSet::with_capacity(slots.len());
        for slot in slots {
            if !self.is_valid(*slot) {
                return Err(CanopyError::InvalidSlot(slot.0));
            }
            if !self.allocated[slot.index()] || !seen.insert(*slot) {
                return Err(CanopyError::InvariantBreak(format!(
                    "double free of slot {slot}"
                )));
            }
        }

        for slot in slots {
            self.allocated[slot.index()] = false;
            self.free_list.push_back(*slot);
        }
        Ok(())
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.free_list.len()
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.allocated.len()
    }

    /// Number of allocated slots.
    pub fn used(&self) -> usize {
        self.capacity() - self.available()
    }

    /// Whether `slot` is currently allocated.
    pub fn is_allocated(&self, slot: SlotId) -> bool {
        self.is_valid(slot) && self.allocated[slot.index()]
    }

    /// Check if a slot ID is valid.
    fn is_valid(&self, slot: SlotId) -> bool {
        slot.index() < self.allocated.len()
    }
}
