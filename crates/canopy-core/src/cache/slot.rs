//! Slot identifiers for the KV cache.

use serde::{Deserialize, Serialize};

/// Index of one token position's worth of KV memory.
///
/// A slot holds per-layer key/value tensors for exactly one token of one
/// live owner: either a radix node edge position or a request's uncommitted
/// tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl SlotId {
    /// Position of this slot in the pool.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
