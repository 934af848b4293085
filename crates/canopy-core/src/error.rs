//! Error types for Canopy Core.

use thiserror::Error;

/// Result type alias for Canopy operations.
pub type Result<T> = std::result::Result<T, CanopyError>;

/// Errors that can occur in Canopy operations.
#[derive(Error, Debug)]
pub enum CanopyError {
    /// Request can never fit in a tick (too long, or invalid sampling parameters).
    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    /// Intake channel is full; the caller should retry.
    #[error("intake queue full: capacity {capacity}")]
    Backpressure {
        /// Intake capacity.
        capacity: usize,
    },

    /// The prefix cache could not free enough slots for an admission.
    #[error("eviction exhausted: needed {needed} slots, {available} available")]
    EvictionExhausted {
        /// Slots the admission needed.
        needed: usize,
        /// Slots available after eviction.
        available: usize,
    },

    /// The slot pool cannot satisfy an allocation.
    #[error("insufficient kv slots: requested {requested}, {available} free")]
    Insufficient {
        /// Slots requested.
        requested: usize,
        /// Slots free at the time of the request.
        available: usize,
    },

    /// The execution engine failed or returned an incomplete result.
    #[error("engine fault: {0}")]
    EngineFault(String),

    /// Scheduler bookkeeping is inconsistent. Fatal.
    #[error("invariant break: {0}")]
    InvariantBreak(String),

    /// Invalid slot reference.
    #[error("invalid slot id: {0}")]
    InvalidSlot(u32),

    /// Invalid radix node reference.
    #[error("invalid node id: {0}")]
    InvalidNode(u64),

    /// The prefix cache still has pinned nodes.
    #[error("prefix cache in use: {pinned} nodes pinned")]
    CacheInUse {
        /// Number of pinned nodes.
        pinned: usize,
    },

    /// Configuration failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// No request with this id is known.
    #[error("unknown request: {0}")]
    UnknownRequest(u64),

    /// The serving loop has stopped.
    #[error("scheduler is shut down")]
    Shutdown,

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl CanopyError {
    /// Whether this error must stop the scheduler.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantBreak(_))
    }

    /// Whether the scheduler recovers from this error on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Backpressure { .. } | Self::EvictionExhausted { .. })
    }
}
