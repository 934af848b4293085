//! # Canopy Core
//!
//! Request scheduler for token-generation serving with radix-tree prefix reuse.
//!
//! This crate provides:
//! - **Radix prefix cache** with reference counting and LRU eviction
//! - **KV slot pool** with all-or-nothing allocation
//! - **Scheduler** with five admission policies and retraction under pressure
//! - **Engine interface** for execution backends, plus a reference engine

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod scheduler;

pub use error::{CanopyError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{NodeId, RadixCache, SlotId, SlotPool};
    pub use crate::config::SchedulerConfig;
    pub use crate::engine::{ExecutionEngine, ReferenceEngine, SampledToken, SampledTokens};
    pub use crate::error::{CanopyError, Result};
    pub use crate::scheduler::{
        BatchPlan, EventKind, FinishReason, RequestEvent, RequestId, SamplingParams,
        SchedulePolicy, Scheduler, SchedulerStats, SubmitRequest,
    };
}
