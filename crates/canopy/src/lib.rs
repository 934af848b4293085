//! # Canopy
//!
//! Token-generation request scheduler with radix-tree prefix reuse.
//!
//! Canopy decides, tick by tick, which requests run on an execution engine:
//! - **Prefix Reuse**: Finished requests leave their KV in a radix cache
//! - **Continuous Batching**: Prefill and decode share one plan per tick
//! - **Admission Policies**: lpm, fcfs, lof, random and dfs-weight
//! - **Retraction**: Running requests yield memory under pressure
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use canopy::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (server, join) = Server::builder()
//!         .max_total_tokens(4096)
//!         .spawn(Arc::new(ReferenceEngine::new(32_000)))?;
//!
//!     let request = SubmitRequest::new(vec![1, 2, 3])
//!         .with_sampling(SamplingParams::greedy().with_max_new_tokens(8));
//!     for event in server.submit(request).await?.collect().await {
//!         println!("{event:?}");
//!     }
//!
//!     server.shutdown().await;
//!     join.await??;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use canopy_core::*;

mod server;

pub use server::{Server, ServerBuilder, ServerConfig, ServerHandle, Submission};

/// Commonly used types.
pub mod prelude {
    pub use crate::server::{Server, ServerBuilder, ServerConfig, ServerHandle, Submission};
    pub use canopy_core::prelude::*;

    // Re-export useful external types
    pub use anyhow;
    pub use tokio;
    pub use tracing;
}
