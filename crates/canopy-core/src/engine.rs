//! Execution engine trait and reference implementation.
//!
//! This module provides:
//! - [`ExecutionEngine`] - Contract between the scheduler and a model backend
//! - [`ReferenceEngine`] - Deterministic CPU stand-in that models KV memory
//! - [`SampledToken`] - One sampled token and its extras

use crate::cache::SlotId;
use crate::error::{CanopyError, Result};
use crate::scheduler::{BatchPlan, RequestId, ScheduledRequest};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A token sampled for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledToken {
    /// Sampled token.
    pub token_id: u32,
    /// Log-probability of the sampled token.
    pub logprob: Option<f32>,
    /// Decoded text of the token.
    pub text: Option<String>,
    /// Tokens forced by a regex constraint after the sampled one.
    #[serde(default)]
    pub jump_forward: Vec<u32>,
}

impl SampledToken {
    /// A bare sampled token.
    pub fn new(token_id: u32) -> Self {
        Self {
            token_id,
            logprob: None,
            text: None,
            jump_forward: Vec::new(),
        }
    }

    /// Attach decoded text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Attach a log-probability.
    pub fn with_logprob(mut self, logprob: f32) -> Self {
        self.logprob = Some(logprob);
        self
    }

    /// Attach forced follow-up tokens.
    pub fn with_jump_forward(mut self, tokens: Vec<u32>) -> Self {
        self.jump_forward = tokens;
        self
    }
}

/// One sampled token per request in a plan.
pub type SampledTokens = HashMap<RequestId, SampledToken>;

/// Backend that executes scheduled batches.
///
/// The engine never mutates scheduler state. It reads slot indices, writes
/// KV into the slots it is handed, and returns token ids.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Prefill `plan.prefill` and run one decode step for `plan.decode`.
    ///
    /// Returns one token for every request in the plan.
    async fn run(&self, plan: &BatchPlan) -> Result<SampledTokens>;

    /// End-of-sequence token, if the model has one.
    fn eos_token_id(&self) -> Option<u32> {
        None
    }
}

/// What a slot holds in the reference engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KvEntry {
    token: u32,
    position: usize,
}

/// Reference CPU engine for testing.
///
/// Stores, per slot, the token and position whose KV it holds, and faults
/// when a plan reads a slot that does not hold what the sequence expects.
/// The next token is a pure function of the sequence, so runs are
/// reproducible regardless of batching.
///
/// # Example
///
/// ```rust,ignore
/// use canopy_core::engine::{ExecutionEngine, ReferenceEngine};
///
/// let engine = ReferenceEngine::new(32000).with_eos(2);
/// let sampled = engine.run(&plan).await?;
/// ```
#[derive(Debug)]
pub struct ReferenceEngine {
    /// Vocabulary size.
    vocab_size: u32,
    /// End-of-sequence token.
    eos: Option<u32>,
    /// Text for each token, if any.
    vocab: HashMap<u32, String>,
    /// Forced tokens returned for regex-constrained requests.
    jump_forward: Vec<u32>,
    /// In-memory KV storage: slot -> entry.
    kv: RwLock<HashMap<SlotId, KvEntry>>,
}

impl ReferenceEngine {
    /// Create an engine over `vocab_size` tokens.
    pub fn new(vocab_size: u32) -> Self {
        Self {
            vocab_size: vocab_size.max(1),
            eos: None,
            vocab: HashMap::new(),
            jump_forward: Vec::new(),
            kv: RwLock::new(HashMap::new()),
        }
    }

    /// Set the end-of-sequence token.
    pub fn with_eos(mut self, eos: u32) -> Self {
        self.eos = Some(eos);
        self
    }

    /// Set the decoded text of a token.
    pub fn with_token_text(mut self, token: u32, text: impl Into<String>) -> Self {
        self.vocab.insert(token, text.into());
        self
    }

    /// Tokens to force after every sample of a regex-constrained request.
    pub fn with_jump_forward(mut self, tokens: Vec<u32>) -> Self {
        self.jump_forward = tokens;
        self
    }

    /// The token this engine samples after `tokens`.
    pub fn next_token(&self, tokens: &[u32]) -> u32 {
        (fnv1a(tokens) % u64::from(self.vocab_size)) as u32
    }

    /// Number of slots holding KV.
    pub fn num_cached_slots(&self) -> usize {
        self.kv.read().len()
    }

    /// Check the cached part of a request and write KV for the rest.
    fn forward(&self, req: &ScheduledRequest) -> Result<SampledToken> {
        if req.slots.len() != req.tokens.len() {
            return Err(CanopyError::EngineFault(format!(
                "{}: {} tokens but {} slots",
                req.id,
                req.tokens.len(),
                req.slots.len()
            )));
        }
        if req.cached_len >= req.tokens.len() {
            return Err(CanopyError::EngineFault(format!(
                "{}: nothing to compute ({} of {} tokens cached)",
                req.id,
                req.cached_len,
                req.tokens.len()
            )));
        }

        let mut kv = self.kv.write();
        for (position, (slot, token)) in req.slots.iter().zip(&req.tokens).enumerate() {
            let expected = KvEntry {
                token: *token,
                position,
            };
            if position < req.cached_len {
                if kv.get(slot) != Some(&expected) {
                    return Err(CanopyError::EngineFault(format!(
                        "{}: slot {slot} does not hold token {token} at position {position}",
                        req.id
                    )));
                }
            } else {
                kv.insert(*slot, expected);
            }
        }
        drop(kv);

        let hash = fnv1a(&req.tokens);
        let token_id = (hash % u64::from(self.vocab_size)) as u32;
        let mut sampled = SampledToken::new(token_id).with_logprob(-((hash % 1000) as f32) / 1000.0);
        if let Some(text) = self.vocab.get(&token_id) {
            sampled = sampled.with_text(text.clone());
        }
        if req.sampling.regex.is_some() && !self.jump_forward.is_empty() {
            sampled = sampled.with_jump_forward(self.jump_forward.clone());
        }
        Ok(sampled)
    }
}

#[async_trait]
impl ExecutionEngine for ReferenceEngine {
    async fn run(&self, plan: &BatchPlan) -> Result<SampledTokens> {
        let mut sampled = SampledTokens::with_capacity(plan.size());
        for req in plan.requests() {
            sampled.insert(req.id, self.forward(req)?);
        }
        tracing::trace!(
            tick = plan.tick,
            prefill_tokens = plan.num_prefill_tokens(),
            decode_tokens = plan.num_decode_tokens(),
            "reference engine step"
        );
        Ok(sampled)
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos
    }
}

fn fnv1a(tokens: &[u32]) -> u64 {
    tokens.iter().fold(0xcbf2_9ce4_8422_2325, |hash, token| {
        (hash ^ u64::from(*token)).wrapping_mul(0x0100_0000_01b3)
    })
}
