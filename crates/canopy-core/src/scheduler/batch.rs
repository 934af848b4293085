//! Batch types for scheduled execution.

use super::{Request, RequestId, SamplingParams};
use crate::cache::SlotId;
use serde::{Deserialize, Serialize};

/// Type of batch execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchType {
    /// Prefill phase (process input tokens).
    Prefill,
    /// Decode phase (generate tokens).
    Decode,
    /// Mixed prefill and decode.
    Mixed,
}

/// Snapshot of one request as the engine sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledRequest {
    /// Request ID; sampled tokens are keyed by it.
    pub id: RequestId,
    /// Full token sequence: input followed by output so far.
    pub tokens: Vec<u32>,
    /// One KV slot per token.
    pub slots: Vec<SlotId>,
    /// Leading tokens whose KV is already in their slots.
    pub cached_len: usize,
    /// Sampling parameters.
    pub sampling: SamplingParams,
    /// Opaque image payload.
    pub image_data: Option<String>,
}

impl ScheduledRequest {
    /// Snapshot a request whose first `cached_len` tokens already have KV.
    pub fn from_request(req: &Request, cached_len: usize) -> Self {
        Self {
            id: req.id,
            tokens: req.all_tokens(),
            slots: req.all_slots(),
            cached_len,
            sampling: req.sampling.clone(),
            image_data: req.image_data.clone(),
        }
    }

    /// Tokens the engine must compute KV for.
    pub fn new_tokens(&self) -> &[u32] {
        &self.tokens[self.cached_len.min(self.tokens.len())..]
    }

    /// Slots receiving the new KV.
    pub fn new_slots(&self) -> &[SlotId] {
        &self.slots[self.cached_len.min(self.slots.len())..]
    }
}

/// Work for one engine step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchPlan {
    /// Scheduler tick that produced the plan.
    pub tick: u64,
    /// Newly admitted requests to prefill.
    pub prefill: Vec<ScheduledRequest>,
    /// Running requests to advance by one token.
    pub decode: Vec<ScheduledRequest>,
}

impl BatchPlan {
    /// Type of the batch, or `None` for an idle tick.
    pub fn batch_type(&self) -> Option<BatchType> {
        match (self.prefill.is_empty(), self.decode.is_empty()) {
            (true, true) => None,
            (false, true) => Some(BatchType::Prefill),
            (true, false) => Some(BatchType::Decode),
            (false, false) => Some(BatchType::Mixed),
        }
    }

    /// Get batch size.
    pub fn size(&self) -> usize {
        self.prefill.len() + self.decode.len()
    }

    /// Check if batch is empty.
    pub fn is_empty(&self) -> bool {
        self.prefill.is_empty() && self.decode.is_empty()
    }

    /// Tokens computed by the prefill half.
    pub fn num_prefill_tokens(&self) -> usize {
        self.prefill.iter().map(|r| r.new_tokens().len()).sum()
    }

    /// Tokens computed by the decode half.
    pub fn num_decode_tokens(&self) -> usize {
        self.decode.iter().map(|r| r.new_tokens().len()).sum()
    }

    /// Total tokens in batch.
    pub fn total_tokens(&self) -> usize {
        self.num_prefill_tokens() + self.num_decode_tokens()
    }

    /// Every request in the plan, prefill first.
    pub fn requests(&self) -> impl Iterator<Item = &ScheduledRequest> {
        self.prefill.iter().chain(&self.decode)
    }

    /// Check if `id` is part of the plan.
    pub fn contains(&self, id: RequestId) -> bool {
        self.requests().any(|r| r.id == id)
    }
}
