//! Request types for the scheduler.

use crate::cache::{NodeId, SlotId};
use crate::error::{CanopyError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

impl RequestId {
    /// Generate a new unique request ID.
    pub fn new() -> Self {
        RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// State of a request in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Queued, never admitted.
    Waiting,
    /// Admitted; prefilled and decoding.
    Running,
    /// Pushed back to the queue under memory pressure.
    Retracted,
    /// Terminal.
    Finished,
}

impl RequestState {
    /// Whether the request sits in the waiting queue.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting | Self::Retracted)
    }
}

/// Why a request stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// A stop string matched.
    Stop,
    /// `max_new_tokens` or the KV capacity was reached.
    Length,
    /// The engine's end-of-sequence token was sampled.
    Eos,
    /// Cancelled by the client.
    Abort,
    /// The engine failed for this request.
    Error,
}

/// One or many stop strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopStrings {
    /// A single stop string.
    One(String),
    /// A list of stop strings.
    Many(Vec<String>),
}

impl Default for StopStrings {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl StopStrings {
    /// Non-empty stop strings.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let all: &[String] = match self {
            Self::One(s) => std::slice::from_ref(s),
            Self::Many(v) => v,
        };
        all.iter().map(String::as_str).filter(|s| !s.is_empty())
    }

    /// Length of the longest stop string in bytes.
    pub fn max_len(&self) -> usize {
        self.iter().map(str::len).max().unwrap_or(0)
    }
}

/// Sampling parameters for generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingParams {
    /// Temperature for sampling.
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_new_tokens: usize,
    /// Stop strings.
    pub stop: StopStrings,
    /// Top-p (nucleus) sampling.
    pub top_p: f32,
    /// Top-k sampling; -1 disables it.
    pub top_k: i32,
    /// Frequency penalty.
    pub frequency_penalty: f32,
    /// Presence penalty.
    pub presence_penalty: f32,
    /// Keep generating past the end-of-sequence token.
    pub ignore_eos: bool,
    /// Regex constraint on the output.
    pub regex: Option<String>,
    /// Number of parallel samples.
    pub n: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_new_tokens: 16,
            stop: StopStrings::default(),
            top_p: 1.0,
            top_k: -1,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            ignore_eos: false,
            regex: None,
            n: 1,
        }
    }
}

impl SamplingParams {
    /// Greedy sampling (temperature=0).
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    /// Sampling with temperature.
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature,
            ..Default::default()
        }
    }

    /// Set the generation limit.
    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Reject parameters no engine can honour.
    pub fn validate(&self) -> Result<()> {
        let reject = |msg: String| Err(CanopyError::AdmissionRejected(msg));

        if !(self.temperature >= 0.0) {
            return reject(format!("temperature {} must be non-negative", self.temperature));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return reject(format!("top_p {} must be in (0, 1]", self.top_p));
        }
        if self.top_k < 1 && self.top_k != -1 {
            return reject(format!("top_k {} must be -1 or at least 1", self.top_k));
        }
        for (name, value) in [
            ("frequency_penalty", self.frequency_penalty),
            ("presence_penalty", self.presence_penalty),
        ] {
            if !(-2.0..=2.0).contains(&value) {
                return reject(format!("{name} {value} must be in [-2, 2]"));
            }
        }
        if self.n == 0 {
            return reject("n must be at least 1".into());
        }
        Ok(())
    }
}

/// A request as it arrives at intake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitRequest {
    /// Prompt tokens.
    #[serde(rename = "input_tokens", alias = "input_ids")]
    pub input_ids: Vec<u32>,
    /// Sampling parameters.
    #[serde(default)]
    pub sampling_params: SamplingParams,
    /// Opaque image payload, forwarded to the engine.
    #[serde(default)]
    pub image_data: Option<String>,
    /// Caller-chosen id; events for every sample carry it.
    #[serde(default)]
    pub request_id: RequestId,
}

impl SubmitRequest {
    /// Create a submission with default sampling and a fresh id.
    pub fn new(input_ids: Vec<u32>) -> Self {
        Self {
            input_ids,
            sampling_params: SamplingParams::default(),
            image_data: None,
            request_id: RequestId::new(),
        }
    }

    /// Set the sampling parameters.
    pub fn with_sampling(mut self, sampling_params: SamplingParams) -> Self {
        self.sampling_params = sampling_params;
        self
    }
}

/// One sample of a submitted request, tracked through its lifecycle.
#[derive(Debug, Clone)]
pub struct Request {
    /// Unique request ID.
    pub id: RequestId,
    /// ID the client submitted; shared by all samples.
    pub group: RequestId,
    /// Sample index within the group.
    pub index: usize,
    /// Input token IDs.
    pub input_ids: Vec<u32>,
    /// Output tokens generated so far.
    pub output_ids: Vec<u32>,
    /// Decoded text of the output, as reported by the engine.
    pub output_text: String,
    /// Sampling parameters.
    pub sampling: SamplingParams,
    /// Opaque image payload.
    pub image_data: Option<String>,
    /// Slots reused from the prefix cache.
    pub prefix_indices: Vec<SlotId>,
    /// Deepest cache node covering the prefix.
    pub last_node: NodeId,
    /// Slots held exclusively by this request.
    pub owned_slots: Vec<SlotId>,
    /// Leading tokens whose KV the engine has computed.
    pub computed_len: usize,
    /// Current state.
    pub state: RequestState,
    /// Why the request finished.
    pub finish_reason: Option<FinishReason>,
    /// Arrival order.
    pub arrival_seq: u64,
    /// Admission order of the latest admission.
    pub admitted_seq: Option<u64>,
    /// Consecutive ticks admission was blocked on memory.
    pub eviction_failures: u32,
    /// Times this request was retracted.
    pub retractions: u32,
}

impl Request {
    /// Create a waiting request.
    pub fn new(id: RequestId, input_ids: Vec<u32>, sampling: SamplingParams) -> Self {
        Self {
            id,
            group: id,
            index: 0,
            input_ids,
            output_ids: Vec::new(),
            output_text: String::new(),
            sampling,
            image_data: None,
            prefix_indices: Vec::new(),
            last_node: NodeId::ROOT,
            owned_slots: Vec::new(),
            computed_len: 0,
            state: RequestState::Waiting,
            finish_reason: None,
            arrival_seq: 0,
            admitted_seq: None,
            eviction_failures: 0,
            retractions: 0,
        }
    }

    /// Place this request in a sample group.
    pub fn in_group(mut self, group: RequestId, index: usize) -> Self {
        self.group = group;
        self.index = index;
        self
    }

    /// `|input| + |output|`.
    pub fn token_len(&self) -> usize {
        self.input_ids.len() + self.output_ids.len()
    }

    /// Slots this request must hold exclusively.
    pub fn kv_need(&self) -> usize {
        self.token_len().saturating_sub(self.prefix_indices.len())
    }

    /// Input and output tokens, in order.
    pub fn all_tokens(&self) -> Vec<u32> {
        let mut tokens = Vec::with_capacity(self.token_len());
        tokens.extend_from_slice(&self.input_ids);
        tokens.extend_from_slice(&self.output_ids);
        tokens
    }

    /// Prefix slots followed by owned slots, one per KV-bearing position.
    pub fn all_slots(&self) -> Vec<SlotId> {
        let mut slots = Vec::with_capacity(self.prefix_indices.len() + self.owned_slots.len());
        slots.extend_from_slice(&self.prefix_indices);
        slots.extend_from_slice(&self.owned_slots);
        slots
    }

    /// Remaining tokens to generate.
    pub fn remaining_tokens(&self) -> usize {
        self.sampling
            .max_new_tokens
            .saturating_sub(self.output_ids.len())
    }

    /// Append a token and its text, returning the finish reason it triggers.
    ///
    /// `eos` is the engine's end-of-sequence token, `capacity` the slot count
    /// a single sequence may never exceed.
    pub fn append_token(
        &mut self,
        token: u32,
        text: Option<&str>,
        eos: Option<u32>,
        capacity: usize,
    ) -> Option<FinishReason> {
        self.output_ids.push(token);
        let scan_from = self.output_text.len();
        if let Some(text) = text {
            self.output_text.push_str(text);
        }

        if self.output_ids.len() >= self.sampling.max_new_tokens || self.token_len() >= capacity {
            return Some(FinishReason::Length);
        }
        if !self.sampling.ignore_eos && eos == Some(token) {
            return Some(FinishReason::Eos);
        }
        if self.matches_stop(scan_from) {
            return Some(FinishReason::Stop);
        }
        None
    }

    /// Whether a stop string ends somewhere past byte `scan_from`.
    fn matches_stop(&self, scan_from: usize) -> bool {
        let max_len = self.sampling.stop.max_len();
        if max_len == 0 || scan_from == self.output_text.len() {
            return false;
        }
        let mut start = scan_from.saturating_sub(max_len - 1);
        while !self.output_text.is_char_boundary(start) {
            start -= 1;
        }
        let window = &self.output_text[start..];
        self.sampling.stop.iter().any(|stop| window.contains(stop))
    }
}
