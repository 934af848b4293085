//! Request scheduling for batched inference.
//!
//! Implements continuous batching with:
//! - Prefix reuse through the radix cache
//! - Policy-ordered admission under prefill, running and memory budgets
//! - Retraction of running requests under KV pressure
//!
//! The [`Scheduler`] is a synchronous state machine. A driver calls
//! [`Scheduler::schedule`] to get a [`BatchPlan`], runs it on an engine and
//! hands the sampled tokens back through [`Scheduler::process_output`].
//! Events for clients accumulate until [`Scheduler::take_events`].

mod batch;
mod event;
mod planner;
mod policy;
mod request;

pub use batch::{BatchPlan, BatchType, ScheduledRequest};
pub use event::{EventKind, RequestEvent};
pub use policy::{Prioritizer, SchedulePolicy};
pub use request::{
    FinishReason, Request, RequestId, RequestState, SamplingParams, StopStrings, SubmitRequest,
};

use crate::cache::{RadixCache, SlotId, SlotPool};
use crate::config::SchedulerConfig;
use crate::engine::{SampledToken, SampledTokens};
use crate::error::{CanopyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, trace, warn};

/// Counters and gauges describing the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Ticks run so far.
    pub ticks: u64,
    /// Requests waiting for admission.
    pub waiting: usize,
    /// Requests running.
    pub running: usize,
    /// Free KV slots.
    pub free_slots: usize,
    /// Slots held by the prefix cache.
    pub tree_slots: usize,
    /// Prefix cache slots that can be evicted.
    pub evictable_slots: usize,
    /// Prompt tokens served from the prefix cache.
    pub cache_hit_tokens: u64,
    /// Tokens prefilled.
    pub prefill_tokens: u64,
    /// Tokens decoded.
    pub decode_tokens: u64,
    /// Retractions under memory pressure.
    pub retractions: u64,
    /// Slots reclaimed from the prefix cache.
    pub evicted_slots: u64,
    /// Requests finished normally.
    pub finished: u64,
    /// Requests aborted.
    pub aborted: u64,
    /// Requests failed by the engine.
    pub failed: u64,
}

/// Main scheduler for inference requests.
#[derive(Debug)]
pub struct Scheduler {
    /// Configuration.
    config: SchedulerConfig,
    /// KV slot pool.
    pool: SlotPool,
    /// Prefix cache.
    tree: RadixCache,
    /// Admission ordering.
    prioritizer: Prioritizer,
    /// Every live request.
    requests: HashMap<RequestId, Request>,
    /// Waiting and retracted requests, in arrival order.
    waiting: Vec<RequestId>,
    /// Running requests, in admission order.
    running: Vec<RequestId>,
    /// Live samples per submitted id.
    groups: HashMap<RequestId, Vec<RequestId>>,
    /// Aborts to apply at the next tick boundary.
    pending_aborts: HashSet<RequestId>,
    /// Tick of the plan handed out and not yet completed.
    in_flight: Option<u64>,
    /// Events not yet collected.
    events: Vec<RequestEvent>,
    /// End-of-sequence token.
    eos_token_id: Option<u32>,
    /// Current tick.
    tick: u64,
    /// Next arrival sequence number.
    next_arrival: u64,
    /// Next admission sequence number.
    next_admission: u64,
    /// Running counters.
    stats: SchedulerStats,
}

impl Scheduler {
    /// Create a scheduler with an empty pool of `max_total_tokens` slots.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;

        let pool = SlotPool::new(config.max_total_tokens)?;
        let tree = if config.disable_radix_cache {
            RadixCache::disabled()
        } else {
            RadixCache::new()
        };
        let prioritizer = Prioritizer::new(
            config.schedule_heuristic,
            config.seed(),
            config.disable_radix_cache,
        );
        tracing::info!(
            policy = %prioritizer.policy(),
            max_running = config.max_running_requests,
            prefill_budget = config.prefill_budget(),
            kv_slots = config.max_total_tokens,
            radix_cache = !config.disable_radix_cache,
            "scheduler initialized"
        );

        Ok(Self {
            config,
            pool,
            tree,
            prioritizer,
            requests: HashMap::new(),
            waiting: Vec::new(),
            running: Vec::new(),
            groups: HashMap::new(),
            pending_aborts: HashSet::new(),
            in_flight: None,
            events: Vec::new(),
            eos_token_id: None,
            tick: 0,
            next_arrival: 0,
            next_admission: 0,
            stats: SchedulerStats::default(),
        })
    }

    /// Set the token that finishes a request with [`FinishReason::Eos`].
    pub fn set_eos_token_id(&mut self, eos: Option<u32>) {
        self.eos_token_id = eos;
    }

    /// Configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Validate a submission and queue one request per sample.
    ///
    /// Returns the submitted id, which every event for the submission carries.
    pub fn submit(&mut self, submit: SubmitRequest) -> Result<RequestId> {
        let SubmitRequest {
            input_ids,
            sampling_params,
            image_data,
            request_id,
        } = submit;

        if input_ids.is_empty() {
            return Err(CanopyError::AdmissionRejected("empty input".into()));
        }
        sampling_params.validate()?;
        if let Some(context_length) = self.config.context_length {
            let total = input_ids.len() + sampling_params.max_new_tokens;
            if total > context_length {
                return Err(CanopyError::AdmissionRejected(format!(
                    "{} input + {} new tokens exceeds context length {context_length}",
                    input_ids.len(),
                    sampling_params.max_new_tokens
                )));
            }
        }
        if input_ids.len() + 1 > self.pool.capacity() {
            return Err(CanopyError::AdmissionRejected(format!(
                "{} input tokens can never fit in {} kv slots",
                input_ids.len(),
                self.pool.capacity()
            )));
        }
        if self.groups.contains_key(&request_id) || self.requests.contains_key(&request_id) {
            return Err(CanopyError::AdmissionRejected(format!(
                "{request_id} is already live"
            )));
        }

        let mut samples = Vec::with_capacity(sampling_params.n);
        for index in 0..sampling_params.n {
            let id = if index == 0 {
                request_id
            } else {
                self.fresh_id()
            };
            let mut req = Request::new(id, input_ids.clone(), sampling_params.clone())
                .in_group(request_id, index);
            req.image_data = image_data.clone();
            req.arrival_seq = self.next_arrival;
            self.next_arrival += 1;

            self.waiting.push(id);
            self.requests.insert(id, req);
            samples.push(id);
        }
        trace!(
            request = %request_id,
            input = input_ids.len(),
            samples = samples.len(),
            "queued"
        );
        self.groups.insert(request_id, samples);
        Ok(request_id)
    }

    fn fresh_id(&self) -> RequestId {
        loop {
            let id = RequestId::new();
            if !self.requests.contains_key(&id) && !self.groups.contains_key(&id) {
                return id;
            }
        }
    }

    /// Cancel a submission (every sample) or a single sample.
    ///
    /// Takes effect at the next tick boundary.
    pub fn abort(&mut self, id: RequestId) -> Result<()> {
        if let Some(samples) = self.groups.get(&id) {
            self.pending_aborts.extend(samples.iter().copied());
            Ok(())
        } else if self.requests.contains_key(&id) {
            self.pending_aborts.insert(id);
            Ok(())
        } else {
            Err(CanopyError::UnknownRequest(id.0))
        }
    }

    /// Plan the next batch.
    ///
    /// Returns `None` when there is nothing to run.
    pub fn schedule(&mut self) -> Result<Option<BatchPlan>> {
        if let Some(tick) = self.in_flight {
            return Err(CanopyError::InvariantBreak(format!(
                "plan for tick {tick} is still in flight"
            )));
        }
        self.tick += 1;
        self.stats.ticks = self.tick;

        self.apply_aborts()?;
        self.match_waiting();

        let (decode, retracted) = self.plan_decode()?;
        let prefill = self.admit(decode.len(), &retracted)?;

        let plan = BatchPlan {
            tick: self.tick,
            prefill: prefill
                .iter()
                .filter_map(|id| self.requests.get(id))
                .map(|r| ScheduledRequest::from_request(r, r.prefix_indices.len()))
                .collect(),
            decode: decode
                .iter()
                .filter_map(|id| self.requests.get(id))
                .map(|r| ScheduledRequest::from_request(r, r.computed_len))
                .collect(),
        };

        debug!(
            tick = self.tick,
            running = self.running.len(),
            queued = self.waiting.len(),
            prefill = plan.prefill.len(),
            decode = plan.decode.len(),
            free_slots = self.pool.available(),
            tree_slots = self.tree.total_slots(),
            cache_hit_tokens = self.stats.cache_hit_tokens,
            "scheduled"
        );
        self.after_tick()?;

        if plan.is_empty() {
            return Ok(None);
        }
        self.in_flight = Some(plan.tick);
        Ok(Some(plan))
    }

    /// Apply the engine's output for `plan`.
    ///
    /// A request with no sampled token fails on its own; the rest advance.
    pub fn process_output(&mut self, plan: &BatchPlan, mut sampled: SampledTokens) -> Result<()> {
        self.complete(plan)?;

        let mut outstanding = plan.size();
        for item in plan.requests() {
            outstanding -= 1;
            if !self.requests.contains_key(&item.id) {
                return Err(CanopyError::InvariantBreak(format!(
                    "{} finished while in flight",
                    item.id
                )));
            }
            let Some(token) = sampled.remove(&item.id) else {
                warn!(request = %item.id, tick = plan.tick, "engine returned no token");
                self.fail(item.id, "engine returned no token for request")?;
                continue;
            };
            if let Some(req) = self.requests.get_mut(&item.id) {
                req.computed_len = item.tokens.len();
            }
            self.advance(item.id, token, outstanding)?;
        }
        self.stats.decode_tokens += plan.decode.len() as u64;

        self.after_tick()
    }

    /// Fail every request in `plan` after the engine errored.
    pub fn fail_batch(&mut self, plan: &BatchPlan, err: &CanopyError) -> Result<()> {
        self.complete(plan)?;
        warn!(tick = plan.tick, requests = plan.size(), error = %err, "engine step failed");

        for item in plan.requests() {
            if self.requests.contains_key(&item.id) {
                self.fail(item.id, &err.to_string())?;
            }
        }
        self.after_tick()
    }

    /// Drop the whole prefix cache. Only possible while nothing is running.
    pub fn flush_cache(&mut self) -> Result<()> {
        if !self.running.is_empty() {
            return Err(CanopyError::CacheInUse {
                pinned: self.running.len(),
            });
        }
        self.tree.reset(&mut self.pool)?;
        for req in self.requests.values_mut() {
            req.prefix_indices.clear();
            req.last_node = self.tree.root();
        }
        debug!(free_slots = self.pool.available(), "prefix cache flushed");
        Ok(())
    }

    /// Collect events produced since the last call.
    pub fn take_events(&mut self) -> Vec<RequestEvent> {
        std::mem::take(&mut self.events)
    }

    /// Get number of waiting requests.
    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Get number of running requests.
    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Check if scheduler is idle.
    pub fn is_idle(&self) -> bool {
        self.requests.is_empty() && self.in_flight.is_none()
    }

    /// Look up a live request.
    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(&id)
    }

    /// KV slot pool.
    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    /// Prefix cache.
    pub fn tree(&self) -> &RadixCache {
        &self.tree
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            waiting: self.waiting.len(),
            running: self.running.len(),
            free_slots: self.pool.available(),
            tree_slots: self.tree.total_slots(),
            evictable_slots: self.tree.evictable_slots(),
            evicted_slots: self.tree.stats().evicted_slots,
            ..self.stats.clone()
        }
    }

    /// Verify slot conservation, request accounting and cache structure.
    pub fn check_invariants(&self) -> Result<()> {
        let broken = |msg: String| {
            error!(tick = self.tick, "{msg}");
            Err(CanopyError::InvariantBreak(msg))
        };

        let owned: usize = self.requests.values().map(|r| r.owned_slots.len()).sum();
        let accounted = self.pool.available() + owned + self.tree.total_slots();
        if accounted != self.pool.capacity() {
            return broken(format!(
                "{} free + {owned} owned + {} cached != {} slots",
                self.pool.available(),
                self.tree.total_slots(),
                self.pool.capacity()
            ));
        }

        for id in &self.running {
            let Some(req) = self.requests.get(id) else {
                return broken(format!("running {id} has no record"));
            };
            if req.state != RequestState::Running {
                return broken(format!("{id} is listed running in state {:?}", req.state));
            }
            if !req.last_node.is_root() && self.tree.lock_ref(req.last_node).unwrap_or(0) == 0 {
                return broken(format!("{id} runs on unpinned node {}", req.last_node));
            }
            if req.prefix_indices.len() + req.owned_slots.len() != req.token_len() {
                return broken(format!(
                    "{id} holds {} + {} slots for {} tokens",
                    req.prefix_indices.len(),
                    req.owned_slots.len(),
                    req.token_len()
                ));
            }
        }
        for id in &self.waiting {
            match self.requests.get(id) {
                Some(req) if req.state.is_waiting() && req.owned_slots.is_empty() => {}
                _ => return broken(format!("waiting {id} is inconsistent")),
            }
        }
        if self.running.len() + self.waiting.len() != self.requests.len() {
            return broken("requests are lost between queues".into());
        }

        let mut seen: HashSet<SlotId> = HashSet::with_capacity(self.pool.used());
        let held = self
            .tree
            .all_slots()
            .into_iter()
            .chain(self.requests.values().flat_map(|r| r.owned_slots.iter().copied()));
        for slot in held {
            if !seen.insert(slot) || !self.pool.is_allocated(slot) {
                return broken(format!("slot {slot} is double-owned or free"));
            }
        }

        self.tree.validate().map_err(|e| {
            error!(tick = self.tick, "{e}");
            e
        })
    }

    /// Close the in-flight plan.
    fn complete(&mut self, plan: &BatchPlan) -> Result<()> {
        if self.in_flight != Some(plan.tick) {
            return Err(CanopyError::InvariantBreak(format!(
                "plan for tick {} is not in flight",
                plan.tick
            )));
        }
        self.in_flight = None;
        Ok(())
    }

    /// Run the invariant checks in debug builds.
    fn after_tick(&self) -> Result<()> {
        if cfg!(debug_assertions) {
            self.check_invariants()?;
        }
        Ok(())
    }

    /// Finish every request with a pending abort.
    fn apply_aborts(&mut self) -> Result<()> {
        let mut aborts: Vec<RequestId> = self.pending_aborts.drain().collect();
        aborts.sort();
        for id in aborts {
            if self.requests.contains_key(&id) {
                self.finish(id, FinishReason::Abort)?;
                self.stats.aborted += 1;
            }
        }
        Ok(())
    }

    /// Append a sampled token, plus any jump-forward tokens, to a request.
    ///
    /// `outstanding` slots stay reserved for requests later in the plan.
    fn advance(&mut self, id: RequestId, sampled: SampledToken, outstanding: usize) -> Result<()> {
        let SampledToken {
            token_id,
            logprob,
            text,
            jump_forward,
        } = sampled;
        let capacity = self.pool.capacity();
        let jumps = match self.requests.get(&id) {
            Some(req) if req.sampling.regex.is_some() && !self.config.disable_regex_jump_forward => {
                jump_forward
            }
            _ => Vec::new(),
        };

        let mut text = text;
        let mut logprob = logprob;
        for (i, token) in std::iter::once(token_id).chain(jumps).enumerate() {
            let forced = i > 0;
            // A forced token takes a slot only if one is spare after eviction.
            if forced && !self.spare_slot(outstanding)? {
                trace!(request = %id, "jump forward truncated");
                break;
            }

            let req = self
                .requests
                .get_mut(&id)
                .ok_or(CanopyError::UnknownRequest(id.0))?;
            let fragment = text.take();
            let reason = req.append_token(token, fragment.as_deref(), self.eos_token_id, capacity);
            self.events.push(RequestEvent {
                request_id: req.group,
                index: req.index,
                kind: EventKind::Token {
                    token_id: token,
                    logprob: logprob.take(),
                    text: fragment,
                },
            });

            if let Some(reason) = reason {
                self.finish(id, reason)?;
                self.stats.finished += 1;
                return Ok(());
            }

            // The token is fed back next step and needs a slot.
            let slot = match self.pool.alloc(1) {
                Ok(slot) => slot,
                Err(_) => {
                    self.tree.evict(1, &mut self.pool)?;
                    self.pool.alloc(1).map_err(|e| {
                        CanopyError::InvariantBreak(format!("reserved decode slot missing: {e}"))
                    })?
                }
            };
            req.owned_slots.extend(slot);
        }
        Ok(())
    }

    /// Whether a slot beyond `reserved` is free, evicting if needed.
    fn spare_slot(&mut self, reserved: usize) -> Result<bool> {
        let target = reserved + 1;
        if self.pool.available() >= target {
            return Ok(true);
        }
        self.tree.evict(target - self.pool.available(), &mut self.pool)?;
        Ok(self.pool.available() >= target)
    }

    /// Release a request after an engine failure.
    fn fail(&mut self, id: RequestId, message: &str) -> Result<()> {
        let req = self.release(id, FinishReason::Error)?;
        self.events.push(RequestEvent {
            request_id: req.group,
            index: req.index,
            kind: EventKind::Error {
                message: message.to_string(),
            },
        });
        self.stats.failed += 1;
        Ok(())
    }

    /// Release a request and emit its finish event.
    fn finish(&mut self, id: RequestId, reason: FinishReason) -> Result<()> {
        let req = self.release(id, reason)?;
        self.events.push(RequestEvent {
            request_id: req.group,
            index: req.index,
            kind: EventKind::Finish {
                reason,
                prompt_tokens: req.input_ids.len(),
                completion_tokens: req.output_ids.len(),
                cached_tokens: req.prefix_indices.len(),
            },
        });
        Ok(())
    }

    /// Drop a request from the queues and settle its slots.
    ///
    /// A running request commits the tokens whose KV was computed to the
    /// prefix cache, frees the rest of its slots and unpins its prefix.
    /// Failed requests commit nothing.
    fn release(&mut self, id: RequestId, reason: FinishReason) -> Result<Request> {
        let mut req = self
            .requests
            .remove(&id)
            .ok_or(CanopyError::UnknownRequest(id.0))?;
        self.waiting.retain(|w| *w != id);
        self.running.retain(|r| *r != id);
        self.pending_aborts.remove(&id);

        if req.state == RequestState::Running {
            let slots = req.all_slots();
            let keep = if reason == FinishReason::Error || req.output_ids.is_empty() {
                req.prefix_indices.len()
            } else {
                req.computed_len.clamp(req.prefix_indices.len(), slots.len())
            };

            if keep > req.prefix_indices.len() {
                let tokens = req.all_tokens();
                let rejected = self.tree.insert(&tokens[..keep], &slots[..keep])?;
                self.pool.free(&rejected)?;
            }
            self.pool.free(&slots[keep..])?;
            self.tree.dec_ref(req.last_node)?;
            req.owned_slots.clear();
        }

        req.state = RequestState::Finished;
        req.finish_reason = Some(reason);
        trace!(request = %id, ?reason, output = req.output_ids.len(), "finished");

        if let Some(samples) = self.groups.get_mut(&req.group) {
            samples.retain(|s| *s != id);
            if samples.is_empty() {
                self.groups.remove(&req.group);
            }
        }
        Ok(req)
    }
}

#[cfg(test)]
mod tests;
