//! Per-tick batch planning: decode reservation, retraction and admission.

use super::{Request, RequestId, RequestState, Scheduler};
use crate::cache::{RadixCache, SlotPool};
use crate::error::{CanopyError, Result};
use std::collections::HashSet;
use tracing::{trace, warn};

/// Consecutive memory-blocked admissions before a request is reported.
const EVICTION_WARN_AFTER: u32 = 8;

/// Point `req` at the longest cached prefix of all but its last token.
///
/// At least one token is always left for the engine to compute.
fn match_request(tree: &mut RadixCache, req: &mut Request) {
    let tokens = req.all_tokens();
    let hit = tree.match_prefix(&tokens[..tokens.len().saturating_sub(1)]);
    req.prefix_indices = hit.slots;
    req.last_node = hit.last_node;
}

/// Free slots until `pool` has `target` available, evicting from `tree`.
fn make_room(tree: &mut RadixCache, pool: &mut SlotPool, target: usize) -> Result<bool> {
    let available = pool.available();
    if available >= target {
        return Ok(true);
    }
    tree.evict(target - available, pool)?;
    Ok(pool.available() >= target)
}

impl Scheduler {
    /// Refresh prefix matches of the waiting queue.
    ///
    /// Requests that were never admitted are matched against the current
    /// tree. Retracted requests keep their prefix unless its node is gone.
    pub(super) fn match_waiting(&mut self) {
        for id in &self.waiting {
            let Some(req) = self.requests.get_mut(id) else {
                continue;
            };
            let stale = !self.tree.contains(req.last_node);
            if req.state == RequestState::Waiting || stale {
                match_request(&mut self.tree, req);
            }
        }
    }

    /// Keep running requests within R and reserve one slot per request.
    ///
    /// Evicts unpinned cache first, then retracts running requests.
    /// Returns the decode set and the ids retracted on the way.
    pub(super) fn plan_decode(&mut self) -> Result<(Vec<RequestId>, HashSet<RequestId>)> {
        let mut retracted = HashSet::new();
        let limit = self.config.max_running_requests;

        loop {
            let need = self.running.len();
            let fits = need <= limit && make_room(&mut self.tree, &mut self.pool, need)?;
            if fits {
                break;
            }

            let Some(victim) = self.pick_victim() else {
                return Err(CanopyError::InvariantBreak(format!(
                    "retraction cannot free {need} slots: {} available, nothing running",
                    self.pool.available()
                )));
            };
            self.retract(victim)?;
            retracted.insert(victim);
        }

        Ok((self.running.clone(), retracted))
    }

    /// Running request with the most owned slots, newest admission first
    /// on ties, then higher id.
    fn pick_victim(&self) -> Option<RequestId> {
        self.running
            .iter()
            .filter_map(|id| self.requests.get(id))
            .max_by_key(|r| (r.owned_slots.len(), r.admitted_seq, r.id))
            .map(|r| r.id)
    }

    /// Move a running request back to the waiting queue.
    ///
    /// Owned slots go back to the pool. The prefix stays on the record but
    /// is no longer pinned.
    pub(super) fn retract(&mut self, id: RequestId) -> Result<()> {
        let req = self
            .requests
            .get_mut(&id)
            .ok_or(CanopyError::UnknownRequest(id.0))?;

        let owned = std::mem::take(&mut req.owned_slots);
        self.pool.free(&owned)?;
        self.tree.dec_ref(req.last_node)?;
        req.state = RequestState::Retracted;
        req.computed_len = 0;
        req.retractions += 1;

        warn!(
            request = %id,
            freed_slots = owned.len(),
            prefix = req.prefix_indices.len(),
            output = req.output_ids.len(),
            "retracting running request"
        );

        let arrival = req.arrival_seq;
        self.running.retain(|r| *r != id);
        let pos = self
            .waiting
            .iter()
            .position(|w| self.requests.get(w).is_some_and(|r| r.arrival_seq > arrival))
            .unwrap_or(self.waiting.len());
        self.waiting.insert(pos, id);
        self.stats.retractions += 1;
        Ok(())
    }

    /// Admit waiting requests in policy order against the prefill budget,
    /// the running limit and free KV memory.
    ///
    /// `reserved` slots are already promised to the decode set.
    pub(super) fn admit(
        &mut self,
        reserved: usize,
        skip: &HashSet<RequestId>,
    ) -> Result<Vec<RequestId>> {
        let refs: Vec<&Request> = self
            .waiting
            .iter()
            .filter(|id| !skip.contains(id))
            .filter_map(|id| self.requests.get(id))
            .collect();
        let ids: Vec<RequestId> = refs.iter().map(|r| r.id).collect();
        let order = self.prioritizer.order(&refs, &self.tree)?;

        let limit = self.config.max_running_requests;
        let mut remaining = self.config.prefill_budget();
        let mut admitted = Vec::new();

        for id in order.into_iter().map(|i| ids[i]) {
            if self.running.len() + admitted.len() >= limit {
                break;
            }
            let Some(req) = self.requests.get_mut(&id) else {
                continue;
            };
            if !self.tree.contains(req.last_node) {
                match_request(&mut self.tree, req);
            }

            let extend = req.kv_need();
            let oversized = extend > remaining;
            if oversized && !admitted.is_empty() {
                break;
            }

            // Pin before evicting so the prefix cannot be evicted for itself.
            self.tree.inc_ref(req.last_node)?;
            let target = extend + 1 + reserved + admitted.len();
            if !make_room(&mut self.tree, &mut self.pool, target)? {
                self.tree.dec_ref(req.last_node)?;
                req.eviction_failures += 1;
                if req.eviction_failures % EVICTION_WARN_AFTER == 0 {
                    let err = CanopyError::EvictionExhausted {
                        needed: target,
                        available: self.pool.available(),
                    };
                    warn!(
                        request = %id,
                        attempts = req.eviction_failures,
                        error = %err,
                        "admission keeps failing for lack of kv memory"
                    );
                }
                continue;
            }

            req.owned_slots = self.pool.alloc(extend)?;
            req.state = RequestState::Running;
            req.computed_len = req.prefix_indices.len();
            req.admitted_seq = Some(self.next_admission);
            req.eviction_failures = 0;
            self.next_admission += 1;

            self.stats.cache_hit_tokens += req.prefix_indices.len() as u64;
            self.stats.prefill_tokens += extend as u64;
            trace!(
                request = %id,
                prefix = req.prefix_indices.len(),
                extend,
                oversized,
                "admitted"
            );

            admitted.push(id);
            if oversized {
                break;
            }
            remaining -= extend;
        }

        self.waiting.retain(|id| !admitted.contains(id));
        self.running.extend_from_slice(&admitted);
        Ok(admitted)
    }
}
