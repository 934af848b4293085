//! Scheduling policies.

use super::Request;
use crate::cache::{NodeId, RadixCache};
use crate::error::{CanopyError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::str::FromStr;

/// Admission order over the waiting queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulePolicy {
    /// Longest cached prefix first.
    #[default]
    #[serde(rename = "lpm")]
    Lpm,
    /// First-come, first-served.
    #[serde(rename = "fcfs")]
    Fcfs,
    /// Longest requested output first.
    #[serde(rename = "lof")]
    Lof,
    /// Seeded uniform shuffle.
    #[serde(rename = "random")]
    Random,
    /// Depth-first walk of the prefix cache, heavier subtrees first.
    #[serde(rename = "dfs-weight")]
    DfsWeight,
}

impl SchedulePolicy {
    /// All policies.
    pub const ALL: [SchedulePolicy; 5] = [
        Self::Lpm,
        Self::Fcfs,
        Self::Lof,
        Self::Random,
        Self::DfsWeight,
    ];

    /// Wire name of the policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lpm => "lpm",
            Self::Fcfs => "fcfs",
            Self::Lof => "lof",
            Self::Random => "random",
            Self::DfsWeight => "dfs-weight",
        }
    }
}

impl std::fmt::Display for SchedulePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulePolicy {
    type Err = CanopyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| CanopyError::InvalidConfig(format!("unknown schedule heuristic: {s}")))
    }
}

/// Orders the waiting queue once per tick.
#[derive(Debug, Clone)]
pub struct Prioritizer {
    /// Policy in effect after fallbacks.
    policy: SchedulePolicy,
    /// Generator for the `random` policy, seeded once.
    rng: StdRng,
}

impl Prioritizer {
    /// Create a prioritizer. `lpm` falls back to `fcfs` without a prefix cache.
    pub fn new(policy: SchedulePolicy, seed: u64, cache_disabled: bool) -> Self {
        let policy = match policy {
            SchedulePolicy::Lpm if cache_disabled => SchedulePolicy::Fcfs,
            other => other,
        };
        Self {
            policy,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Policy in effect.
    pub fn policy(&self) -> SchedulePolicy {
        self.policy
    }

    /// Return a permutation of `0..waiting.len()` in admission order.
    ///
    /// `waiting` must be in arrival order.
    pub fn order(&mut self, waiting: &[&Request], tree: &RadixCache) -> Result<Vec<usize>> {
        let mut order: Vec<usize> = (0..waiting.len()).collect();

        match self.policy {
            SchedulePolicy::Fcfs => {}
            SchedulePolicy::Lpm => {
                order.sort_by_key(|&i| Reverse(waiting[i].prefix_indices.len()));
            }
            SchedulePolicy::Lof => {
                order.sort_by_key(|&i| Reverse(waiting[i].sampling.max_new_tokens));
            }
            SchedulePolicy::Random => order.shuffle(&mut self.rng),
            SchedulePolicy::DfsWeight => order = dfs_weight_order(waiting, tree),
        }

        if order.len() != waiting.len() {
            return Err(CanopyError::InvariantBreak(format!(
                "{} policy ordered {} of {} waiting requests",
                self.policy,
                order.len(),
                waiting.len()
            )));
        }
        Ok(order)
    }
}

/// Group requests by `last_node`, weigh each subtree by its request count
/// and emit a post-order walk visiting heavier children first.
fn dfs_weight_order(waiting: &[&Request], tree: &RadixCache) -> Vec<usize> {
    let mut groups: HashMap<NodeId, Vec<usize>> = HashMap::new();
    for (i, req) in waiting.iter().enumerate() {
        // A node evicted since matching counts as the root.
        let node = if tree.contains(req.last_node) {
            req.last_node
        } else {
            NodeId::ROOT
        };
        groups.entry(node).or_default().push(i);
    }

    let mut weight: HashMap<NodeId, usize> = HashMap::new();
    let mut kids: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for (&node, members) in &groups {
        let mut current = node;
        loop {
            let w = weight.entry(current).or_insert(0);
            let first_visit = *w == 0;
            *w += members.len();
            let Some(parent) = tree.parent(current) else {
                break;
            };
            if first_visit {
                kids.entry(parent).or_default().push(current);
            }
            current = parent;
        }
    }
    for children in kids.values_mut() {
        children.sort_by_key(|c| {
            let w = weight.get(c).copied().unwrap_or(0);
            (Reverse(w), tree.creation_seq(*c).unwrap_or(u64::MAX), *c)
        });
    }

    let mut order = Vec::with_capacity(waiting.len());
    let mut stack = vec![(NodeId::ROOT, false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            if let Some(members) = groups.get(&node) {
                order.extend_from_slice(members);
            }
            continue;
        }
        stack.push((node, true));
        if let Some(children) = kids.get(&node) {
            stack.extend(children.iter().rev().map(|c| (*c, false)));
        }
    }
    order
}
