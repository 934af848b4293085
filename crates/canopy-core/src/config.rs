//! Scheduler configuration.

use crate::error::{CanopyError, Result};
use crate::scheduler::SchedulePolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Typed configuration for the scheduler.
///
/// Unknown keys are rejected at parse time; missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Maximum number of running requests (R).
    pub max_running_requests: usize,
    /// Prefill token budget per tick (P).
    pub max_prefill_tokens: usize,
    /// KV pool capacity in slots (K).
    pub max_total_tokens: usize,
    /// Admission ordering.
    pub schedule_heuristic: SchedulePolicy,
    /// Divisor on the prefill budget; values above 1 admit less per tick.
    pub schedule_conservativeness: f64,
    /// Turn the prefix cache into an empty tree.
    pub disable_radix_cache: bool,
    /// Ignore multi-token jumps from regex constraints.
    pub disable_regex_jump_forward: bool,
    /// Seed for the `random` policy. Drawn at startup when absent.
    pub random_seed: Option<u64>,
    /// Longest allowed `input + max_new_tokens`.
    pub context_length: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_running_requests: 256,
            max_prefill_tokens: 4096,
            max_total_tokens: 32768,
            schedule_heuristic: SchedulePolicy::Lpm,
            schedule_conservativeness: 1.0,
            disable_radix_cache: false,
            disable_regex_jump_forward: false,
            random_seed: None,
            context_length: None,
        }
    }
}

impl SchedulerConfig {
    /// Check that the budgets are usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_running_requests == 0 {
            return Err(CanopyError::InvalidConfig(
                "max_running_requests must be at least 1".into(),
            ));
        }
        if self.max_prefill_tokens == 0 {
            return Err(CanopyError::InvalidConfig(
                "max_prefill_tokens must be at least 1".into(),
            ));
        }
        if self.max_total_tokens < 2 {
            return Err(CanopyError::InvalidConfig(format!(
                "max_total_tokens {} leaves no room for a prompt and its first token",
                self.max_total_tokens
            )));
        }
        let c = self.schedule_conservativeness;
        if !c.is_finite() || c <= 0.0 {
            return Err(CanopyError::InvalidConfig(format!(
                "schedule_conservativeness {c} must be positive"
            )));
        }
        if self.context_length == Some(0) {
            return Err(CanopyError::InvalidConfig(
                "context_length must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Prefill tokens admitted per tick after applying conservativeness.
    pub fn prefill_budget(&self) -> usize {
        let scaled = (self.max_prefill_tokens as f64 / self.schedule_conservativeness).floor();
        (scaled as usize).max(1)
    }

    /// The configured seed, or a fresh one.
    pub fn seed(&self) -> u64 {
        self.random_seed.unwrap_or_else(rand::random)
    }

    /// Parse from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}
