//! Respawn policy for supervised units

use std::time::Duration;

/// Whether, when and how often a unit's process is started again after it exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespawnPolicy {
    pub enabled: bool,
    pub delay: Option<Duration>,
    /// Maximum number of respawns, negative for unlimited
    pub max_retries: i64,
    retries: u64,
}

impl RespawnPolicy {
    pub fn new(enabled: bool, delay: Option<Duration>, max_retries: i64) -> Self {
        Self {
            enabled,
            delay,
            max_retries,
            retries: 0,
        }
    }

    /// Respawns performed so far
    pub fn retries(&self) -> u64 {
        self.retries
    }

    fn budget_left(&self) -> bool {
        self.max_retries < 0 || self.retries < self.max_retries as u64
    }

    /// Whether the policy would allow another respawn
    fn would_respawn(&self) -> bool {
        self.enabled && self.budget_left()
    }

    /// Consume one retry if allowed. Returns false when respawn is disabled
    /// or the budget is exhausted.
    pub fn try_consume(&mut self) -> bool {
        if !self.would_respawn() {
            return false;
        }
        self.retries += 1;
        true
    }

    /// Delay to wait before respawning, if any
    pub fn effective_delay(&self) -> Option<Duration> {
        self.delay.filter(|d| !d.is_zero())
    }
}
