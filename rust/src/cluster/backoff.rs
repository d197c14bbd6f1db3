use std::time::Duration;

use super::config::ClusterConfig;

// ---------------------------------------------------------------------------
// Reconnect backoff: additive/multiplicative growth clamped by a per-retry cap
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub incremental_interval_ms: u64,
    pub incremental_rate: f64,
    pub fixed_interval_ms: u64,
    pub fixed_per_retry_interval_ms: u64,
    pub max_interval_ms: u64,
    pub minimum_retries: u32,
    pub max_unreachable_ms: u64,
}

impl BackoffPolicy {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            incremental_interval_ms: config.reconnect_incremental_interval_ms,
            incremental_rate: config.reconnect_incremental_rate,
            fixed_interval_ms: config.reconnect_fixed_interval_ms,
            fixed_per_retry_interval_ms: config.reconnect_fixed_per_retry_interval_ms,
            max_interval_ms: config.reconnect_max_interval_ms,
            minimum_retries: config.reconnect_minimum_retries,
            max_unreachable_ms: config
                .reconnect_max_time_ms
                .max(config.pipe_heartbeat_timeout_ms),
        }
    }
}

/// Per-connection backoff state. Both terms are kept: the delay grows by a
/// fixed step plus a fraction of itself, and is clamped by a cap that itself
/// grows linearly with the retry count up to `max_interval_ms`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconnectBackoff {
    delaying_ms: u64,
    retries: u32,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failed attempt and return the delay before the next one.
    pub fn next_delay(&mut self, policy: &BackoffPolicy) -> Duration {
        let grown = self.delaying_ms as f64
            + policy.incremental_interval_ms as f64
            + self.delaying_ms as f64 * policy.incremental_rate;
        self.retries = self.retries.saturating_add(1);
        let cap = policy
            .fixed_interval_ms
            .saturating_add(policy.fixed_per_retry_interval_ms.saturating_mul(self.retries as u64))
            .min(policy.max_interval_ms);
        self.delaying_ms = (grown as u64).min(cap);
        Duration::from_millis(self.delaying_ms)
    }

    pub fn reset(&mut self) {
        self.delaying_ms = 0;
        self.retries = 0;
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delaying_ms)
    }

    /// True when the connection should be removed instead of rescheduled.
    /// Both a retry floor and an elapsed-time ceiling must be exceeded so a
    /// clock jump alone cannot remove a connection.
    pub fn should_give_up(
        &self,
        policy: &BackoffPolicy,
        since_last_heartbeat_ms: u64,
        always_retry: bool,
    ) -> bool {
        !always_retry
            && since_last_heartbeat_ms > policy.max_unreachable_ms
            && self.retries > policy.minimum_retries
    }
}
