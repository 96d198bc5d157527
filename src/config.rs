//! Configuration types.

use std::time::Duration;

use crate::breaker::BreakerConfig;

/// Pipeline configuration. Component-specific config (spool source, SMTP,
/// stage service endpoints) lives next to the component it configures.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of executor workers claiming tasks concurrently.
    pub worker_count: usize,
    /// Retry budget per task.
    pub max_attempts: u32,
    /// Fixed delay before a failed task becomes claimable again.
    pub retry_delay: Duration,
    /// Upper bound of the random jitter added to `retry_delay`.
    pub retry_jitter: Duration,
    /// Hard wall-clock limit for a single handler execution.
    pub task_timeout: Duration,
    /// Classification confidence below this routes to review.
    pub review_threshold: f64,
    /// Worker sleep between empty claim attempts.
    pub claim_idle_sleep: Duration,
    /// How far a task is deferred when its dependency's breaker is open.
    /// Deferral does not count as an attempt.
    pub breaker_defer: Duration,
    /// Running tasks older than this are presumed orphaned by a crashed
    /// worker and released back into the retry path.
    pub stale_running_after: Duration,
    /// Shared breaker tuning, applied to every registered dependency.
    pub breaker: BreakerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_attempts: 3,
            retry_delay: Duration::from_secs(60),
            retry_jitter: Duration::from_secs(15),
            task_timeout: Duration::from_secs(120),
            review_threshold: 0.7,
            claim_idle_sleep: Duration::from_millis(500),
            breaker_defer: Duration::from_secs(5),
            stale_running_after: Duration::from_secs(600),
            breaker: BreakerConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Build config from environment variables, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let worker_count: usize = std::env::var("MAILROOM_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.worker_count);

        let max_attempts: u32 = std::env::var("MAILROOM_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_attempts);

        let retry_delay_secs: u64 = std::env::var("MAILROOM_RETRY_DELAY_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.retry_delay.as_secs());

        let retry_jitter_secs: u64 = std::env::var("MAILROOM_RETRY_JITTER_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.retry_jitter.as_secs());

        let task_timeout_secs: u64 = std::env::var("MAILROOM_TASK_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.task_timeout.as_secs());

        let review_threshold: f64 = std::env::var("MAILROOM_REVIEW_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.review_threshold);

        let claim_idle_sleep_ms: u64 = std::env::var("MAILROOM_CLAIM_IDLE_SLEEP_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.claim_idle_sleep.as_millis() as u64);

        let breaker_defer_secs: u64 = std::env::var("MAILROOM_BREAKER_DEFER_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.breaker_defer.as_secs());

        let stale_running_secs: u64 = std::env::var("MAILROOM_STALE_RUNNING_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.stale_running_after.as_secs());

        let failure_threshold: u32 = std::env::var("MAILROOM_BREAKER_FAILURES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.breaker.failure_threshold);

        let recovery_secs: u64 = std::env::var("MAILROOM_BREAKER_RECOVERY_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.breaker.recovery_timeout.as_secs());

        Self {
            worker_count,
            max_attempts,
            retry_delay: Duration::from_secs(retry_delay_secs),
            retry_jitter: Duration::from_secs(retry_jitter_secs),
            task_timeout: Duration::from_secs(task_timeout_secs),
            review_threshold,
            claim_idle_sleep: Duration::from_millis(claim_idle_sleep_ms),
            breaker_defer: Duration::from_secs(breaker_defer_secs),
            stale_running_after: Duration::from_secs(stale_running_secs),
            breaker: BreakerConfig {
                failure_threshold,
                recovery_timeout: Duration::from_secs(recovery_secs),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert!(config.worker_count >= 1);
        assert!(config.review_threshold > 0.0 && config.review_threshold < 1.0);
        assert!(config.retry_delay >= config.retry_jitter);
        assert!(config.task_timeout > Duration::ZERO);
    }
}
