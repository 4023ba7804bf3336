//! Retry policy for transient action failures (§4.7 step 7, §7 `ActionFailed`).
//!
//! Generalized from the teacher's `convenient_bitbake::executor::retry::RetryPolicy`: capped
//! exponential backoff plus per-kind retryability, with the same `no_retry`/`conservative`/
//! `aggressive` presets. The scheduler dispatches on raw OS threads rather than Tokio tasks,
//! so only the teacher's synchronous retry shape (`execute_with_retry_sync`, a blocking
//! `std::thread::sleep` between attempts) carries over here — there is no async variant.

use std::time::Duration;

use builder_core::config::RetryConfig;

/// Coarse classification of why an attempt failed, used to decide retryability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The action's command ran and exited non-zero.
    ActionFailed(i32),
    /// A sandbox resource limit (CPU, wall time, memory, FDs) was hit.
    SandboxLimitExceeded,
    /// The sandbox itself could not be constructed or torn down cleanly; not the action's fault.
    SandboxFatal,
    /// A cache or filesystem I/O error, distinct from the action's own exit status.
    CacheOrIo,
}

/// Exponential backoff with per-kind retryability, evaluated before every retry attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts per action, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub initial_backoff: Duration,
    /// Backoff ceiling; the exponential curve never exceeds this.
    pub max_backoff: Duration,
    /// Multiplier applied to the backoff after each failed attempt.
    pub backoff_multiplier: f64,
    /// Whether cache/filesystem I/O failures are retried.
    pub retry_on_io_error: bool,
    /// Whether resource-limit failures are retried.
    pub retry_on_limit_exceeded: bool,
    /// Whether a non-zero exit classified as transient is retried.
    pub retry_on_action_failure: bool,
}

impl RetryPolicy {
    /// Never retries; the first attempt is final.
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
            retry_on_io_error: false,
            retry_on_limit_exceeded: false,
            retry_on_action_failure: false,
        }
    }

    /// A modest retry budget for everyday builds: 3 attempts, 1s-60s backoff.
    pub fn conservative() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            retry_on_io_error: true,
            retry_on_limit_exceeded: true,
            retry_on_action_failure: true,
        }
    }

    /// A wider retry budget for flaky remote-dependent actions: 6 attempts, 500ms-120s backoff.
    pub fn aggressive() -> Self {
        RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(120),
            backoff_multiplier: 2.5,
            retry_on_io_error: true,
            retry_on_limit_exceeded: true,
            retry_on_action_failure: true,
        }
    }

    /// Whether a failure of `kind` should be retried, independent of attempts remaining.
    pub fn should_retry(&self, kind: FailureKind) -> bool {
        match kind {
            FailureKind::ActionFailed(code) => {
                self.retry_on_action_failure && Self::is_transient_exit(code)
            }
            FailureKind::SandboxLimitExceeded => self.retry_on_limit_exceeded,
            FailureKind::SandboxFatal => false,
            FailureKind::CacheOrIo => self.retry_on_io_error,
        }
    }

    /// Exit codes treated as transient rather than a deterministic action bug: a `timeout`(1)
    /// wrapper exit, SIGKILL (often an OOM kill), and SIGINT. Anything else is assumed to be a
    /// reproducible failure in the action itself and is never retried.
    fn is_transient_exit(code: i32) -> bool {
        matches!(code, 124 | 130 | 137)
    }

    /// Backoff duration before attempt `next_attempt` (1-based: the delay before attempt 2 is
    /// `backoff_duration(1)`). Attempt 0 or 1 is always `Duration::ZERO` — there is no delay
    /// before the first try.
    pub fn backoff_duration(&self, attempts_made: u32) -> Duration {
        if attempts_made == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_backoff.as_millis() as f64;
        let scaled = base * self.backoff_multiplier.powi(attempts_made as i32 - 1);
        let capped = scaled.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::conservative()
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            backoff_multiplier: config.backoff_multiplier,
            retry_on_io_error: true,
            retry_on_limit_exceeded: true,
            retry_on_action_failure: true,
        }
    }
}
