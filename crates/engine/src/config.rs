//! Engine tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the engine. Loaded from the `[engine]` table of the CLI's
/// TOML config; every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on steps RUNNING at once within one execution.
    pub max_concurrent_steps: usize,
    /// Dispatcher calls per step (first try included), unless the node
    /// overrides it with `maxAttempts`.
    pub max_attempts: u32,
    /// Base delay for exponential back-off between attempts.
    pub retry_base_delay_ms: u64,
    /// Per-call action timeout, unless the node overrides it with `timeoutMs`.
    pub step_timeout_ms: u64,
    /// Deadline for one run segment. Reaching it cancels the execution.
    /// The clock starts when a run starts or resumes, so time spent paused
    /// does not count and each resume gets the full budget.
    pub execution_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 4,
            max_attempts: 3,
            retry_base_delay_ms: 200,
            step_timeout_ms: 30_000,
            execution_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    /// Clamp values that would stall the engine.
    pub fn normalized(mut self) -> Self {
        self.max_concurrent_steps = self.max_concurrent_steps.max(1);
        self.max_attempts = self.max_attempts.max(1);
        self.step_timeout_ms = self.step_timeout_ms.max(1);
        self
    }

    /// Delay before retry number `attempt` (1-based, counting failed
    /// attempts): `base * 2^(attempt-1)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1).min(32));
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms.map(Duration::from_millis)
    }
}
