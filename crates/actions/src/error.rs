//! Action-level error type.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by an action dispatch.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable` and `Timeout`: the call is attempted again after a back-off.
/// - anything else: the step fails immediately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Transient failure; the engine should re-try the call.
    #[error("retryable action error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal action error: {0}")]
    Fatal(String),

    /// No handler is registered for the requested `service.action`.
    #[error("no handler registered for '{service}.{action}'")]
    NotRegistered { service: String, action: String },

    /// The call did not finish within its per-call timeout.
    #[error("action timed out after {0:?}")]
    Timeout(Duration),

    /// The call was abandoned because the execution was cancelled.
    #[error("action cancelled")]
    Cancelled,
}

impl ActionError {
    /// Whether the engine may attempt the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_) | Self::Timeout(_))
    }
}
