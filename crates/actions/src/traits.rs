//! The dispatch contracts: [`ActionDispatcher`] is what the engine calls,
//! [`ActionHandler`] is what a single `service.action` implements.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::ActionError;

/// A fully resolved call the engine wants performed.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub service: String,
    pub action: String,
    /// Parameters after variable substitution and schema validation.
    pub parameters: Value,
}

impl ActionRequest {
    pub fn new(service: impl Into<String>, action: impl Into<String>, parameters: Value) -> Self {
        Self {
            service: service.into(),
            action: action.into(),
            parameters,
        }
    }

    /// `service.action`, the key handlers are registered under.
    pub fn key(&self) -> String {
        format!("{}.{}", self.service, self.action)
    }
}

/// Per-call context passed alongside every request.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// ID of the current execution run.
    pub execution_id: uuid::Uuid,
    /// The step this call is made on behalf of.
    pub step_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Budget for this single call. The engine enforces it as well.
    pub timeout: Duration,
    /// Fired when the execution is cancelled; long-running handlers should
    /// watch it.
    pub cancel: CancellationToken,
}

impl ActionContext {
    /// A context suitable for calling a handler outside of an engine run.
    pub fn detached(step_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4(),
            step_id: step_id.into(),
            attempt: 1,
            timeout,
            cancel: CancellationToken::new(),
        }
    }
}

/// The capability the engine is constructed with.
///
/// The engine treats it as opaque: whatever third-party call happens behind
/// it, the engine only sees a JSON payload or an [`ActionError`].
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn execute(&self, request: ActionRequest, ctx: &ActionContext)
        -> Result<Value, ActionError>;
}

/// A single `service.action` implementation, registered in an
/// [`ActionRegistry`](crate::ActionRegistry).
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Run the action with its resolved parameters and return its payload.
    async fn call(&self, parameters: Value, ctx: &ActionContext) -> Result<Value, ActionError>;
}
