//! Built-in `core.*` actions.
//!
//! Real service adapters live outside this repository; these exist so a
//! workflow can be run end to end without any of them.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{ActionContext, ActionError, ActionHandler};

/// `core.echo`: returns its parameters unchanged.
pub struct EchoAction;

#[async_trait]
impl ActionHandler for EchoAction {
    async fn call(&self, parameters: Value, _ctx: &ActionContext) -> Result<Value, ActionError> {
        Ok(parameters)
    }
}

/// `core.delay`: sleeps for `ms` milliseconds, then returns `{"sleptMs": ms}`.
pub struct DelayAction;

#[async_trait]
impl ActionHandler for DelayAction {
    async fn call(&self, parameters: Value, ctx: &ActionContext) -> Result<Value, ActionError> {
        let ms = parameters
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| ActionError::Fatal("core.delay requires an integer 'ms'".into()))?;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                Ok(serde_json::json!({ "sleptMs": ms }))
            }
            _ = ctx.cancel.cancelled() => Err(ActionError::Cancelled),
        }
    }
}

/// `core.fail`: always fails with `message`; `retryable: true` makes the
/// failure transient.
pub struct FailAction;

#[async_trait]
impl ActionHandler for FailAction {
    async fn call(&self, parameters: Value, _ctx: &ActionContext) -> Result<Value, ActionError> {
        let message = parameters
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("core.fail invoked")
            .to_string();

        if parameters.get("retryable").and_then(Value::as_bool) == Some(true) {
            Err(ActionError::Retryable(message))
        } else {
            Err(ActionError::Fatal(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ActionContext {
        ActionContext::detached("t", Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn delay_sleeps_and_reports() {
        let out = DelayAction.call(json!({ "ms": 250 }), &ctx()).await.unwrap();
        assert_eq!(out, json!({ "sleptMs": 250 }));
    }

    #[tokio::test]
    async fn delay_without_ms_is_fatal() {
        let err = DelayAction.call(json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ActionError::Fatal(_)));
    }

    #[tokio::test]
    async fn delay_observes_cancellation() {
        let ctx = ctx();
        ctx.cancel.cancel();
        let err = DelayAction.call(json!({ "ms": 60_000 }), &ctx).await.unwrap_err();
        assert_eq!(err, ActionError::Cancelled);
    }

    #[tokio::test]
    async fn fail_honours_retryable_flag() {
        let err = FailAction
            .call(json!({ "message": "flaky", "retryable": true }), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err, ActionError::Retryable("flaky".into()));

        let err = FailAction.call(json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ActionError::Fatal(_)));
    }
}
