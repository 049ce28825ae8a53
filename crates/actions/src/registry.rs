//! The default [`ActionDispatcher`]: a map from
//! `service.action` to a handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::builtin::{DelayAction, EchoAction, FailAction};
use crate::{ActionContext, ActionDispatcher, ActionError, ActionHandler, ActionRequest};

/// Maps `service.action` keys to handler implementations.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the `core.*` built-ins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("core", "echo", EchoAction);
        registry.register("core", "delay", DelayAction);
        registry.register("core", "fail", FailAction);
        registry
    }

    /// Register `handler` for `service.action`, replacing any previous one.
    pub fn register(
        &mut self,
        service: &str,
        action: &str,
        handler: impl ActionHandler + 'static,
    ) -> &mut Self {
        self.handlers
            .insert(format!("{service}.{action}"), Arc::new(handler));
        self
    }

    pub fn contains(&self, service: &str, action: &str) -> bool {
        self.handlers.contains_key(&format!("{service}.{action}"))
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ActionDispatcher for ActionRegistry {
    async fn execute(
        &self,
        request: ActionRequest,
        ctx: &ActionContext,
    ) -> Result<Value, ActionError> {
        let handler = self
            .handlers
            .get(&request.key())
            .ok_or_else(|| ActionError::NotRegistered {
                service: request.service.clone(),
                action: request.action.clone(),
            })?;

        debug!(step_id = %ctx.step_id, action = %request.key(), attempt = ctx.attempt, "dispatching action");
        handler.call(request.parameters, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let registry = ActionRegistry::with_builtins();
        let ctx = ActionContext::detached("s1", Duration::from_secs(1));

        let out = registry
            .execute(ActionRequest::new("core", "echo", json!({ "a": 1 })), &ctx)
            .await
            .expect("echo should succeed");

        assert_eq!(out, json!({ "a": 1 }));
    }

    #[tokio::test]
    async fn unknown_action_is_not_registered() {
        let registry = ActionRegistry::new();
        let ctx = ActionContext::detached("s1", Duration::from_secs(1));

        let err = registry
            .execute(ActionRequest::new("slack", "post", json!({})), &ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, ActionError::NotRegistered { ref service, .. } if service == "slack"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn keys_are_sorted() {
        let registry = ActionRegistry::with_builtins();
        assert_eq!(registry.keys(), vec!["core.delay", "core.echo", "core.fail"]);
        assert!(registry.contains("core", "echo"));
    }
}
