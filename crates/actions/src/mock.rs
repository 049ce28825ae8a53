//! Scripted test double for [`ActionDispatcher`].
//!
//! Useful in unit and integration tests where real service adapters are
//! either unavailable or irrelevant. Behaviour is configured per
//! `service.action`; every call is recorded along with how many calls were
//! in flight at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{ActionContext, ActionDispatcher, ActionError, ActionRequest};

/// What the mock does when a given `service.action` is dispatched.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return the request parameters.
    Echo,
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with `Retryable` for the first `failures` calls, then return `then`.
    FlakyThen { failures: usize, then: Value },
    /// Sleep for `delay` (or until cancelled), then return the parameters.
    Delayed(Duration),
}

/// A call the mock received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub step_id: String,
    pub attempt: u32,
    pub request: ActionRequest,
}

/// A mock dispatcher that records every call it receives and returns a
/// programmer-specified result.
pub struct MockDispatcher {
    behaviours: HashMap<String, MockBehaviour>,
    fallback: MockBehaviour,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for MockDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDispatcher {
    /// A mock that echoes parameters for every action.
    pub fn new() -> Self {
        Self {
            behaviours: HashMap::new(),
            fallback: MockBehaviour::Echo,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Configure the behaviour for `service.action`.
    pub fn on(mut self, service: &str, action: &str, behaviour: MockBehaviour) -> Self {
        self.behaviours
            .insert(format!("{service}.{action}"), behaviour);
        self
    }

    /// Behaviour for every action without an explicit one.
    pub fn otherwise(mut self, behaviour: MockBehaviour) -> Self {
        self.fallback = behaviour;
        self
    }

    /// All calls received, in call order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock_calls().clone()
    }

    /// Total number of calls received.
    pub fn call_count(&self) -> usize {
        self.lock_calls().len()
    }

    /// Number of calls made on behalf of `step_id`.
    pub fn calls_for(&self, step_id: &str) -> usize {
        self.lock_calls()
            .iter()
            .filter(|c| c.step_id == step_id)
            .count()
    }

    /// The highest number of calls that were in flight simultaneously.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock_calls(&self) -> MutexGuard<'_, Vec<RecordedCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the call and return how many earlier calls hit the same key.
    fn record(&self, request: &ActionRequest, ctx: &ActionContext) -> usize {
        let mut calls = self.lock_calls();
        let key = request.key();
        let previous = calls.iter().filter(|c| c.request.key() == key).count();
        calls.push(RecordedCall {
            step_id: ctx.step_id.clone(),
            attempt: ctx.attempt,
            request: request.clone(),
        });
        previous
    }
}

/// Decrements the in-flight counter when the call ends, however it ends.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ActionDispatcher for MockDispatcher {
    async fn execute(
        &self,
        request: ActionRequest,
        ctx: &ActionContext,
    ) -> Result<Value, ActionError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let previous = self.record(&request, ctx);
        let behaviour = self
            .behaviours
            .get(&request.key())
            .unwrap_or(&self.fallback)
            .clone();

        match behaviour {
            MockBehaviour::Echo => Ok(request.parameters),
            MockBehaviour::ReturnValue(v) => Ok(v),
            MockBehaviour::FailRetryable(msg) => Err(ActionError::Retryable(msg)),
            MockBehaviour::FailFatal(msg) => Err(ActionError::Fatal(msg)),
            MockBehaviour::FlakyThen { failures, then } => {
                if previous < failures {
                    Err(ActionError::Retryable(format!(
                        "transient failure {} of {failures}",
                        previous + 1
                    )))
                } else {
                    Ok(then)
                }
            }
            MockBehaviour::Delayed(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(request.parameters),
                    _ = ctx.cancel.cancelled() => Err(ActionError::Cancelled),
                }
            }
        }
    }
}
