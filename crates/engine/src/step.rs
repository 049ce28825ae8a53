//! Running a single step: resolve, validate, dispatch with retries.
//!
//! Preparation is synchronous and reads the execution state; invocation is
//! the only part that runs off the scheduler loop, so it owns everything it
//! needs and never touches state.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use actions::{ActionContext, ActionDispatcher, ActionError, ActionRequest};

use crate::config::EngineConfig;
use crate::dag::WorkflowGraph;
use crate::error::{EngineError, MissingInputError, SchemaTarget};
use crate::models::StepKind;
use crate::ports::{EventQueue, ExecutionEvent};
use crate::resolver::resolve_parameters;
use crate::schema::{validate_optional, ObjectSchema};
use crate::state::{ExecutionState, StepResult};

/// What running a step amounts to once its inputs are known.
#[derive(Debug, Clone)]
pub enum StepWork {
    /// Call the action dispatcher.
    Dispatch {
        request: ActionRequest,
        timeout: Duration,
        max_attempts: u32,
        output_schema: Option<ObjectSchema>,
    },
    /// The payload is already known (triggers, condition nodes).
    Immediate(Value),
}

#[derive(Debug, Clone)]
pub struct PreparedStep {
    pub index: usize,
    pub step_id: String,
    pub work: StepWork,
}

/// Result of preparing a step against the current state.
#[derive(Debug)]
pub enum Preparation {
    Ready(PreparedStep),
    /// A referenced value is not available yet.
    Paused(MissingInputError),
    /// The step cannot run (input schema violation).
    Failed(EngineError),
}

/// What a finished step task hands back to the scheduler.
#[derive(Debug)]
pub struct StepOutcome {
    pub index: usize,
    pub step_id: String,
    pub attempts: u32,
    /// `None` when the execution was cancelled before the step finished.
    pub result: Option<StepResult>,
}

#[derive(Clone)]
pub struct StepExecutor {
    dispatcher: Arc<dyn ActionDispatcher>,
    config: EngineConfig,
}

impl StepExecutor {
    pub fn new(dispatcher: Arc<dyn ActionDispatcher>, config: EngineConfig) -> Self {
        Self { dispatcher, config }
    }

    /// Resolve parameters and check the input schema of node `index`.
    pub fn prepare(&self, graph: &WorkflowGraph, index: usize, state: &ExecutionState) -> Preparation {
        let node = graph.node(index);
        let step_id = node.id.clone();

        let work = match &node.kind {
            StepKind::Trigger(cfg) => {
                let params = match resolve_parameters(&cfg.parameters, state) {
                    Ok(p) => p,
                    Err(missing) => return Preparation::Paused(missing),
                };
                let mut payload: Map<String, Value> = state.inputs.clone();
                if let Value::Object(params) = params {
                    payload.extend(params);
                }
                StepWork::Immediate(Value::Object(payload))
            }

            StepKind::Condition(_) => {
                let result = graph
                    .node_condition(index)
                    .is_some_and(|c| c.evaluate(state));
                StepWork::Immediate(json!({ "result": result }))
            }

            StepKind::Action(cfg) => {
                let params = match resolve_parameters(&cfg.parameters, state) {
                    Ok(p) => p,
                    Err(missing) => return Preparation::Paused(missing),
                };
                if let Err(err) =
                    validate_optional(cfg.input_schema.as_ref(), &step_id, SchemaTarget::Input, &params)
                {
                    return Preparation::Failed(err.into());
                }
                StepWork::Dispatch {
                    request: ActionRequest::new(&cfg.service, &cfg.action, params),
                    timeout: cfg
                        .timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or_else(|| self.config.step_timeout()),
                    max_attempts: cfg.max_attempts.unwrap_or(self.config.max_attempts).max(1),
                    output_schema: cfg.output_schema.clone(),
                }
            }
        };

        Preparation::Ready(PreparedStep {
            index,
            step_id,
            work,
        })
    }

    /// Run a prepared step to completion, retrying retryable action errors
    /// with exponential back-off.
    pub(crate) async fn invoke(
        &self,
        prepared: PreparedStep,
        events: EventQueue,
        cancel: CancellationToken,
    ) -> StepOutcome {
        let PreparedStep { index, step_id, work } = prepared;

        let (attempts, result) = match work {
            StepWork::Immediate(payload) => {
                events.emit(ExecutionEvent::StepStarted {
                    step_id: step_id.clone(),
                    attempt: 1,
                });
                (1, Ok(payload))
            }
            StepWork::Dispatch {
                request,
                timeout,
                max_attempts,
                output_schema,
            } => {
                let (attempts, result) = self
                    .dispatch_with_retry(
                        &step_id,
                        request,
                        timeout,
                        max_attempts,
                        &events,
                        &cancel,
                    )
                    .await;
                let result = result.and_then(|payload| {
                    validate_optional(output_schema.as_ref(), &step_id, SchemaTarget::Output, &payload)
                        .map(|()| payload)
                        .map_err(EngineError::from)
                });
                (attempts, result)
            }
        };

        let result = match result {
            Ok(payload) => Some(StepResult::Success { payload }),
            Err(EngineError::Cancelled) => None,
            Err(err) => Some(StepResult::Failure {
                error: err.to_string(),
            }),
        };

        StepOutcome {
            index,
            step_id,
            attempts,
            result,
        }
    }

    // -----------------------------------------------------------------------
    // Internal: dispatch a single request with retry logic.
    // -----------------------------------------------------------------------

    async fn dispatch_with_retry(
        &self,
        step_id: &str,
        request: ActionRequest,
        timeout: Duration,
        max_attempts: u32,
        events: &EventQueue,
        cancel: &CancellationToken,
    ) -> (u32, Result<Value, EngineError>) {
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            events.emit(ExecutionEvent::StepStarted {
                step_id: step_id.to_owned(),
                attempt: attempts,
            });

            let ctx = ActionContext {
                execution_id: events.execution_id(),
                step_id: step_id.to_owned(),
                attempt: attempts,
                timeout,
                cancel: cancel.child_token(),
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ActionError::Cancelled),
                res = tokio::time::timeout(timeout, self.dispatcher.execute(request.clone(), &ctx)) => {
                    match res {
                        Ok(inner) => inner,
                        Err(_) => Err(ActionError::Timeout(timeout)),
                    }
                }
            };

            let err = match outcome {
                Ok(payload) => {
                    debug!(step_id, attempts, "action succeeded");
                    return (attempts, Ok(payload));
                }
                Err(ActionError::Cancelled) => return (attempts, Err(EngineError::Cancelled)),
                Err(err) => err,
            };

            if !err.is_retryable() || attempts >= max_attempts {
                return (
                    attempts,
                    Err(EngineError::ActionExecution {
                        step_id: step_id.to_owned(),
                        attempts,
                        source: err,
                    }),
                );
            }

            let delay = self.config.retry_delay(attempts);
            warn!(
                "step '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                step_id, attempts, max_attempts, delay, err
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return (attempts, Err(EngineError::Cancelled)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
