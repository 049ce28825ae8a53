//! Workflow execution engine.
//!
//! `WorkflowEngine` is the public entry point:
//! 1. Validates the graph before anything is persisted.
//! 2. Creates the execution in the [`StateStore`] and spawns a
//!    [`Scheduler`](crate::scheduler) task to drive it.
//! 3. Tracks active runs so they can be cancelled or awaited.
//! 4. Resumes paused runs once the missing values are supplied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use actions::ActionDispatcher;

use crate::config::EngineConfig;
use crate::dag::WorkflowGraph;
use crate::error::EngineError;
use crate::memory::MemoryStateStore;
use crate::models::WorkflowDefinition;
use crate::ports::{EventQueue, ExecutionEvent, NoopNotifier, NotificationSink, StateStore};
use crate::scheduler::{RunContext, Scheduler};
use crate::state::{ExecutionState, ExecutionStatus};
use crate::step::StepExecutor;

// ---------------------------------------------------------------------------
// Active runs
// ---------------------------------------------------------------------------

/// Handle to a scheduler task that has not stopped yet.
struct ActiveRun {
    cancel: CancellationToken,
    /// `None` while running; the stop status once the scheduler returns.
    done: watch::Receiver<Option<ExecutionStatus>>,
}

/// Exclusive right to drive one execution, held from the moment a caller
/// commits to running it until its scheduler is spawned or it gives up.
struct RunClaim {
    execution_id: Uuid,
    cancel: CancellationToken,
    done: watch::Sender<Option<ExecutionStatus>>,
}

struct EngineInner {
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn NotificationSink>,
    steps: StepExecutor,
    config: EngineConfig,
    runs: Mutex<HashMap<Uuid, ActiveRun>>,
}

impl EngineInner {
    fn runs(&self) -> MutexGuard<'_, HashMap<Uuid, ActiveRun>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Runs workflow executions in the background.
///
/// Cheap to clone; all clones share the same store, notifier and run table.
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(
        dispatcher: Arc<dyn ActionDispatcher>,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn NotificationSink>,
        config: EngineConfig,
    ) -> Self {
        let config = config.normalized();
        Self {
            inner: Arc::new(EngineInner {
                steps: StepExecutor::new(dispatcher, config.clone()),
                store,
                notifier,
                config,
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// An engine backed by a [`MemoryStateStore`] with no notifications.
    pub fn in_memory(dispatcher: Arc<dyn ActionDispatcher>, config: EngineConfig) -> Self {
        Self::new(
            dispatcher,
            Arc::new(MemoryStateStore::new()),
            Arc::new(NoopNotifier),
            config,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Validate `definition`, persist a new execution and start running it
    /// in the background.
    ///
    /// # Errors
    /// [`EngineError::GraphDefinition`] before anything is persisted if the
    /// graph is malformed; [`EngineError::Store`] if the execution cannot be
    /// created.
    #[instrument(skip_all, fields(workflow_id = %definition.id))]
    pub async fn start_execution(
        &self,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<Uuid, EngineError> {
        let graph = WorkflowGraph::build(definition)?;
        info!(
            "graph validated, {} steps in order: {:?}",
            graph.len(),
            graph.topological_ids()
        );

        let execution_id = self.inner.store.create_execution(definition, inputs).await?;
        let claim = self.claim(execution_id).map_err(|_| EngineError::InvalidState {
            execution_id,
            status: ExecutionStatus::Running,
            expected: "PENDING",
        })?;

        let state = match self.inner.store.get_execution_state(execution_id).await {
            Ok(state) => state,
            Err(err) => {
                self.release(claim);
                return Err(err.into());
            }
        };

        self.launch(
            claim,
            graph,
            state,
            ExecutionEvent::ExecutionStarted {
                workflow_id: definition.id.clone(),
            },
        );
        info!(%execution_id, "execution started");
        Ok(execution_id)
    }

    /// Merge `inputs` into a `PAUSED` execution and continue it.
    ///
    /// Only one caller can resume a given pause. The run is claimed before
    /// the store is read, so a concurrent resume sees it as `RUNNING`.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] for an unknown ID and
    /// [`EngineError::InvalidState`] unless the execution is paused.
    #[instrument(skip(self, inputs))]
    pub async fn resume_execution(
        &self,
        execution_id: Uuid,
        inputs: Map<String, Value>,
    ) -> Result<(), EngineError> {
        let claim = self.claim(execution_id).map_err(|_| EngineError::InvalidState {
            execution_id,
            status: ExecutionStatus::Running,
            expected: "PAUSED",
        })?;

        match self.prepare_resume(execution_id, &inputs).await {
            Ok((graph, state)) => {
                self.launch(claim, graph, state, ExecutionEvent::ExecutionResumed);
                info!("execution resumed with {} new input(s)", inputs.len());
                Ok(())
            }
            Err(err) => {
                self.release(claim);
                Err(err)
            }
        }
    }

    /// Cancel an execution. A running execution stops dispatching and its
    /// in-flight action calls are cancelled; a paused one is cancelled
    /// directly.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] for an unknown ID and
    /// [`EngineError::InvalidState`] if the execution already stopped for
    /// good.
    #[instrument(skip(self))]
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let claim = match self.claim(execution_id) {
            Ok(claim) => claim,
            Err(active) => {
                info!("cancelling running execution");
                active.cancel();
                return Ok(());
            }
        };

        let result = self.cancel_idle(execution_id).await;
        self.release(claim);
        result
    }

    pub async fn get_execution_state(&self, execution_id: Uuid) -> Result<ExecutionState, EngineError> {
        Ok(self.inner.store.get_execution_state(execution_id).await?)
    }

    /// Wait until the execution reaches a stop point (terminal or paused)
    /// and return its state. Returns immediately if it is not running.
    pub async fn wait_for_execution(&self, execution_id: Uuid) -> Result<ExecutionState, EngineError> {
        let done = self
            .inner
            .runs()
            .get(&execution_id)
            .map(|run| run.done.clone());

        if let Some(mut done) = done {
            // An Err means the scheduler task went away; the store has the
            // last recorded state either way.
            let _ = done.wait_for(Option::is_some).await;
        }

        self.get_execution_state(execution_id).await
    }

    /// Start an execution and wait for it to stop.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<ExecutionState, EngineError> {
        let execution_id = self.start_execution(definition, inputs).await?;
        self.wait_for_execution(execution_id).await
    }

    async fn prepare_resume(
        &self,
        execution_id: Uuid,
        inputs: &Map<String, Value>,
    ) -> Result<(WorkflowGraph, ExecutionState), EngineError> {
        let current = self.inner.store.get_execution_state(execution_id).await?;
        if current.status != ExecutionStatus::Paused {
            return Err(EngineError::InvalidState {
                execution_id,
                status: current.status,
                expected: "PAUSED",
            });
        }

        let definition = self.inner.store.get_definition(execution_id).await?;
        let graph = WorkflowGraph::build(&definition)?;

        self.inner.store.merge_inputs(execution_id, inputs).await?;
        let state = self.inner.store.get_execution_state(execution_id).await?;
        Ok((graph, state))
    }

    async fn cancel_idle(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let state = self.inner.store.get_execution_state(execution_id).await?;
        if state.status.is_terminal() {
            return Err(EngineError::InvalidState {
                execution_id,
                status: state.status,
                expected: "PENDING, RUNNING or PAUSED",
            });
        }

        info!(status = %state.status, "cancelling idle execution");
        let reason = "execution cancelled";
        self.inner
            .store
            .update_execution_status(execution_id, ExecutionStatus::Cancelled, Some(reason), None)
            .await?;
        EventQueue::spawn(Arc::clone(&self.inner.notifier), execution_id).emit(
            ExecutionEvent::ExecutionCancelled {
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal: the run table.
    // -----------------------------------------------------------------------

    /// Register `execution_id` as active. Fails with the existing run's
    /// cancel token if something already holds it. Must stay synchronous:
    /// the check and the insert happen under one lock.
    fn claim(&self, execution_id: Uuid) -> Result<RunClaim, CancellationToken> {
        let mut runs = self.inner.runs();
        if let Some(active) = runs.get(&execution_id) {
            return Err(active.cancel.clone());
        }

        let cancel = CancellationToken::new();
        let (done, done_rx) = watch::channel(None);
        runs.insert(
            execution_id,
            ActiveRun {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );
        Ok(RunClaim {
            execution_id,
            cancel,
            done,
        })
    }

    /// Give a claim back without running anything. Waiters wake up and
    /// read the store.
    fn release(&self, claim: RunClaim) {
        self.inner.runs().remove(&claim.execution_id);
    }

    /// Hand a claimed run to its own scheduler task.
    fn launch(
        &self,
        claim: RunClaim,
        graph: WorkflowGraph,
        state: ExecutionState,
        first: ExecutionEvent,
    ) {
        let RunClaim {
            execution_id,
            cancel,
            done,
        } = claim;

        let events = EventQueue::spawn(Arc::clone(&self.inner.notifier), execution_id);
        events.emit(first);

        let ctx = RunContext {
            graph: Arc::new(graph),
            store: Arc::clone(&self.inner.store),
            events,
            steps: self.inner.steps.clone(),
            config: self.inner.config.clone(),
            cancel,
        };
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let outcome = Scheduler::new(ctx, state).run().await;
            // Deregister before waking waiters so a woken waiter can resume
            // a paused run straight away.
            inner.runs().remove(&execution_id);
            done.send_replace(Some(outcome.status()));
        });
    }
}
