//! The per-execution run loop.
//!
//! One [`Scheduler`] drives one execution from `RUNNING` to a stop point.
//! It is the single writer for that execution: step tasks only compute, and
//! every state transition is applied here, mirrored to the store and
//! queued for the notifier.
//!
//! Readiness is tracked per connection. Each edge is undecided until its
//! source settles, then active or inactive. Only an edge out of a COMPLETED
//! source can be active. A node is decided once all of its incoming edges
//! are: it runs when every unconditional edge is active and, if it has
//! conditional edges, at least one of those is active. Otherwise it is
//! skipped, which deactivates its own outgoing edges.
//!
//! The execution deadline covers one run segment. A resumed execution gets
//! the full budget again; time spent paused does not count.

use std::collections::{HashSet, VecDeque};
use std::future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dag::WorkflowGraph;
use crate::ports::{EventQueue, ExecutionEvent, StateStore};
use crate::state::{
    ExecutionState, ExecutionStatus, StepRecord, StepResult, StepStatus, WaitingOn,
};
use crate::step::{Preparation, StepExecutor, StepOutcome};

/// Where a run stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Paused(WaitingOn),
    Failed(String),
    Cancelled(String),
}

impl RunOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Completed => ExecutionStatus::Completed,
            Self::Paused(_) => ExecutionStatus::Paused,
            Self::Failed(_) => ExecutionStatus::Failed,
            Self::Cancelled(_) => ExecutionStatus::Cancelled,
        }
    }
}

/// Why dispatching stopped early.
#[derive(Debug)]
enum Halt {
    Paused(WaitingOn),
    Failed(String),
}

/// Everything a run needs besides its state.
#[derive(Clone)]
pub(crate) struct RunContext {
    pub graph: Arc<WorkflowGraph>,
    pub store: Arc<dyn StateStore>,
    pub events: EventQueue,
    pub steps: StepExecutor,
    pub config: EngineConfig,
    pub cancel: CancellationToken,
}

pub(crate) struct Scheduler {
    ctx: RunContext,
    execution_id: Uuid,
    /// Local mirror of the stored state; this loop is its only writer.
    state: ExecutionState,
    /// `None` until the edge's source settles.
    edge_active: Vec<Option<bool>>,
    ready: VecDeque<usize>,
    queued: Vec<bool>,
    running: HashSet<usize>,
    halt: Option<Halt>,
    timed_out: bool,
    /// Whether any connection carries a condition. Without one, a node is
    /// ready exactly when all of its predecessors completed.
    conditional: bool,
}

impl Scheduler {
    pub fn new(ctx: RunContext, state: ExecutionState) -> Self {
        let n = ctx.graph.len();
        let edges = ctx.graph.edges().len();
        let conditional = ctx.graph.has_conditional_edges();
        Self {
            execution_id: state.execution_id,
            ctx,
            state,
            edge_active: vec![None; edges],
            ready: VecDeque::new(),
            queued: vec![false; n],
            running: HashSet::new(),
            halt: None,
            timed_out: false,
            conditional,
        }
    }

    /// Drive the execution until it completes, pauses, fails or is
    /// cancelled, and record the final status.
    #[instrument(skip(self), fields(execution_id = %self.execution_id))]
    pub async fn run(mut self) -> RunOutcome {
        self.set_status(ExecutionStatus::Running, None, None).await;
        self.seed().await;

        let deadline = self.ctx.config.execution_timeout().map(|t| Instant::now() + t);
        let mut join_set: JoinSet<StepOutcome> = JoinSet::new();

        loop {
            self.dispatch(&mut join_set).await;

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                joined = join_set.join_next() => match joined {
                    Some(Ok(outcome)) => self.complete(outcome).await,
                    Some(Err(join_err)) => {
                        error!(error = %join_err, "step task failed to join");
                        self.fail(format!("step task aborted: {join_err}"));
                    }
                    None => break,
                },
                _ = wait_for(deadline), if !self.timed_out => {
                    warn!("execution timed out; cancelling in-flight steps");
                    self.timed_out = true;
                    self.ctx.cancel.cancel();
                }
            }
        }

        let outcome = self.finish().await;
        info!(status = %outcome.status(), "execution stopped");
        outcome
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    /// Compute edge state and the initial ready set from whatever the
    /// stored state already holds (nothing on a fresh run).
    async fn seed(&mut self) {
        let graph = Arc::clone(&self.ctx.graph);

        // A step left RUNNING by an interrupted run starts over.
        for node in graph.nodes() {
            if self.state.step_status(&node.id) == StepStatus::Running {
                self.record_step(&node.id, StepRecord::pending()).await;
            }
        }

        for e in 0..graph.edges().len() {
            let source = graph.edge(e).source;
            if self.state.step_status(&graph.node(source).id).is_settled() {
                self.edge_active[e] = Some(self.activates(e));
            }
        }

        let mut worklist: VecDeque<usize> = graph.topological_order().iter().copied().collect();
        self.decide(&mut worklist).await;
    }

    /// Whether edge `e` is active, given that its source has settled. A
    /// FAILED source never activates its edges, `continueOnError` or not:
    /// it has no output for its dependents to read.
    fn activates(&self, e: usize) -> bool {
        let edge = self.ctx.graph.edge(e);
        let source = self.ctx.graph.node(edge.source);
        if self.state.step_status(&source.id) != StepStatus::Completed {
            return false;
        }
        if !self.conditional {
            return true;
        }
        edge.condition.as_ref().map_or(true, |c| c.evaluate(&self.state))
    }

    /// `Some(run)` once every incoming edge of `node` is decided.
    fn readiness(&self, node: usize) -> Option<bool> {
        let graph = &self.ctx.graph;
        let incoming = graph.incoming(node);

        if !self.conditional {
            let mut all_active = true;
            for &e in incoming {
                all_active &= self.edge_active[e]?;
            }
            return Some(all_active);
        }

        let mut unconditional_ok = true;
        let mut has_conditional = false;
        let mut conditional_ok = false;
        for &e in incoming {
            let active = self.edge_active[e]?;
            if graph.edge(e).is_conditional() {
                has_conditional = true;
                conditional_ok |= active;
            } else {
                unconditional_ok &= active;
            }
        }
        Some(unconditional_ok && (!has_conditional || conditional_ok))
    }

    /// Decide every node in `worklist` whose incoming edges are all known.
    /// Skips cascade through the worklist.
    async fn decide(&mut self, worklist: &mut VecDeque<usize>) {
        let graph = Arc::clone(&self.ctx.graph);

        while let Some(node) = worklist.pop_front() {
            let step_id = &graph.node(node).id;
            if self.queued[node] || self.state.step_status(step_id) != StepStatus::Pending {
                continue;
            }

            let Some(runs) = self.readiness(node) else {
                continue;
            };

            if runs {
                self.queued[node] = true;
                self.ready.push_back(node);
                continue;
            }

            info!(step_id = %step_id, "skipping step: predecessors did not activate it");
            self.record_step(
                step_id,
                StepRecord {
                    status: StepStatus::Skipped,
                    ..StepRecord::pending()
                },
            )
            .await;
            self.emit(ExecutionEvent::StepSkipped {
                step_id: step_id.clone(),
            });

            for &e in graph.outgoing(node) {
                self.edge_active[e] = Some(false);
                worklist.push_back(graph.edge(e).target);
            }
        }
    }

    /// Evaluate the outgoing edges of a node that just settled and decide
    /// its successors.
    async fn settle(&mut self, node: usize) {
        let graph = Arc::clone(&self.ctx.graph);
        let mut worklist = VecDeque::new();
        for &e in graph.outgoing(node) {
            self.edge_active[e] = Some(self.activates(e));
            worklist.push_back(graph.edge(e).target);
        }
        self.decide(&mut worklist).await;
    }

    // -----------------------------------------------------------------------
    // Dispatch and completion
    // -----------------------------------------------------------------------

    fn dispatching(&self) -> bool {
        self.halt.is_none() && !self.ctx.cancel.is_cancelled()
    }

    /// Start ready steps until the concurrency cap is reached.
    async fn dispatch(&mut self, join_set: &mut JoinSet<StepOutcome>) {
        let graph = Arc::clone(&self.ctx.graph);

        while self.dispatching() && join_set.len() < self.ctx.config.max_concurrent_steps {
            let Some(node) = self.ready.pop_front() else {
                break;
            };
            self.queued[node] = false;
            let step_id = graph.node(node).id.clone();

            match self.ctx.steps.prepare(&graph, node, &self.state) {
                Preparation::Ready(prepared) => {
                    self.record_step(
                        &step_id,
                        StepRecord {
                            status: StepStatus::Running,
                            ..StepRecord::pending()
                        },
                    )
                    .await;
                    self.running.insert(node);

                    let steps = self.ctx.steps.clone();
                    let events = self.ctx.events.clone();
                    let cancel = self.ctx.cancel.clone();
                    join_set.spawn(async move { steps.invoke(prepared, events, cancel).await });
                }

                Preparation::Paused(missing) => {
                    info!(step_id = %step_id, missing = %missing, "pausing: input not available");
                    self.halt = Some(Halt::Paused(WaitingOn {
                        step_id,
                        missing_step_id: missing.step_id,
                        reference: missing.reference,
                    }));
                }

                Preparation::Failed(err) => {
                    self.step_failed(node, 0, err.to_string()).await;
                }
            }
        }
    }

    async fn complete(&mut self, outcome: StepOutcome) {
        let StepOutcome {
            index,
            step_id,
            attempts,
            result,
        } = outcome;
        self.running.remove(&index);

        match result {
            Some(StepResult::Success { payload: output }) => {
                info!(step_id = %step_id, attempts, "step completed");
                self.record_step(
                    &step_id,
                    StepRecord {
                        status: StepStatus::Completed,
                        output: Some(output.clone()),
                        error: None,
                        attempts,
                    },
                )
                .await;
                self.emit(ExecutionEvent::StepCompleted { step_id, output });
                self.settle(index).await;
            }

            Some(StepResult::Failure { error }) => self.step_failed(index, attempts, error).await,

            None => {
                info!(step_id = %step_id, "step cancelled");
                self.record_step(
                    &step_id,
                    StepRecord {
                        status: StepStatus::Cancelled,
                        output: None,
                        error: Some("execution cancelled".to_string()),
                        attempts,
                    },
                )
                .await;
                self.emit(ExecutionEvent::StepCancelled { step_id });
            }
        }
    }

    async fn step_failed(&mut self, node: usize, attempts: u32, message: String) {
        let graph = Arc::clone(&self.ctx.graph);
        let step = graph.node(node);
        let fatal = !step.continues_on_error();

        if fatal {
            error!(step_id = %step.id, error = %message, "step failed");
        } else {
            warn!(step_id = %step.id, error = %message, "step failed; continuing on error");
        }

        self.record_step(
            &step.id,
            StepRecord {
                status: StepStatus::Failed,
                output: None,
                error: Some(message.clone()),
                attempts,
            },
        )
        .await;
        self.emit(ExecutionEvent::StepFailed {
            step_id: step.id.clone(),
            error: message.clone(),
            fatal,
        });

        if fatal {
            self.fail(message);
        } else {
            self.settle(node).await;
        }
    }

    /// The first fatal error wins and overrides a pending pause.
    fn fail(&mut self, message: String) {
        if !matches!(self.halt, Some(Halt::Failed(_))) {
            self.halt = Some(Halt::Failed(message));
        }
    }

    // -----------------------------------------------------------------------
    // Final status
    // -----------------------------------------------------------------------

    async fn finish(&mut self) -> RunOutcome {
        // Tasks that never reported back (panicked) are failures.
        let graph = Arc::clone(&self.ctx.graph);
        for node in std::mem::take(&mut self.running) {
            let step_id = &graph.node(node).id;
            self.record_step(
                step_id,
                StepRecord {
                    status: StepStatus::Failed,
                    output: None,
                    error: Some("step task did not complete".to_string()),
                    attempts: 0,
                },
            )
            .await;
        }

        let unfinished = self.state.steps.values().any(|r| !r.status.is_settled());

        let outcome = match self.halt.take() {
            Some(Halt::Failed(message)) => RunOutcome::Failed(message),
            _ if self.ctx.cancel.is_cancelled() && unfinished => RunOutcome::Cancelled(
                if self.timed_out {
                    "execution timed out".to_string()
                } else {
                    "execution cancelled".to_string()
                },
            ),
            Some(Halt::Paused(waiting_on)) => RunOutcome::Paused(waiting_on),
            None => RunOutcome::Completed,
        };

        match &outcome {
            RunOutcome::Completed => {
                self.set_status(ExecutionStatus::Completed, None, None).await;
                self.emit(ExecutionEvent::ExecutionCompleted);
            }
            RunOutcome::Paused(waiting_on) => {
                self.set_status(ExecutionStatus::Paused, None, Some(waiting_on)).await;
                self.emit(ExecutionEvent::ExecutionPaused {
                    waiting_on: waiting_on.clone(),
                });
            }
            RunOutcome::Failed(message) => {
                self.set_status(ExecutionStatus::Failed, Some(message), None).await;
                self.emit(ExecutionEvent::ExecutionFailed {
                    error: message.clone(),
                });
            }
            RunOutcome::Cancelled(reason) => {
                self.set_status(ExecutionStatus::Cancelled, Some(reason), None).await;
                self.emit(ExecutionEvent::ExecutionCancelled {
                    reason: reason.clone(),
                });
            }
        }

        outcome
    }

    // -----------------------------------------------------------------------
    // Port writes. Failures are logged and never change the run.
    // -----------------------------------------------------------------------

    async fn record_step(&mut self, step_id: &str, record: StepRecord) {
        if let Err(err) = self
            .ctx
            .store
            .update_step_status(self.execution_id, step_id, &record)
            .await
        {
            warn!(step_id, error = %err, "failed to persist step status");
        }
        self.state.apply_step(step_id, record);
    }

    async fn set_status(
        &mut self,
        status: ExecutionStatus,
        error: Option<&str>,
        waiting_on: Option<&WaitingOn>,
    ) {
        if let Err(err) = self
            .ctx
            .store
            .update_execution_status(self.execution_id, status, error, waiting_on)
            .await
        {
            warn!(%status, error = %err, "failed to persist execution status");
        }
        self.state.status = status;
        self.state.error = error.map(str::to_string);
        self.state.waiting_on = waiting_on.cloned();
        self.state.touch();
    }

    fn emit(&self, event: ExecutionEvent) {
        self.ctx.events.emit(event);
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => future::pending::<()>().await,
    }
}
