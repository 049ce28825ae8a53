//! Narrow interfaces the engine drives: where execution state lives and who
//! hears about transitions.
//!
//! The scheduler is the only writer for a given execution, so stores do not
//! need optimistic locking; they only need each call to be atomic.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{NotifyError, StoreError};
use crate::models::WorkflowDefinition;
use crate::state::{ExecutionState, ExecutionStatus, StepRecord, WaitingOn};

// ---------------------------------------------------------------------------
// State store
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a new `PENDING` execution of `definition` and return its ID.
    async fn create_execution(
        &self,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<Uuid, StoreError>;

    async fn get_execution_state(&self, execution_id: Uuid) -> Result<ExecutionState, StoreError>;

    /// The definition the execution was created from.
    async fn get_definition(&self, execution_id: Uuid) -> Result<WorkflowDefinition, StoreError>;

    /// Record a step transition. A `COMPLETED` record's output becomes the
    /// step's entry in `outputs` if none exists yet.
    async fn update_step_status(
        &self,
        execution_id: Uuid,
        step_id: &str,
        record: &StepRecord,
    ) -> Result<(), StoreError>;

    /// Record an execution transition. `error` and `waiting_on` replace the
    /// stored values (`None` clears them).
    async fn update_execution_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
        waiting_on: Option<&WaitingOn>,
    ) -> Result<(), StoreError>;

    /// Overlay `inputs` onto the execution's stored inputs.
    async fn merge_inputs(
        &self,
        execution_id: Uuid,
        inputs: &Map<String, Value>,
    ) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Events emitted while an execution runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted { workflow_id: String },
    ExecutionResumed,
    StepStarted { step_id: String, attempt: u32 },
    StepCompleted { step_id: String, output: Value },
    StepFailed { step_id: String, error: String, fatal: bool },
    StepSkipped { step_id: String },
    StepCancelled { step_id: String },
    ExecutionPaused { waiting_on: WaitingOn },
    ExecutionCompleted,
    ExecutionFailed { error: String },
    ExecutionCancelled { reason: String },
}

/// Receives execution events. Delivery is best-effort: the engine logs a
/// failed `notify` and carries on.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, execution_id: Uuid, event: &ExecutionEvent) -> Result<(), NotifyError>;
}

/// Deliver `event`, logging instead of propagating a failure.
async fn deliver(sink: &dyn NotificationSink, execution_id: Uuid, event: ExecutionEvent) {
    if let Err(err) = sink.notify(execution_id, &event).await {
        warn!(%execution_id, error = %err, "notification sink rejected event");
    }
}

/// Events a run may have queued for its sink before new ones are dropped.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Ordered, non-blocking front for a [`NotificationSink`], one per run.
///
/// A background task drains the queue into the sink, so a slow sink never
/// holds up the run loop or a step. When the queue is full the event is
/// dropped with a warning.
#[derive(Clone)]
pub(crate) struct EventQueue {
    execution_id: Uuid,
    sender: mpsc::Sender<ExecutionEvent>,
}

impl EventQueue {
    /// Start the delivery task. It stops once every clone is dropped and the
    /// backlog is delivered.
    pub fn spawn(sink: Arc<dyn NotificationSink>, execution_id: Uuid) -> Self {
        let (sender, mut receiver) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                deliver(sink.as_ref(), execution_id, event).await;
            }
        });
        Self {
            execution_id,
            sender,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn emit(&self, event: ExecutionEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(execution_id = %self.execution_id, ?event, "notification backlog full, dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                warn!(execution_id = %self.execution_id, ?event, "notification task gone, dropping event");
            }
        }
    }
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl NotificationSink for NoopNotifier {
    async fn notify(&self, _execution_id: Uuid, _event: &ExecutionEvent) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Writes every event to the `tracing` subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn notify(&self, execution_id: Uuid, event: &ExecutionEvent) -> Result<(), NotifyError> {
        match event {
            ExecutionEvent::StepFailed { step_id, error, fatal: true } => {
                error!(%execution_id, %step_id, %error, "step failed")
            }
            ExecutionEvent::StepFailed { step_id, error, fatal: false } => {
                warn!(%execution_id, %step_id, %error, "step failed (continuing)")
            }
            ExecutionEvent::ExecutionFailed { error } => {
                error!(%execution_id, %error, "execution failed")
            }
            other => info!(%execution_id, event = ?other, "execution event"),
        }
        Ok(())
    }
}

/// Forwards events to an unbounded channel for async consumers (UI streams,
/// tests).
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<(Uuid, ExecutionEvent)>,
}

impl ChannelNotifier {
    pub fn new(sender: mpsc::UnboundedSender<(Uuid, ExecutionEvent)>) -> Self {
        Self { sender }
    }

    /// A notifier plus the receiving half of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(Uuid, ExecutionEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelNotifier {
    async fn notify(&self, execution_id: Uuid, event: &ExecutionEvent) -> Result<(), NotifyError> {
        self.sender
            .send((execution_id, event.clone()))
            .map_err(|_| NotifyError("event receiver dropped".to_string()))
    }
}
