//! Execution state: the durable record of one workflow run.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::WorkflowDefinition;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle of a whole execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING"   => Ok(Self::Pending),
            "RUNNING"   => Ok(Self::Running),
            "PAUSED"    => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED"    => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other       => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Lifecycle of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    /// Interrupted in flight by cancellation.
    Cancelled,
}

impl StepStatus {
    /// The step will not run (again) in this execution.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING"   => Ok(Self::Pending),
            "RUNNING"   => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED"    => Ok(Self::Failed),
            "SKIPPED"   => Ok(Self::Skipped),
            "CANCELLED" => Ok(Self::Cancelled),
            other       => Err(format!("unknown step status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Per-step entry in [`ExecutionState::steps`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Dispatcher calls made for this step.
    #[serde(default)]
    pub attempts: u32,
}

impl StepRecord {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            output: None,
            error: None,
            attempts: 0,
        }
    }
}

/// What a finished step produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StepResult {
    Success { payload: Value },
    Failure { error: String },
}

/// Why a paused execution is waiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingOn {
    /// The step whose parameters could not be resolved.
    pub step_id: String,
    /// The step (or input) id the unresolved reference starts from. Supplying
    /// an input under this id unblocks the step.
    pub missing_step_id: String,
    /// The full reference, e.g. `customer.email`.
    pub reference: String,
}

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub steps: BTreeMap<String, StepRecord>,
    /// Written once per step, when it completes. Read by the resolver.
    pub outputs: BTreeMap<String, Value>,
    /// Values supplied at start or on resume.
    pub inputs: Map<String, Value>,
    /// The first fatal error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_on: Option<WaitingOn>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    /// A fresh `PENDING` state with every step `PENDING`.
    pub fn new(
        execution_id: Uuid,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            workflow_id: definition.id.clone(),
            status: ExecutionStatus::Pending,
            steps: definition
                .nodes
                .iter()
                .map(|n| (n.id.clone(), StepRecord::pending()))
                .collect(),
            outputs: BTreeMap::new(),
            inputs,
            error: None,
            waiting_on: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Resolve the root of a `${root.path}` reference: a step output first,
    /// then a supplied input.
    pub fn lookup(&self, root: &str) -> Option<&Value> {
        self.outputs.get(root).or_else(|| self.inputs.get(root))
    }

    pub fn step_status(&self, step_id: &str) -> StepStatus {
        self.steps
            .get(step_id)
            .map(|r| r.status)
            .unwrap_or(StepStatus::Pending)
    }

    /// Apply a step record. A `COMPLETED` record's output is copied into
    /// `outputs` unless an output for that step already exists.
    pub fn apply_step(&mut self, step_id: &str, record: StepRecord) {
        if record.status == StepStatus::Completed {
            if let Some(output) = &record.output {
                self.outputs
                    .entry(step_id.to_string())
                    .or_insert_with(|| output.clone());
            }
        }
        self.steps.insert(step_id.to_string(), record);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
