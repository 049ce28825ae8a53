//! Row structs that map 1-to-1 onto database tables, and their conversion
//! back into the engine's [`ExecutionState`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use engine::{ExecutionState, ExecutionStatus, StepRecord, StepStatus, WaitingOn, WorkflowDefinition};

use crate::DbError;

// ---------------------------------------------------------------------------
// executions
// ---------------------------------------------------------------------------

/// A persisted execution row.
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub workflow_id: String,
    pub status: String,
    /// The full workflow definition the execution was started with.
    pub definition: Value,
    pub inputs: Value,
    pub error: Option<String>,
    pub waiting_on: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRow {
    pub fn definition(&self) -> Result<WorkflowDefinition, DbError> {
        Ok(serde_json::from_value(self.definition.clone())?)
    }
}

// ---------------------------------------------------------------------------
// step_executions
// ---------------------------------------------------------------------------

/// A persisted step row.
#[derive(Debug, Clone, FromRow)]
pub struct StepExecutionRow {
    pub execution_id: Uuid,
    pub step_id: String,
    pub position: i32,
    pub status: String,
    pub output: Option<Value>,
    pub recorded_output: Option<Value>,
    pub error: Option<String>,
    pub attempts: i32,
    pub updated_at: DateTime<Utc>,
}

impl StepExecutionRow {
    fn record(&self) -> Result<StepRecord, DbError> {
        Ok(StepRecord {
            status: self.status.parse::<StepStatus>().map_err(DbError::Decode)?,
            output: self.output.clone(),
            error: self.error.clone(),
            attempts: u32::try_from(self.attempts).unwrap_or_default(),
        })
    }
}

/// Assemble the engine's view of an execution from its rows.
pub fn into_state(
    execution: ExecutionRow,
    steps: Vec<StepExecutionRow>,
) -> Result<ExecutionState, DbError> {
    let status = execution
        .status
        .parse::<ExecutionStatus>()
        .map_err(DbError::Decode)?;

    let inputs = match execution.inputs {
        Value::Object(map) => map,
        Value::Null => Default::default(),
        other => return Err(DbError::Decode(format!("inputs must be an object, got {other}"))),
    };

    let waiting_on = execution
        .waiting_on
        .map(serde_json::from_value::<WaitingOn>)
        .transpose()?;

    let mut step_records = BTreeMap::new();
    let mut outputs = BTreeMap::new();
    for row in steps {
        if let Some(output) = &row.recorded_output {
            outputs.insert(row.step_id.clone(), output.clone());
        }
        step_records.insert(row.step_id.clone(), row.record()?);
    }

    Ok(ExecutionState {
        execution_id: execution.id,
        workflow_id: execution.workflow_id,
        status,
        steps: step_records,
        outputs,
        inputs,
        error: execution.error,
        waiting_on,
        created_at: execution.created_at,
        updated_at: execution.updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn execution_row(status: &str) -> ExecutionRow {
        ExecutionRow {
            id: Uuid::new_v4(),
            workflow_id: "wf".into(),
            status: status.into(),
            definition: json!({ "id": "wf", "nodes": [], "connections": [] }),
            inputs: json!({ "k": 1 }),
            error: None,
            waiting_on: Some(json!({ "stepId": "b", "missingStepId": "form", "reference": "form.x" })),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn step_row(id: &str, status: &str, recorded: Option<Value>) -> StepExecutionRow {
        StepExecutionRow {
            execution_id: Uuid::new_v4(),
            step_id: id.into(),
            position: 0,
            status: status.into(),
            output: recorded.clone(),
            recorded_output: recorded,
            error: None,
            attempts: 2,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn rows_assemble_into_state() {
        let state = into_state(
            execution_row("PAUSED"),
            vec![
                step_row("a", "COMPLETED", Some(json!({ "v": 1 }))),
                step_row("b", "PENDING", None),
            ],
        )
        .unwrap();

        assert_eq!(state.status, ExecutionStatus::Paused);
        assert_eq!(state.outputs.len(), 1);
        assert_eq!(state.outputs["a"], json!({ "v": 1 }));
        assert_eq!(state.steps["a"].attempts, 2);
        assert_eq!(state.steps["b"].status, StepStatus::Pending);
        assert_eq!(state.inputs["k"], json!(1));
        assert_eq!(state.waiting_on.unwrap().missing_step_id, "form");
    }

    #[test]
    fn unknown_status_is_a_decode_error() {
        let err = into_state(execution_row("EXPLODED"), vec![]).unwrap_err();
        assert!(matches!(err, DbError::Decode(_)));
    }
}
