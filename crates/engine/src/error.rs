//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use actions::ActionError;

use crate::state::ExecutionStatus;

/// A malformed workflow graph. Always raised before any step runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The definition has no nodes at all.
    #[error("workflow has no nodes")]
    EmptyWorkflow,

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// A connection references a node ID that doesn't exist in the workflow.
    #[error("connection #{connection} references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
        connection: usize,
    },

    /// Topological sort detected a cycle; `node_id` is one node on it.
    #[error("workflow graph contains a cycle through node '{node_id}'")]
    CycleDetected { node_id: String },

    /// A node's configuration does not fit its type.
    #[error("node '{node_id}' is invalid: {reason}")]
    InvalidNode { node_id: String, reason: String },

    /// A condition expression could not be parsed.
    #[error("invalid condition on {location}: {reason}")]
    InvalidCondition { location: String, reason: String },
}

/// A `${...}` reference that could not be resolved against execution state.
///
/// Not fatal: the scheduler pauses the execution until the value is supplied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unresolved reference '${{{reference}}}': no value for step '{step_id}'{}", at_path(.path))]
pub struct MissingInputError {
    /// The step (or input) id the reference starts from.
    pub step_id: String,
    /// The full reference text, without the `${` `}` delimiters.
    pub reference: String,
    /// The part of the path that could not be walked; empty when the step
    /// itself has no value.
    pub path: String,
}

fn at_path(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!(" at '{path}'")
    }
}

/// Which side of a step a schema check ran against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaTarget {
    Input,
    Output,
}

impl std::fmt::Display for SchemaTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// One reason a value failed its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    Missing(String),
    WrongType {
        field: String,
        expected: String,
        found: &'static str,
    },
    NotAnObject {
        found: &'static str,
    },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(field) => write!(f, "missing required field '{field}'"),
            Self::WrongType {
                field,
                expected,
                found,
            } => write!(f, "field '{field}' should be {expected}, found {found}"),
            Self::NotAnObject { found } => write!(f, "expected an object, found {found}"),
        }
    }
}

/// Parameters or output violate a declared schema. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{target} schema validation failed for step '{step_id}': {}", join(.violations))]
pub struct SchemaValidationError {
    pub step_id: String,
    pub target: SchemaTarget,
    pub violations: Vec<Violation>,
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures reported by a [`StateStore`](crate::ports::StateStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("execution {0} not found")]
    NotFound(Uuid),

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("state store backend error: {0}")]
    Backend(String),
}

/// Failures reported by a [`NotificationSink`](crate::ports::NotificationSink).
/// Logged, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------
    #[error("invalid workflow definition: {0}")]
    GraphDefinition(#[from] GraphError),

    // ------ Step errors ------
    #[error(transparent)]
    MissingInput(#[from] MissingInputError),

    #[error(transparent)]
    SchemaValidation(#[from] SchemaValidationError),

    /// The action call failed and retries (if any) were exhausted.
    #[error("step '{step_id}' failed after {attempts} attempt(s): {source}")]
    ActionExecution {
        step_id: String,
        attempts: u32,
        #[source]
        source: ActionError,
    },

    #[error("execution cancelled")]
    Cancelled,

    // ------ Entry-point errors ------
    #[error("execution {0} not found")]
    NotFound(Uuid),

    #[error("execution {execution_id} is {status}, expected {expected}")]
    InvalidState {
        execution_id: Uuid,
        status: ExecutionStatus,
        expected: &'static str,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_input_names_the_step() {
        let err = MissingInputError {
            step_id: "missing".into(),
            reference: "missing.output".into(),
            path: String::new(),
        };
        let msg = err.to_string();
        assert!(msg.contains("missing"));
        assert!(msg.contains("${missing.output}"), "{msg}");
    }

    #[test]
    fn schema_error_lists_every_violation() {
        let err = SchemaValidationError {
            step_id: "send".into(),
            target: SchemaTarget::Input,
            violations: vec![
                Violation::Missing("to".into()),
                Violation::WrongType {
                    field: "count".into(),
                    expected: "integer".into(),
                    found: "string",
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("input schema validation failed for step 'send'"));
        assert!(msg.contains("missing required field 'to'"));
        assert!(msg.contains("field 'count' should be integer, found string"));
    }

    #[test]
    fn store_not_found_maps_to_engine_not_found() {
        let id = Uuid::new_v4();
        assert!(matches!(EngineError::from(StoreError::NotFound(id)), EngineError::NotFound(x) if x == id));
    }
}
