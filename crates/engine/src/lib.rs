//! `engine` crate: workflow models, graph validation, variable resolution
//! and the concurrent execution engine.

pub mod condition;
pub mod config;
pub mod dag;
pub mod error;
pub mod executor;
pub mod memory;
pub mod models;
pub mod ports;
pub mod resolver;
pub mod scheduler;
pub mod schema;
pub mod state;
pub mod step;

pub use config::EngineConfig;
pub use dag::{validate_dag, WorkflowGraph};
pub use error::{
    EngineError, GraphError, MissingInputError, NotifyError, SchemaValidationError, StoreError,
};
pub use executor::WorkflowEngine;
pub use memory::MemoryStateStore;
pub use models::{Connection, Node, NodeType, StepKind, WorkflowDefinition};
pub use ports::{
    ChannelNotifier, ExecutionEvent, NoopNotifier, NotificationSink, StateStore, TracingNotifier,
};
pub use scheduler::RunOutcome;
pub use schema::{ObjectSchema, ValueKind};
pub use state::{ExecutionState, ExecutionStatus, StepRecord, StepResult, StepStatus, WaitingOn};
