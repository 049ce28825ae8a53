//! In-process [`StateStore`]. The default when no database is configured;
//! state is lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::WorkflowDefinition;
use crate::ports::StateStore;
use crate::state::{ExecutionState, ExecutionStatus, StepRecord, WaitingOn};

#[derive(Debug)]
struct Entry {
    definition: WorkflowDefinition,
    state: ExecutionState,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    executions: Arc<RwLock<HashMap<Uuid, Entry>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executions.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_execution(
        &self,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let entry = Entry {
            definition: definition.clone(),
            state: ExecutionState::new(id, definition, inputs),
        };
        self.executions.write().await.insert(id, entry);
        Ok(id)
    }

    async fn get_execution_state(&self, execution_id: Uuid) -> Result<ExecutionState, StoreError> {
        self.executions
            .read()
            .await
            .get(&execution_id)
            .map(|e| e.state.clone())
            .ok_or(StoreError::NotFound(execution_id))
    }

    async fn get_definition(&self, execution_id: Uuid) -> Result<WorkflowDefinition, StoreError> {
        self.executions
            .read()
            .await
            .get(&execution_id)
            .map(|e| e.definition.clone())
            .ok_or(StoreError::NotFound(execution_id))
    }

    async fn update_step_status(
        &self,
        execution_id: Uuid,
        step_id: &str,
        record: &StepRecord,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let entry = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::NotFound(execution_id))?;
        entry.state.apply_step(step_id, record.clone());
        Ok(())
    }

    async fn update_execution_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
        waiting_on: Option<&WaitingOn>,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let entry = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::NotFound(execution_id))?;
        let state = &mut entry.state;
        state.status = status;
        state.error = error.map(str::to_string);
        state.waiting_on = waiting_on.cloned();
        state.touch();
        Ok(())
    }

    async fn merge_inputs(
        &self,
        execution_id: Uuid,
        inputs: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let entry = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::NotFound(execution_id))?;
        for (key, value) in inputs {
            entry.state.inputs.insert(key.clone(), value.clone());
        }
        entry.state.touch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Node;
    use crate::state::StepStatus;
    use serde_json::json;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", vec![Node::trigger("t"), Node::trigger("u")], vec![])
    }

    #[tokio::test]
    async fn create_and_read_back() {
        let store = MemoryStateStore::new();
        let id = store
            .create_execution(&definition(), json!({ "k": 1 }).as_object().cloned().unwrap())
            .await
            .unwrap();

        let state = store.get_execution_state(id).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Pending);
        assert_eq!(state.steps.len(), 2);
        assert_eq!(state.inputs["k"], json!(1));
        assert_eq!(store.get_definition(id).await.unwrap().id, "wf");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_execution_is_not_found() {
        let store = MemoryStateStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.get_execution_state(id).await,
            Err(StoreError::NotFound(got)) if got == id
        ));
        assert!(store.merge_inputs(id, &Map::new()).await.is_err());
    }

    #[tokio::test]
    async fn step_outputs_are_write_once() {
        let store = MemoryStateStore::new();
        let id = store.create_execution(&definition(), Map::new()).await.unwrap();

        let done = |v: Value| StepRecord {
            status: StepStatus::Completed,
            output: Some(v),
            error: None,
            attempts: 1,
        };
        store.update_step_status(id, "t", &done(json!(1))).await.unwrap();
        store.update_step_status(id, "t", &done(json!(2))).await.unwrap();

        let state = store.get_execution_state(id).await.unwrap();
        assert_eq!(state.outputs["t"], json!(1));
    }

    #[tokio::test]
    async fn execution_status_replaces_error_and_waiting_on() {
        let store = MemoryStateStore::new();
        let id = store.create_execution(&definition(), Map::new()).await.unwrap();
        let waiting = WaitingOn {
            step_id: "u".into(),
            missing_step_id: "form".into(),
            reference: "form.email".into(),
        };

        store
            .update_execution_status(id, ExecutionStatus::Paused, None, Some(&waiting))
            .await
            .unwrap();
        assert_eq!(store.get_execution_state(id).await.unwrap().waiting_on, Some(waiting));

        store
            .update_execution_status(id, ExecutionStatus::Failed, Some("boom"), None)
            .await
            .unwrap();
        let state = store.get_execution_state(id).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("boom"));
        assert!(state.waiting_on.is_none());
    }

    #[tokio::test]
    async fn merge_inputs_overlays() {
        let store = MemoryStateStore::new();
        let id = store
            .create_execution(&definition(), json!({ "a": 1, "b": 2 }).as_object().cloned().unwrap())
            .await
            .unwrap();
        store
            .merge_inputs(id, json!({ "b": 3, "c": 4 }).as_object().unwrap())
            .await
            .unwrap();
        let inputs = store.get_execution_state(id).await.unwrap().inputs;
        assert_eq!(Value::Object(inputs), json!({ "a": 1, "b": 3, "c": 4 }));
    }
}
