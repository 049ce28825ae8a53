//! [`StateStore`] over Postgres.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use engine::{
    ExecutionState, ExecutionStatus, StateStore, StepRecord, StepStatus, StoreError, WaitingOn,
    WorkflowDefinition,
};

use crate::models::into_state;
use crate::repository::executions::{self, StepUpdate};
use crate::{DbError, DbPool};

/// Writes are attempted this many times when the failure looks transient.
const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: DbPool,
}

impl PgStateStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

/// Run `op` again on transient errors, with a linear back-off.
async fn with_retry<F, Fut>(what: &str, mut op: F) -> Result<(), DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), DbError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(err) if err.is_transient() && attempt < WRITE_ATTEMPTS => {
                let delay = WRITE_RETRY_DELAY * attempt;
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    what, attempt, WRITE_ATTEMPTS, delay, err
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn create_execution(
        &self,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let definition_json =
            serde_json::to_value(definition).map_err(|e| StoreError::Backend(e.to_string()))?;
        let step_ids: Vec<String> = definition.nodes.iter().map(|n| n.id.clone()).collect();

        with_retry("create execution", || {
            executions::insert_execution(
                &self.pool,
                id,
                &definition.id,
                &definition_json,
                &inputs,
                &step_ids,
            )
        })
        .await?;

        Ok(id)
    }

    async fn get_execution_state(&self, execution_id: Uuid) -> Result<ExecutionState, StoreError> {
        let execution = executions::get_execution(&self.pool, execution_id).await?;
        let steps = executions::list_steps(&self.pool, execution_id).await?;
        Ok(into_state(execution, steps)?)
    }

    async fn get_definition(&self, execution_id: Uuid) -> Result<WorkflowDefinition, StoreError> {
        let execution = executions::get_execution(&self.pool, execution_id).await?;
        Ok(execution.definition()?)
    }

    async fn update_step_status(
        &self,
        execution_id: Uuid,
        step_id: &str,
        record: &StepRecord,
    ) -> Result<(), StoreError> {
        let recorded_output = match record.status {
            StepStatus::Completed => record.output.as_ref(),
            _ => None,
        };
        let update = StepUpdate {
            status: record.status.as_str(),
            output: record.output.as_ref(),
            recorded_output,
            error: record.error.as_deref(),
            attempts: i32::try_from(record.attempts).unwrap_or(i32::MAX),
        };

        with_retry("step update", || {
            executions::update_step(&self.pool, execution_id, step_id, update)
        })
        .await?;
        Ok(())
    }

    async fn update_execution_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
        waiting_on: Option<&WaitingOn>,
    ) -> Result<(), StoreError> {
        let waiting_on = waiting_on
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        with_retry("execution status update", || {
            executions::update_execution_status(
                &self.pool,
                execution_id,
                status.as_str(),
                error,
                waiting_on.clone(),
            )
        })
        .await?;
        Ok(())
    }

    async fn merge_inputs(
        &self,
        execution_id: Uuid,
        inputs: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        with_retry("input merge", || {
            executions::merge_inputs(&self.pool, execution_id, inputs)
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test write", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(DbError::Sqlx(sqlx::Error::PoolTimedOut))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_give_up_after_the_budget() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test write", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DbError::Sqlx(sqlx::Error::PoolTimedOut)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), WRITE_ATTEMPTS);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test write", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DbError::NotFound(Uuid::nil())) }
        })
        .await;

        assert!(matches!(result, Err(DbError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
