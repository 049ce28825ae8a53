//! Execution and step-execution repository functions.

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    models::{ExecutionRow, StepExecutionRow},
    DbError,
};

const EXECUTION_COLUMNS: &str =
    "id, workflow_id, status, definition, inputs, error, waiting_on, created_at, updated_at";

const STEP_COLUMNS: &str =
    "execution_id, step_id, position, status, output, recorded_output, error, attempts, updated_at";

// ---------------------------------------------------------------------------
// executions
// ---------------------------------------------------------------------------

/// Insert an execution in `PENDING` status together with one `PENDING` row
/// per step, in a single transaction.
pub async fn insert_execution(
    pool: &PgPool,
    id: Uuid,
    workflow_id: &str,
    definition: &Value,
    inputs: &Map<String, Value>,
    step_ids: &[String],
) -> Result<(), DbError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO executions
            (id, workflow_id, status, definition, inputs, error, waiting_on, created_at, updated_at)
        VALUES ($1, $2, 'PENDING', $3, $4, NULL, NULL, $5, $5)
        "#,
    )
    .bind(id)
    .bind(workflow_id)
    .bind(definition)
    .bind(Value::Object(inputs.clone()))
    .bind(now)
    .execute(&mut *tx)
    .await?;

    for (position, step_id) in step_ids.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO step_executions
                (execution_id, step_id, position, status, attempts, updated_at)
            VALUES ($1, $2, $3, 'PENDING', 0, $4)
            "#,
        )
        .bind(id)
        .bind(step_id)
        .bind(i32::try_from(position).unwrap_or(i32::MAX))
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Fetch a single execution by its primary key.
pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<ExecutionRow, DbError> {
    let row = sqlx::query_as::<_, ExecutionRow>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound(id))?;

    Ok(row)
}

/// Update status, error and waiting-on of an execution.
pub async fn update_execution_status(
    pool: &PgPool,
    id: Uuid,
    status: &str,
    error: Option<&str>,
    waiting_on: Option<Value>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE executions
        SET status = $1, error = $2, waiting_on = $3, updated_at = $4
        WHERE id = $5
        "#,
    )
    .bind(status)
    .bind(error)
    .bind(waiting_on)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(id));
    }
    Ok(())
}

/// Overlay `inputs` onto the stored inputs (top-level keys replace).
pub async fn merge_inputs(
    pool: &PgPool,
    id: Uuid,
    inputs: &Map<String, Value>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE executions SET inputs = inputs || $1, updated_at = $2 WHERE id = $3",
    )
    .bind(Value::Object(inputs.clone()))
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(id));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// step_executions
// ---------------------------------------------------------------------------

/// All step rows of an execution in definition order.
pub async fn list_steps(pool: &PgPool, execution_id: Uuid) -> Result<Vec<StepExecutionRow>, DbError> {
    let rows = sqlx::query_as::<_, StepExecutionRow>(&format!(
        "SELECT {STEP_COLUMNS} FROM step_executions WHERE execution_id = $1 ORDER BY position"
    ))
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// One step transition, as written to `step_executions`.
#[derive(Debug, Clone, Copy)]
pub struct StepUpdate<'a> {
    pub status: &'a str,
    pub output: Option<&'a Value>,
    /// Only filled the first time it is given.
    pub recorded_output: Option<&'a Value>,
    pub error: Option<&'a str>,
    pub attempts: i32,
}

/// Write a step transition.
pub async fn update_step(
    pool: &PgPool,
    execution_id: Uuid,
    step_id: &str,
    update: StepUpdate<'_>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE step_executions
        SET status = $1,
            output = $2,
            recorded_output = COALESCE(recorded_output, $3),
            error = $4,
            attempts = $5,
            updated_at = $6
        WHERE execution_id = $7 AND step_id = $8
        "#,
    )
    .bind(update.status)
    .bind(update.output)
    .bind(update.recorded_output)
    .bind(update.error)
    .bind(update.attempts)
    .bind(Utc::now())
    .bind(execution_id)
    .bind(step_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(execution_id));
    }
    Ok(())
}
