use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use engine::{ExecutionState, WorkflowDefinition};

use super::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct StartExecutionDto {
    /// Parsed by hand so a malformed definition is a 400, not a 422.
    pub definition: Value,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

#[derive(Deserialize)]
pub struct ResumeExecutionDto {
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionAccepted {
    pub execution_id: Uuid,
}

pub async fn start(
    State(state): State<AppState>,
    Json(payload): Json<StartExecutionDto>,
) -> Result<(StatusCode, Json<ExecutionAccepted>), ApiError> {
    let definition: WorkflowDefinition = serde_json::from_value(payload.definition)
        .map_err(|e| ApiError::BadDefinition(e.to_string()))?;

    let execution_id = state
        .engine
        .start_execution(&definition, payload.inputs)
        .await?;
    info!(%execution_id, workflow_id = %definition.id, "execution accepted");

    Ok((StatusCode::ACCEPTED, Json(ExecutionAccepted { execution_id })))
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<ExecutionState>, ApiError> {
    Ok(Json(state.engine.get_execution_state(id).await?))
}

pub async fn resume(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    payload: Option<Json<ResumeExecutionDto>>,
) -> Result<(StatusCode, Json<ExecutionAccepted>), ApiError> {
    let inputs = payload.map(|Json(p)| p.inputs).unwrap_or_default();
    state.engine.resume_execution(id, inputs).await?;
    Ok((StatusCode::ACCEPTED, Json(ExecutionAccepted { execution_id: id })))
}

pub async fn cancel(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ExecutionAccepted>), ApiError> {
    state.engine.cancel_execution(id).await?;
    Ok((StatusCode::ACCEPTED, Json(ExecutionAccepted { execution_id: id })))
}
