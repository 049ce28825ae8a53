use axum::Json;
use serde::Serialize;
use serde_json::Value;

use engine::{validate_dag, EngineError, WorkflowDefinition};

use crate::error::ApiError;

#[derive(Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    /// Node IDs in topological execution order.
    pub order: Vec<String>,
}

/// Check a definition without running it.
pub async fn validate(Json(definition): Json<Value>) -> Result<Json<ValidationReport>, ApiError> {
    let definition: WorkflowDefinition =
        serde_json::from_value(definition).map_err(|e| ApiError::BadDefinition(e.to_string()))?;
    let order = validate_dag(&definition).map_err(EngineError::from)?;
    Ok(Json(ValidationReport { valid: true, order }))
}
