use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn list_skills(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.engine.registry().list_manifests())))
}

pub async fn get_manifest(
    State(state): State<AppState>,
    Path(skill_name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let manifest = state
        .engine
        .registry()
        .get_manifest(&skill_name)
        .ok_or_else(|| ApiError::not_found("Навык не найден"))?;
    Ok(Json(json!(manifest)))
}

pub async fn reload_skills(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    // Built-in skills are compiled in; reload just re-reports the set.
    Ok(Json(json!({
        "status": "перезагружено",
        "count": state.engine.registry().len(),
    })))
}
