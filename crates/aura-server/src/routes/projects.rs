use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use aura_types::Project;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ProjectCreate {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub settings: Value,
}

#[derive(Debug, Deserialize)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub tags: Option<Vec<String>>,
    pub settings: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    #[serde(rename = "type")]
    pub item_type: Option<String>,
    pub from_ts: Option<String>,
    pub to_ts: Option<String>,
}

pub async fn create_project(
    State(state): State<AppState>,
    Json(payload): Json<ProjectCreate>,
) -> Result<Json<Project>, ApiError> {
    let project = state
        .store
        .create_project(&payload.name, payload.tags, payload.settings)
        .await?;
    Ok(Json(project))
}

pub async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<Project>>, ApiError> {
    Ok(Json(state.store.list_projects().await?))
}

pub async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    let project = state
        .store
        .get_project(&project_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Проект не найден"))?;
    Ok(Json(project))
}

pub async fn update_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(payload): Json<ProjectUpdate>,
) -> Result<Json<Project>, ApiError> {
    let project = state
        .store
        .update_project(&project_id, payload.name, payload.tags, payload.settings)
        .await?
        .ok_or_else(|| ApiError::not_found("Проект не найден"))?;
    Ok(Json(project))
}

pub async fn search_memory(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<Value>>, ApiError> {
    if state.store.get_project(&project_id).await?.is_none() {
        return Err(ApiError::not_found("Проект не найден"));
    }
    let results = state
        .store
        .search_memory(
            &project_id,
            &query.q,
            query.item_type.as_deref(),
            query.from_ts.as_deref(),
            query.to_ts.as_deref(),
            50,
        )
        .await?;
    Ok(Json(results))
}
