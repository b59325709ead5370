use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use aura_core::normalize::normalize_memory_texts;
use aura_store::StoreError;

use crate::error::ApiError;
use crate::state::AppState;

const SYSTEM_RUN_ID: &str = "system-memory";

fn event_run_id(run_id: Option<&str>) -> String {
    run_id
        .filter(|id| !id.is_empty())
        .unwrap_or(SYSTEM_RUN_ID)
        .to_string()
}

#[derive(Debug, Deserialize)]
pub struct MemoryListQuery {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub run_id: Option<String>,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct MemoryCreateRequest {
    pub content: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    pub source: Option<String>,
    #[serde(rename = "from")]
    pub from_: Option<String>,
    pub run_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MemoryDeleteQuery {
    pub run_id: Option<String>,
}

pub async fn list_memory(
    State(state): State<AppState>,
    Query(query): Query<MemoryListQuery>,
) -> Result<Json<Value>, ApiError> {
    let items = state
        .store
        .list_user_memories(
            Some(&query.query),
            Some(&query.tag),
            query.limit.clamp(1, 200),
            false,
        )
        .await?;
    let _ = state
        .bus
        .emit(
            &event_run_id(query.run_id.as_deref()),
            "memory_list_viewed",
            "Просмотр памяти",
            json!({"query": query.query, "result_count": items.len()}),
        )
        .await;
    Ok(Json(json!(items)))
}

pub async fn create_memory(
    State(state): State<AppState>,
    Json(payload): Json<MemoryCreateRequest>,
) -> Result<Json<Value>, ApiError> {
    let source = payload.source.as_deref().unwrap_or("user_command");
    if !matches!(source, "user_command" | "imported" | "system") {
        return Err(ApiError::bad_request("Недопустимый источник памяти"));
    }

    let event_from = match payload.from_.as_deref() {
        Some(from) if matches!(from, "user_command" | "ui_button" | "system") => from,
        _ => "user_command",
    };

    let run_id = event_run_id(payload.run_id.as_deref());
    let content = payload.content.trim().to_string();
    let _ = state
        .bus
        .emit(
            &run_id,
            "memory_save_requested",
            "Запрошено сохранение в память",
            json!({"from": event_from, "preview_len": content.chars().count()}),
        )
        .await;

    // Only normalized facts are stored, never the raw message.
    let items = normalize_memory_texts(&content, &[], &state.brain, &json!({})).await;
    let Some(first) = items.first() else {
        return Err(ApiError::bad_request("Не удалось нормализовать запись памяти"));
    };

    let memory = state
        .store
        .create_user_memory(None, first, payload.tags, source, json!({}))
        .await
        .map_err(|error| match error {
            StoreError::ContentTooLong(limit) => {
                ApiError::bad_request(format!("Слишком длинный контент (лимит {limit} символов)"))
            }
            StoreError::Invalid(_) => ApiError::bad_request("Некорректный контент"),
            other => ApiError::from(other),
        })?;

    let _ = state
        .bus
        .emit(
            &run_id,
            "memory_saved",
            "Память сохранена",
            json!({
                "memory_id": memory.id.clone(),
                "title": memory.title.clone(),
                "len": memory.content.chars().count(),
                "tags_count": memory.tags.len(),
            }),
        )
        .await;
    Ok(Json(json!(memory)))
}

pub async fn delete_memory(
    State(state): State<AppState>,
    Path(memory_id): Path<String>,
    Query(query): Query<MemoryDeleteQuery>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .delete_user_memory(&memory_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Память не найдена"))?;
    let _ = state
        .bus
        .emit(
            &event_run_id(query.run_id.as_deref()),
            "memory_deleted",
            "Запись памяти удалена",
            json!({"memory_id": memory_id}),
        )
        .await;
    Ok(Json(json!({"status": "deleted"})))
}

pub async fn pin_memory(
    State(state): State<AppState>,
    Path(memory_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let memory = state
        .store
        .set_user_memory_pinned(&memory_id, true)
        .await?
        .ok_or_else(|| ApiError::not_found("Память не найдена"))?;
    Ok(Json(json!(memory)))
}

pub async fn unpin_memory(
    State(state): State<AppState>,
    Path(memory_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let memory = state
        .store
        .set_user_memory_pinned(&memory_id, false)
        .await?
        .ok_or_else(|| ApiError::not_found("Память не найдена"))?;
    Ok(Json(json!(memory)))
}
