use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UnlockPayload {
    pub passphrase: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiPayload {
    pub api_key: String,
}

pub async fn unlock(
    State(state): State<AppState>,
    Json(payload): Json<UnlockPayload>,
) -> Result<Json<Value>, ApiError> {
    state.secrets.set_passphrase(Some(payload.passphrase));
    Ok(Json(json!({"status": "ok"})))
}

pub async fn set_openai(
    State(state): State<AppState>,
    Json(payload): Json<OpenAiPayload>,
) -> Result<Json<Value>, ApiError> {
    state.secrets.set_runtime("OPENAI_API_KEY", &payload.api_key);
    Ok(Json(json!({"status": "ok"})))
}

pub async fn set_openai_local(
    State(state): State<AppState>,
    Json(payload): Json<OpenAiPayload>,
) -> Result<Json<Value>, ApiError> {
    state
        .secrets
        .set_local("OPENAI_API_KEY", &payload.api_key)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    state.secrets.set_runtime("OPENAI_API_KEY", &payload.api_key);
    Ok(Json(json!({"status": "ok", "stored": true})))
}

pub async fn get_openai_local(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let stored = state.secrets.get_local("OPENAI_API_KEY").is_some();
    Ok(Json(json!({"stored": stored})))
}

pub async fn secrets_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!({"vault_unlocked": state.secrets.passphrase_set()})))
}
