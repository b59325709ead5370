use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::bootstrap_token;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct BootstrapRequest {
    pub token: String,
}

pub async fn auth_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let initialized = state.store.get_session_token_hash().await?.is_some();
    Ok(Json(json!({"initialized": initialized})))
}

pub async fn auth_bootstrap(
    State(state): State<AppState>,
    Json(payload): Json<BootstrapRequest>,
) -> Result<Json<Value>, ApiError> {
    let result = bootstrap_token(&state, &payload.token).await?;
    Ok(Json(result))
}
