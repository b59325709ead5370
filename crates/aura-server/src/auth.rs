use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};

use crate::error::ApiError;
use crate::state::AppState;

pub fn hash_token(token: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn new_salt() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// One-shot bootstrap: the first token wins, repeating the same token is
/// idempotent, a different one conflicts.
pub async fn bootstrap_token(state: &AppState, token: &str) -> Result<serde_json::Value, ApiError> {
    if let Some(stored) = state.store.get_session_token_hash().await? {
        let expected = hash_token(token, &stored.salt);
        if expected != stored.token_hash {
            return Err(ApiError::conflict("Токен уже установлен"));
        }
        return Ok(serde_json::json!({"status": "ок"}));
    }

    let salt = new_salt();
    let token_hash = hash_token(token, &salt);
    state.store.set_session_token_hash(&token_hash, &salt).await?;
    Ok(serde_json::json!({"status": "создано"}))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn query_token(request: &Request) -> Option<String> {
    let query = request.uri().query()?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "token" && !value.is_empty() {
            Some(value.to_string())
        } else {
            None
        }
    })
}

pub async fn require_auth(state: &AppState, token: Option<String>) -> Result<(), ApiError> {
    let Some(stored) = state.store.get_session_token_hash().await? else {
        return Err(ApiError::unauthorized("Сессионный токен не инициализирован"));
    };
    let Some(token) = token else {
        return Err(ApiError::unauthorized("Отсутствует токен"));
    };
    if hash_token(&token, &stored.salt) != stored.token_hash {
        return Err(ApiError::unauthorized("Неверный токен"));
    }
    Ok(())
}

/// Bearer-token middleware for every non-auth route; SSE clients may pass
/// the token as a query parameter instead.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers()).or_else(|| query_token(&request));
    require_auth(&state, token).await?;
    Ok(next.run(request).await)
}
