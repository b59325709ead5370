use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use aura_types::Reminder;

use crate::error::ApiError;
use crate::state::AppState;

fn default_delivery() -> String {
    let token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
    let chat_id = std::env::var("TELEGRAM_CHAT_ID").unwrap_or_default();
    if !token.trim().is_empty() && !chat_id.trim().is_empty() {
        "telegram".to_string()
    } else {
        "local".to_string()
    }
}

fn event_run_id(reminder: &Reminder) -> String {
    match reminder.run_id.as_deref().map(str::trim) {
        Some(run_id) if !run_id.is_empty() => run_id.to_string(),
        _ => format!("reminder:{}", reminder.id),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReminderListQuery {
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    200
}

#[derive(Debug, Deserialize)]
pub struct ReminderCreateRequest {
    pub due_at: String,
    pub text: String,
    pub delivery: Option<String>,
    pub run_id: Option<String>,
    pub source: Option<String>,
}

pub async fn list_reminders(
    State(state): State<AppState>,
    Query(query): Query<ReminderListQuery>,
) -> Result<Json<Value>, ApiError> {
    let reminders = state
        .store
        .list_reminders(query.status.as_deref(), query.limit)
        .await?;
    Ok(Json(json!(reminders)))
}

pub async fn create_reminder(
    State(state): State<AppState>,
    Json(payload): Json<ReminderCreateRequest>,
) -> Result<Json<Value>, ApiError> {
    let delivery = payload.delivery.unwrap_or_else(default_delivery);
    let reminder = state
        .store
        .create_reminder(
            &payload.due_at,
            &payload.text,
            &delivery,
            payload.run_id,
            payload.source,
        )
        .await?;
    let _ = state
        .bus
        .emit(
            &event_run_id(&reminder),
            "reminder_created",
            "Напоминание создано",
            json!({
                "id": reminder.id.clone(),
                "due_at": reminder.due_at.clone(),
                "delivery": reminder.delivery.clone(),
                "run_id": reminder.run_id.clone(),
            }),
        )
        .await;
    Ok(Json(json!(reminder)))
}

pub async fn cancel_reminder(
    State(state): State<AppState>,
    Path(reminder_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let reminder = state
        .store
        .cancel_reminder(&reminder_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Напоминание не найдено"))?;
    let _ = state
        .bus
        .emit(
            &event_run_id(&reminder),
            "reminder_cancelled",
            "Напоминание отменено",
            json!({"id": reminder_id, "run_id": reminder.run_id.clone()}),
        )
        .await;
    Ok(Json(json!(reminder)))
}
