use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde_json::Value;

use aura_types::Event;

use crate::db::{StoreError, StoreResult};
use crate::store::Store;

/// Closed event-type vocabulary. Emitting anything else is rejected with
/// `invalid_event_type` before it reaches the log.
pub const ALLOWED_EVENT_TYPES: &[&str] = &[
    "run_created",
    "plan_created",
    "run_started",
    "run_done",
    "run_failed",
    "run_canceled",
    "run_paused",
    "run_resumed",
    "task_queued",
    "task_started",
    "task_progress",
    "task_failed",
    "task_retried",
    "task_done",
    "source_found",
    "source_fetched",
    "fact_extracted",
    "artifact_created",
    "conflict_detected",
    "verification_done",
    "approval_requested",
    "approval_approved",
    "approval_rejected",
    "approval_resolved",
    "llm_route_decided",
    "llm_request_sanitized",
    "llm_request_started",
    "llm_request_succeeded",
    "llm_request_failed",
    "llm_budget_exceeded",
    "local_llm_http_error",
    "intent_decided",
    "clarify_requested",
    "chat_response_generated",
    "memory_save_requested",
    "memory_saved",
    "memory_deleted",
    "memory_list_viewed",
    "reminder_created",
    "reminder_cancelled",
    "reminder_due",
    "reminder_sent",
    "reminder_failed",
    "step_paused_for_approval",
    "step_cancelled_by_user",
    "step_execution_started",
    "step_execution_finished",
    "step_retrying",
    "step_waiting",
    "micro_action_proposed",
    "micro_action_executed",
    "observation_captured",
    "verification_result",
    "ocr_cached_hit",
    "ocr_performed",
    "user_action_required",
];

static ALLOWED: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ALLOWED_EVENT_TYPES.iter().copied().collect());

/// Append-only event log entry point: validates the type, then delegates
/// to the store, which assigns the monotone `seq`.
#[derive(Clone)]
pub struct EventBus {
    store: Arc<Store>,
}

impl EventBus {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn emit(
        &self,
        run_id: &str,
        event_type: &str,
        message: &str,
        payload: Value,
    ) -> StoreResult<Event> {
        self.emit_full(run_id, event_type, "info", message, payload, None, None)
            .await
    }

    pub async fn emit_error(
        &self,
        run_id: &str,
        event_type: &str,
        message: &str,
        payload: Value,
    ) -> StoreResult<Event> {
        self.emit_full(run_id, event_type, "error", message, payload, None, None)
            .await
    }

    pub async fn emit_scoped(
        &self,
        run_id: &str,
        event_type: &str,
        message: &str,
        payload: Value,
        task_id: Option<&str>,
        step_id: Option<&str>,
    ) -> StoreResult<Event> {
        self.emit_full(run_id, event_type, "info", message, payload, task_id, step_id)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn emit_full(
        &self,
        run_id: &str,
        event_type: &str,
        level: &str,
        message: &str,
        payload: Value,
        task_id: Option<&str>,
        step_id: Option<&str>,
    ) -> StoreResult<Event> {
        if !ALLOWED.contains(event_type) {
            return Err(StoreError::InvalidEventType(event_type.to_string()));
        }
        self.store
            .add_event(run_id, event_type, level, message, payload, task_id, step_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_event_type_is_rejected() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store);
        let err = bus
            .emit("run-1", "made_up_event", "x", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidEventType(_)));
    }

    #[tokio::test]
    async fn replay_is_deterministic() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store.clone());
        for i in 0..3 {
            bus.emit("run-1", "task_progress", "шаг", serde_json::json!({"i": i}))
                .await
                .unwrap();
        }
        let first = store.list_events("run-1", 100).await.unwrap();
        let second = store.list_events("run-1", 100).await.unwrap();
        let shape =
            |events: &[Event]| -> Vec<(i64, String, Value)> {
                events
                    .iter()
                    .map(|e| (e.seq, e.event_type.clone(), e.payload.clone()))
                    .collect()
            };
        assert_eq!(shape(&first), shape(&second));
    }
}
