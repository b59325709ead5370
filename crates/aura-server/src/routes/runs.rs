use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use aura_brain::{ContextItem, LlmRequest, LlmStatus, Sensitivity, SourceType};
use aura_core::chat_context::{
    build_chat_messages, build_chat_system_prompt, build_user_profile_context,
    name_from_interpretation, style_hint_from_interpretation,
};
use aura_core::interpreter::interpret_user_message_for_memory;
use aura_core::phrases::chat_resilience_text;
use aura_core::{Intent, IntentDecision, IntentRouter};
use aura_types::{ApprovalStatus, Run};

use crate::error::ApiError;
use crate::state::AppState;

const CHAT_HISTORY_TURNS: usize = 20;
const INTERPRETER_HISTORY_TURNS: usize = 12;
const ALLOWED_MODES: &[&str] = &["plan_only", "research", "execute_confirm", "autopilot_safe"];

#[derive(Debug, Deserialize)]
pub struct RunCreate {
    pub query_text: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    pub parent_run_id: Option<String>,
    pub purpose: Option<String>,
}

fn default_mode() -> String {
    "research".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

fn default_list_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct ApprovalDecisionRequest {
    #[serde(default)]
    pub decision: Option<Value>,
}

fn is_truthy(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn is_qa_request(state: &AppState, headers: &HeaderMap) -> bool {
    if let Some(header) = headers.get("X-Aura-QA-Mode").and_then(|v| v.to_str().ok()) {
        if is_truthy(header) {
            return true;
        }
    }
    state.qa_mode
}

async fn get_run_or_404(state: &AppState, run_id: &str) -> Result<Run, ApiError> {
    state
        .store
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Запуск не найден"))
}

fn intent_summary(decision: &IntentDecision) -> String {
    let mut parts = vec![format!("intent={}", decision.intent.as_str())];
    if !decision.plan_hint.is_empty() {
        parts.push(format!("plan_hint={}", decision.plan_hint.join(",")));
    }
    if decision.memory_item.is_some() {
        parts.push("memory_item=1".to_string());
    }
    parts.join("; ")
}

async fn emit_intent_decided(state: &AppState, run_id: &str, decision: &IntentDecision, selected_mode: &str) {
    let payload = json!({
        "intent": decision.intent.as_str(),
        "confidence": decision.confidence,
        "reasons": decision.reasons.clone(),
        "danger_flags": decision.act_hint.as_ref().map(|h| h.danger_flags.clone()).unwrap_or_default(),
        "suggested_mode": decision
            .act_hint
            .as_ref()
            .map(|h| h.suggested_run_mode.clone())
            .unwrap_or_else(|| selected_mode.to_string()),
        "selected_mode": selected_mode,
        "target": decision.act_hint.as_ref().map(|h| h.target.clone()),
        "decision_path": decision.decision_path.clone(),
        "summary": intent_summary(decision),
    });
    let _ = state
        .bus
        .emit(run_id, "intent_decided", "Интент определён", payload)
        .await;
}

async fn emit_llm_failed(state: &AppState, run_id: &str, message: &str, error_type: &str) {
    let _ = state
        .bus
        .emit(
            run_id,
            "llm_request_failed",
            message,
            json!({
                "provider": "local",
                "model_id": null,
                "error_type": error_type,
                "http_status_if_any": null,
                "retry_count": 0,
            }),
        )
        .await;
}

/// The chat flow's auto memory save payload, built out of the validated
/// interpretation when it says the message is worth remembering.
fn memory_payload_from_interpretation(query_text: &str, interpretation: Option<&Value>) -> Option<Value> {
    let interpretation = interpretation?;
    if interpretation.get("should_store") != Some(&Value::Bool(true)) {
        return None;
    }
    let summary = interpretation
        .get("summary")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())?;
    let title = interpretation
        .get("title")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("Профиль пользователя");
    Some(json!({
        "content": query_text.trim(),
        "origin": "auto",
        "memory_payload": {
            "title": title,
            "summary": summary,
            "confidence": interpretation.get("confidence"),
            "facts": interpretation.get("facts").cloned().unwrap_or_else(|| json!([])),
            "preferences": interpretation.get("preferences").cloned().unwrap_or_else(|| json!([])),
            "possible_facts": interpretation.get("possible_facts").cloned().unwrap_or_else(|| json!([])),
        },
    }))
}

/// Best-effort: a failed auto-save is recorded but never fails the run.
async fn save_memory_payload(state: &AppState, run: &Run, payload: Option<Value>, settings: &Value) {
    let Some(payload) = payload else { return };
    let Some(skill) = state.engine.registry().get("memory_save") else {
        return;
    };
    let ctx = state.engine.placeholder_context(run, settings.clone());
    if let Err(error) = skill.execute(&payload, &ctx).await {
        tracing::warn!(%error, run_id = %run.id, "auto memory save failed");
        emit_llm_failed(state, &run.id, "Memory save failed", "memory_save_failed").await;
    }
}

pub async fn create_run(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<RunCreate>,
) -> Result<Json<Value>, ApiError> {
    let project = state
        .store
        .get_project(&project_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Проект не найден"))?;

    if !ALLOWED_MODES.contains(&payload.mode.as_str()) {
        return Err(ApiError::bad_request("Недопустимый режим запуска"));
    }

    let qa_mode = is_qa_request(&state, &headers);
    let settings = project.settings.clone();

    let run = state
        .store
        .create_run(
            &project_id,
            &payload.query_text,
            &payload.mode,
            payload.parent_run_id.clone(),
            payload.purpose.clone(),
            json!({"intent": "ASK_CLARIFY", "qa_mode": qa_mode, "intent_path": "pending"}),
        )
        .await?;
    let _ = state
        .bus
        .emit(
            &run.id,
            "run_created",
            "Запуск создан",
            json!({
                "project_id": project_id,
                "mode": run.mode.clone(),
                "query_text": payload.query_text.clone(),
            }),
        )
        .await;

    // Semantic classification with the resilience fallback: a classifier
    // failure degrades to CHAT, never to a 5xx.
    let router = IntentRouter::new(state.brain.clone(), qa_mode);
    let mut semantic_error_code: Option<String> = None;
    let decision = match router
        .decide(&payload.query_text, Some(&run.id), &settings)
        .await
    {
        Ok(decision) => decision,
        Err(error) => {
            semantic_error_code = Some(error.code.clone());
            emit_llm_failed(&state, &run.id, "Semantic decision failed", &error.code).await;
            IntentDecision::semantic_resilience(&error.code)
        }
    };
    let semantic_resilience = decision.decision_path == "semantic_resilience";

    let profile_memories = state.store.list_user_memories(None, None, 50, false).await?;
    let profile_context = build_user_profile_context(&profile_memories);
    let history = state
        .store
        .list_recent_chat_turns(run.parent_run_id.as_deref(), INTERPRETER_HISTORY_TURNS)
        .await?;

    let mut memory_interpretation: Option<Value> = None;
    let mut memory_interpretation_error: Option<String> = None;
    if semantic_resilience {
        memory_interpretation_error =
            Some("memory_interpreter_skipped_semantic_resilience".to_string());
    } else {
        let known_profile = json!({
            "memories": profile_memories
                .iter()
                .take(20)
                .map(|m| json!({"title": m.title.clone(), "content": m.content.clone(), "meta": m.meta.clone()}))
                .collect::<Vec<_>>(),
        });
        match interpret_user_message_for_memory(
            &payload.query_text,
            &history,
            &known_profile,
            &state.brain,
            Some(&run.id),
            &settings,
        )
        .await
        {
            Ok(interpretation) => memory_interpretation = Some(interpretation),
            Err(error) => {
                memory_interpretation_error = Some(error.code.clone());
                emit_llm_failed(&state, &run.id, "Memory interpretation failed", &error.code).await;
            }
        }
    }

    let interpreted_style_hint = style_hint_from_interpretation(memory_interpretation.as_ref());
    let profile_style_hint = if profile_context.style_hints.is_empty() {
        None
    } else {
        Some(
            profile_context
                .style_hints
                .iter()
                .take(3)
                .cloned()
                .collect::<Vec<_>>()
                .join(" "),
        )
    };
    let effective_response_style_hint = decision
        .response_style_hint
        .clone()
        .or(interpreted_style_hint)
        .or(profile_style_hint);
    let interpreted_user_name = name_from_interpretation(memory_interpretation.as_ref())
        .or_else(|| profile_context.user_name.clone());
    let memory_payload =
        memory_payload_from_interpretation(&payload.query_text, memory_interpretation.as_ref());

    let mut selected_mode = "plan_only".to_string();
    let mut selected_purpose = payload.purpose.clone();
    match decision.intent {
        Intent::Act => {
            selected_mode = payload.mode.clone();
            if decision
                .act_hint
                .as_ref()
                .map(|hint| hint.suggested_run_mode == "execute_confirm")
                .unwrap_or(false)
            {
                selected_mode = "execute_confirm".to_string();
            }
        }
        Intent::Chat => {
            selected_purpose = selected_purpose.or_else(|| Some("chat_only".to_string()));
        }
        Intent::AskClarify => {
            selected_purpose = selected_purpose.or_else(|| Some("clarify".to_string()));
        }
    }

    let meta = json!({
        "intent": decision.intent.as_str(),
        "intent_confidence": decision.confidence,
        "intent_reasons": decision.reasons.clone(),
        "intent_questions": decision.questions.clone(),
        "needs_clarification": decision.needs_clarification,
        "qa_mode": qa_mode,
        "act_hint": decision.act_hint.clone(),
        "danger_flags": decision.act_hint.as_ref().map(|h| h.danger_flags.clone()).unwrap_or_default(),
        "suggested_run_mode": decision.act_hint.as_ref().map(|h| h.suggested_run_mode.clone()),
        "target": decision.act_hint.as_ref().map(|h| h.target.clone()),
        "intent_path": decision.decision_path.clone(),
        "plan_hint": decision.plan_hint.clone(),
        "memory_item": decision.memory_item.clone(),
        "memory_interpretation": memory_interpretation,
        "memory_interpretation_error": memory_interpretation_error,
        "response_style_hint": effective_response_style_hint.clone(),
        "user_visible_note": decision.user_visible_note.clone(),
        "user_name": interpreted_user_name,
        "semantic_error_code": semantic_error_code.clone(),
    });
    let run = state
        .store
        .update_run_meta_and_mode(&run.id, &selected_mode, selected_purpose.as_deref(), &meta)
        .await?
        .ok_or_else(|| ApiError::internal("Не удалось обновить запуск после semantic decision"))?;

    emit_intent_decided(&state, &run.id, &decision, &selected_mode).await;

    if matches!(decision.intent, Intent::Chat | Intent::AskClarify) {
        save_memory_payload(&state, &run, memory_payload, &settings).await;
    }

    match decision.intent {
        Intent::Act => {
            let plan = match state.engine.create_plan(&run).await {
                Ok(plan) => plan,
                Err(error) => {
                    state
                        .store
                        .update_run_status(
                            &run.id,
                            aura_types::RunStatus::Failed,
                            None,
                            Some(aura_types::now_iso()),
                        )
                        .await?;
                    let _ = state
                        .bus
                        .emit_error(
                            &run.id,
                            "run_failed",
                            "Запуск завершён с ошибкой",
                            json!({"error": error.to_string()}),
                        )
                        .await;
                    return Err(ApiError::internal(error.to_string()));
                }
            };
            Ok(Json(json!({"kind": "act", "intent": decision, "run": run, "plan": plan})))
        }
        Intent::Chat => {
            let chat_response =
                chat_response_for_run(&state, &run, &payload.query_text, semantic_resilience, semantic_error_code.as_deref(), effective_response_style_hint.as_deref(), &settings)
                    .await?;
            Ok(Json(json!({
                "kind": "chat",
                "intent": decision,
                "run": run,
                "chat_response": chat_response,
            })))
        }
        Intent::AskClarify => {
            let questions = decision.questions.clone();
            let _ = state
                .bus
                .emit(
                    &run.id,
                    "clarify_requested",
                    "Запрошено уточнение",
                    json!({"questions": questions}),
                )
                .await;
            let questions = decision.questions.clone();
            Ok(Json(json!({
                "kind": "clarify",
                "intent": decision,
                "run": run,
                "questions": questions,
            })))
        }
    }
}

/// Chat branch of the create-run flow: profile-aware model call with the
/// fixed-phrasebook degradation. Always HTTP 200.
async fn chat_response_for_run(
    state: &AppState,
    run: &Run,
    query_text: &str,
    semantic_resilience: bool,
    semantic_error_code: Option<&str>,
    response_style_hint: Option<&str>,
    settings: &Value,
) -> Result<String, ApiError> {
    if semantic_resilience {
        let fallback_error = semantic_error_code.unwrap_or("semantic_resilience");
        let fallback_text = chat_resilience_text(Some(fallback_error));
        let _ = state
            .bus
            .emit(
                &run.id,
                "chat_response_generated",
                "Ответ сформирован (degraded)",
                json!({
                    "provider": "local",
                    "model_id": null,
                    "latency_ms": null,
                    "text": fallback_text.clone(),
                    "degraded": true,
                    "error_type": fallback_error,
                    "http_status_if_any": null,
                }),
            )
            .await;
        return Ok(fallback_text);
    }

    let memories = state.store.list_user_memories(None, None, 50, false).await?;
    let system_text = build_chat_system_prompt(&memories, response_style_hint);
    let history = state
        .store
        .list_recent_chat_turns(run.parent_run_id.as_deref(), CHAT_HISTORY_TURNS)
        .await?;

    let mut request = LlmRequest::new("chat_response");
    request.task_kind = Some("chat".to_string());
    request.run_id = Some(run.id.clone());
    request.messages = build_chat_messages(&system_text, &history, query_text);
    request.context_items = vec![ContextItem::text(
        query_text,
        SourceType::UserPrompt,
        Sensitivity::Personal,
    )];

    let ctx = aura_brain::CallContext {
        run_id: Some(run.id.clone()),
        settings: settings.clone(),
        qa_mode: run.meta_bool("qa_mode"),
        ..Default::default()
    };

    let fallback = |provider: String,
                    model_id: Option<String>,
                    latency_ms: Option<i64>,
                    error_type: Option<String>,
                    http_status: Option<u16>| {
        let text = chat_resilience_text(error_type.as_deref());
        (provider, model_id, latency_ms, error_type, http_status, text)
    };

    let degraded = match state.brain.call(&request, &ctx).await {
        Ok(response) if response.status == LlmStatus::Ok => {
            let _ = state
                .bus
                .emit(
                    &run.id,
                    "chat_response_generated",
                    "Ответ сформирован",
                    json!({
                        "provider": response.provider.clone(),
                        "model_id": response.model_id.clone(),
                        "latency_ms": response.latency_ms,
                        "text": response.text.clone(),
                    }),
                )
                .await;
            return Ok(response.text);
        }
        Ok(response) => fallback(
            response.provider,
            response.model_id,
            Some(response.latency_ms),
            response.error_type.or(Some("chat_llm_failed".to_string())),
            response.http_status,
        ),
        Err(aura_brain::BrainError::Provider(error)) => fallback(
            error.provider.to_string(),
            None,
            None,
            Some(error.error_type.clone()),
            error.status_code,
        ),
        Err(error) => {
            tracing::warn!(%error, run_id = %run.id, "chat model call failed unexpectedly");
            emit_llm_failed(state, &run.id, "Chat LLM failed", "chat_llm_unhandled_error").await;
            fallback(
                "local".to_string(),
                None,
                None,
                Some("chat_llm_unhandled_error".to_string()),
                None,
            )
        }
    };

    let (provider, model_id, latency_ms, error_type, http_status, text) = degraded;
    let _ = state
        .bus
        .emit(
            &run.id,
            "chat_response_generated",
            "Ответ сформирован (degraded)",
            json!({
                "provider": provider,
                "model_id": model_id,
                "latency_ms": latency_ms,
                "text": text.clone(),
                "degraded": true,
                "error_type": error_type,
                "http_status_if_any": http_status,
            }),
        )
        .await;
    Ok(text)
}

// ── Run lifecycle ──────────────────────────────────────────────────────

pub async fn list_runs(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Run>>, ApiError> {
    if state.store.get_project(&project_id).await?.is_none() {
        return Err(ApiError::not_found("Проект не найден"));
    }
    Ok(Json(state.store.list_runs(&project_id, query.limit).await?))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(get_run_or_404(&state, &run_id).await?))
}

pub async fn create_plan(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = get_run_or_404(&state, &run_id).await?;
    let steps = state.engine.create_plan(&run).await?;
    Ok(Json(json!(steps)))
}

pub async fn start_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    get_run_or_404(&state, &run_id).await?;
    state.engine.spawn_start(run_id);
    Ok(Json(json!({"status": "запущено"})))
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    get_run_or_404(&state, &run_id).await?;
    state.engine.cancel_run(&run_id).await?;
    Ok(Json(json!({"status": "отменено"})))
}

pub async fn pause_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    get_run_or_404(&state, &run_id).await?;
    state.engine.pause_run(&run_id).await?;
    Ok(Json(json!({"status": "пауза"})))
}

pub async fn resume_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    get_run_or_404(&state, &run_id).await?;
    state.engine.resume_run(&run_id).await?;
    Ok(Json(json!({"status": "возобновлено"})))
}

pub async fn retry_task(
    State(state): State<AppState>,
    Path((run_id, task_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    get_run_or_404(&state, &run_id).await?;
    let task = state
        .store
        .get_task(&task_id)
        .await?
        .filter(|task| task.run_id == run_id)
        .ok_or_else(|| ApiError::not_found("Задача не найдена"))?;
    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(error) = engine.retry_task(&task.run_id, &task.id).await {
            tracing::warn!(%error, "retry_task worker failed");
        }
    });
    Ok(Json(json!({"status": "повтор_запущен"})))
}

pub async fn retry_step(
    State(state): State<AppState>,
    Path((run_id, step_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    get_run_or_404(&state, &run_id).await?;
    let step = state
        .store
        .get_plan_step(&step_id)
        .await?
        .filter(|step| step.run_id == run_id)
        .ok_or_else(|| ApiError::not_found("Шаг плана не найден"))?;
    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(error) = engine.retry_step(&step.run_id, &step.id).await {
            tracing::warn!(%error, "retry_step worker failed");
        }
    });
    Ok(Json(json!({"status": "повтор_запущен"})))
}

// ── Run sub-collections and snapshot ───────────────────────────────────

pub async fn get_plan(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    get_run_or_404(&state, &run_id).await?;
    Ok(Json(json!(state.store.list_plan_steps(&run_id).await?)))
}

pub async fn get_tasks(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    get_run_or_404(&state, &run_id).await?;
    Ok(Json(json!(state.store.list_tasks(&run_id).await?)))
}

pub async fn get_sources(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    get_run_or_404(&state, &run_id).await?;
    Ok(Json(json!(state.store.list_sources(&run_id).await?)))
}

pub async fn get_facts(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    get_run_or_404(&state, &run_id).await?;
    Ok(Json(json!(state.store.list_facts(&run_id).await?)))
}

pub async fn get_conflicts(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    get_run_or_404(&state, &run_id).await?;
    Ok(Json(json!(state.store.list_conflicts(&run_id).await?)))
}

pub async fn get_artifacts(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    get_run_or_404(&state, &run_id).await?;
    Ok(Json(json!(state.store.list_artifacts(&run_id).await?)))
}

pub async fn list_approvals(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    get_run_or_404(&state, &run_id).await?;
    Ok(Json(json!(state.store.list_approvals(&run_id).await?)))
}

/// One consistent read of the run with all sub-collections plus coverage,
/// conflict and freshness metrics.
async fn build_snapshot(state: &AppState, run_id: &str) -> Result<Value, ApiError> {
    let run = get_run_or_404(state, run_id).await?;
    let plan = state.store.list_plan_steps(run_id).await?;
    let tasks = state.store.list_tasks(run_id).await?;
    let sources = state.store.list_sources(run_id).await?;
    let facts = state.store.list_facts(run_id).await?;
    let conflicts = state.store.list_conflicts(run_id).await?;
    let artifacts = state.store.list_artifacts(run_id).await?;
    let approvals = state.store.list_approvals(run_id).await?;
    let last_events = state.store.list_events(run_id, 200).await?;

    let (done, total) = if !plan.is_empty() {
        (
            plan.iter()
                .filter(|s| s.status == aura_types::StepStatus::Done)
                .count(),
            plan.len(),
        )
    } else {
        (
            tasks
                .iter()
                .filter(|t| t.status == aura_types::TaskStatus::Done)
                .count(),
            tasks.len(),
        )
    };

    let open_conflicts = conflicts.iter().filter(|c| c.status == "open").count();

    let mut timestamps: Vec<&String> = sources
        .iter()
        .filter_map(|s| s.retrieved_at.as_ref())
        .collect();
    timestamps.sort();
    let freshness = if timestamps.is_empty() {
        Value::Null
    } else {
        json!({
            "min": timestamps.first(),
            "max": timestamps.last(),
            "count": timestamps.len(),
        })
    };

    Ok(json!({
        "run": run,
        "plan": plan,
        "tasks": tasks,
        "sources": sources,
        "facts": facts,
        "conflicts": conflicts,
        "artifacts": artifacts,
        "approvals": approvals,
        "metrics": {
            "coverage": {"done": done, "total": total},
            "conflicts": open_conflicts,
            "freshness": freshness,
        },
        "last_events": last_events,
    }))
}

pub async fn get_snapshot(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(build_snapshot(&state, &run_id).await?))
}

pub async fn download_snapshot(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let snapshot = build_snapshot(&state, &run_id).await?;
    let payload = serde_json::to_string(&snapshot).map_err(|e| ApiError::internal(e.to_string()))?;
    let response = (
        [
            (
                axum::http::header::CONTENT_TYPE,
                "application/json".to_string(),
            ),
            (
                axum::http::header::CONTENT_DISPOSITION,
                format!("attachment; filename=snapshot_{run_id}.json"),
            ),
        ],
        payload,
    )
        .into_response();
    Ok(response)
}

// ── Approvals ──────────────────────────────────────────────────────────

pub async fn approve_approval(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, ApiError> {
    // The decision body is optional free-form JSON.
    let decision = serde_json::from_slice::<ApprovalDecisionRequest>(&body)
        .ok()
        .and_then(|payload| payload.decision);
    let approval = state
        .store
        .update_approval_status(&approval_id, ApprovalStatus::Approved, "user", decision.clone())
        .await?
        .ok_or_else(|| ApiError::not_found("Подтверждение не найдено"))?;
    let _ = state
        .bus
        .emit_scoped(
            &approval.run_id,
            "approval_approved",
            "Подтверждение принято",
            json!({"approval_id": approval_id, "decision": decision}),
            Some(&approval.task_id),
            approval.step_id.as_deref(),
        )
        .await;
    Ok(Json(json!(approval)))
}

pub async fn reject_approval(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let approval = state
        .store
        .update_approval_status(&approval_id, ApprovalStatus::Rejected, "user", None)
        .await?
        .ok_or_else(|| ApiError::not_found("Подтверждение не найдено"))?;
    let _ = state
        .bus
        .emit_scoped(
            &approval.run_id,
            "approval_rejected",
            "Подтверждение отклонено",
            json!({"approval_id": approval_id}),
            Some(&approval.task_id),
            approval.step_id.as_deref(),
        )
        .await;
    Ok(Json(json!(approval)))
}

// ── Conflicts ──────────────────────────────────────────────────────────

/// Spawns a child run scoped to resolving one conflict.
pub async fn resolve_conflict(
    State(state): State<AppState>,
    Path((run_id, conflict_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let run = get_run_or_404(&state, &run_id).await?;
    let conflict = state
        .store
        .get_conflict(&conflict_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Конфликт не найден"))?;

    let query_text = format!("Разрешить конфликт по {}", conflict.fact_key);
    let sub_run = state
        .store
        .create_run(
            &run.project_id,
            &query_text,
            &run.mode,
            Some(run_id),
            Some("conflict_resolution".to_string()),
            json!({}),
        )
        .await?;
    let _ = state
        .bus
        .emit(
            &sub_run.id,
            "run_created",
            "Запуск создан",
            json!({
                "project_id": run.project_id,
                "mode": sub_run.mode,
                "query_text": query_text,
            }),
        )
        .await;
    Ok(Json(json!(sub_run)))
}
