use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

use aura_store::{EventBus, Store, StoreError};
use aura_types::{ApprovalStatus, RunStatus, TaskStatus};

use crate::config::BrainConfig;
use crate::providers::{
    ChatProvider, CloudOpenAiProvider, LocalOllamaProvider, ProviderCall, ProviderError,
    ProviderResult,
};
use crate::routing::{
    decide_route, items_length, sanitize_context_items, summarize_items_by_source, ContextItem,
    PolicyFlags, Route, RoutingDecision, SourceType,
};
use crate::secrets::Secrets;
use crate::types::{ChatMessage, LlmRequest, LlmResponse, LlmStatus};

const APPROVAL_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum BrainError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Invalid(String),
}

/// Per-call context: who is calling (run/task/step) and under which
/// project settings.
#[derive(Clone, Default)]
pub struct CallContext {
    pub run_id: Option<String>,
    pub task_id: Option<String>,
    pub step_id: Option<String>,
    pub settings: Value,
    pub qa_mode: bool,
}

impl CallContext {
    pub fn for_run(run_id: &str, settings: Value) -> Self {
        Self {
            run_id: Some(run_id.to_string()),
            settings,
            ..Default::default()
        }
    }
}

/// Turns an `LlmRequest` into an `LlmResponse` through policy,
/// sanitization, queuing, caching and retries. One instance lives for the
/// whole app; all mutable state sits behind its own locks.
pub struct BrainRouter {
    config: BrainConfig,
    store: Arc<Store>,
    bus: EventBus,
    local: Arc<dyn ChatProvider>,
    cloud: Arc<dyn ChatProvider>,
    queue: Arc<Semaphore>,
    cache: Mutex<HashMap<String, HashMap<String, LlmResponse>>>,
    run_counts: Mutex<HashMap<String, u32>>,
    step_counts: Mutex<HashMap<(String, String), u32>>,
    local_failures: Mutex<HashMap<(String, String), u32>>,
}

impl BrainRouter {
    pub fn new(config: BrainConfig, store: Arc<Store>, secrets: Arc<Secrets>) -> Self {
        let local = Arc::new(LocalOllamaProvider::new(
            &config.local_base_url,
            config.local_timeout_s,
            &config.artifact_dir,
        ));
        let cloud = Arc::new(CloudOpenAiProvider::new(
            &config.cloud_base_url,
            config.cloud_timeout_s,
            secrets,
        ));
        Self::with_providers(config, store, local, cloud)
    }

    pub fn with_providers(
        config: BrainConfig,
        store: Arc<Store>,
        local: Arc<dyn ChatProvider>,
        cloud: Arc<dyn ChatProvider>,
    ) -> Self {
        let bus = EventBus::new(store.clone());
        let queue = Arc::new(Semaphore::new(config.max_concurrency.max(1) as usize));
        Self {
            config,
            store,
            bus,
            local,
            cloud,
            queue,
            cache: Mutex::new(HashMap::new()),
            run_counts: Mutex::new(HashMap::new()),
            step_counts: Mutex::new(HashMap::new()),
            local_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BrainConfig {
        &self.config
    }

    pub async fn call(
        &self,
        request: &LlmRequest,
        ctx: &CallContext,
    ) -> Result<LlmResponse, BrainError> {
        let run_id = request.run_id.clone().or_else(|| ctx.run_id.clone());
        let task_id = request.task_id.clone().or_else(|| ctx.task_id.clone());
        let step_id = request.step_id.clone().or_else(|| ctx.step_id.clone());
        let scope = EmitScope {
            run_id: run_id.clone(),
            task_id: task_id.clone(),
            step_id: step_id.clone(),
        };

        if self.config.qa_mode || ctx.qa_mode {
            return Ok(self.qa_response(request, &scope).await);
        }

        let mut flags = PolicyFlags::from_settings(&ctx.settings);
        if self.config.cloud_enabled_override {
            flags.cloud_allowed = self.config.cloud_enabled;
        }
        if self.config.auto_cloud_override {
            flags.auto_cloud_enabled = self.config.auto_cloud_enabled;
        }

        let items = &request.context_items;
        let decision = decide_route(items, &flags, &HashSet::new());

        let mut route = decision.route;
        let mut route_reason = decision.reason.clone();

        if let Some(heuristic) = self.auto_switch_reason(request, items, run_id.as_deref(), &flags)
        {
            if flags.auto_cloud_enabled
                && flags.cloud_allowed
                && !matches!(decision.reason.as_str(), "telegram_text_present" | "strict_local")
            {
                route = Route::Cloud;
                route_reason = heuristic;
            }
        }

        let mut approved_for_cloud = false;
        if decision.required_approval.is_some() {
            if route == Route::Cloud && flags.auto_cloud_enabled && flags.cloud_allowed {
                approved_for_cloud = self
                    .request_cloud_approval(&scope, &decision, items, &flags)
                    .await?;
                if approved_for_cloud {
                    route = Route::Cloud;
                    route_reason = "financial_file_approved".to_string();
                } else {
                    route = Route::Local;
                    route_reason = "financial_file_not_approved".to_string();
                }
            } else if route == Route::Cloud {
                route = Route::Local;
                route_reason = "cloud_disabled".to_string();
            }
        }

        if matches!(decision.reason.as_str(), "telegram_text_present" | "strict_local") {
            route = Route::Local;
            route_reason = decision.reason.clone();
        }

        // Sanitization runs before any event so that a sanitized-empty
        // fallback is already reflected in llm_route_decided.
        let items_summary = summarize_items_by_source(items);
        let original_len = items_length(items);
        let mut final_items: Vec<ContextItem> = items.clone();
        let mut sanitize_event: Option<Value> = None;

        if route == Route::Cloud {
            let sanitized = sanitize_context_items(items, approved_for_cloud, &flags);
            let final_len = sanitized.total_chars;
            let truncated_chars = original_len.saturating_sub(final_len);
            sanitize_event = Some(json!({
                "removed_counts_by_source_type": sanitized.removed_counts_by_source,
                "redacted_count": sanitized.redacted_count,
                "truncated_chars": truncated_chars,
                "final_len": final_len,
            }));
            final_items = sanitized.items;
            if final_len == 0 {
                route = Route::Local;
                route_reason = "sanitized_empty_fallback".to_string();
                final_items = items.clone();
            }
        } else if let Some(drops) = decision.redaction_plan.get("drop").and_then(|v| v.as_array())
        {
            // Telegram and screenshot text never leave the route decision:
            // the decision that forced LOCAL also drops them from context.
            let dropped: HashSet<&str> = drops.iter().filter_map(|v| v.as_str()).collect();
            let removed_json: serde_json::Map<String, Value> = dropped
                .iter()
                .map(|source| {
                    let count = items
                        .iter()
                        .filter(|i| i.source_type.as_str() == *source)
                        .count();
                    (source.to_string(), json!(count))
                })
                .filter(|(_, count)| count.as_u64().unwrap_or(0) > 0)
                .collect();
            if !removed_json.is_empty() {
                final_items.retain(|item| !dropped.contains(item.source_type.as_str()));
                sanitize_event = Some(json!({
                    "removed_counts_by_source_type": removed_json,
                    "redacted_count": 0,
                    "truncated_chars": 0,
                    "final_len": items_length(&final_items),
                }));
            }
        }

        let provider_name = match route {
            Route::Local => "local",
            Route::Cloud => "cloud",
        };
        let model_id = self.select_model(route, &request.preferred_model_kind, ctx);

        self.emit(
            &scope,
            "llm_route_decided",
            "LLM route decided",
            json!({
                "route": route.as_str(),
                "reason": route_reason,
                "provider": provider_name,
                "model_id": model_id,
                "items_summary_by_source_type": items_summary,
            }),
        )
        .await;
        if let Some(payload) = sanitize_event {
            self.emit(&scope, "llm_request_sanitized", "LLM request sanitized", payload)
                .await;
        }

        let messages = self.build_messages(request, &final_items)?;
        let cache_key = self.cache_key(route, &model_id, request, &messages);
        if let Some(cached) = self.cache_get(run_id.as_deref(), &cache_key) {
            self.emit(
                &scope,
                "llm_request_started",
                "LLM request started",
                json!({"provider": cached.provider.clone(), "model_id": cached.model_id.clone()}),
            )
            .await;
            self.emit(
                &scope,
                "llm_request_succeeded",
                "LLM request succeeded",
                json!({
                    "provider": cached.provider.clone(),
                    "model_id": cached.model_id.clone(),
                    "latency_ms": 0,
                    "usage_if_available": cached.usage.clone(),
                    "cache_hit": true,
                }),
            )
            .await;
            return Ok(cached);
        }

        if let Some(run_id) = run_id.as_deref() {
            if let Some((budget_name, limit, current)) = self.check_budget(run_id, step_id.as_deref())
            {
                self.emit(
                    &scope,
                    "llm_budget_exceeded",
                    "LLM budget exceeded",
                    json!({"budget_name": budget_name, "limit": limit, "current": current}),
                )
                .await;
                return Ok(LlmResponse {
                    text: String::new(),
                    usage: None,
                    provider: provider_name.to_string(),
                    model_id: Some(model_id),
                    latency_ms: 0,
                    cache_hit: false,
                    route_reason,
                    status: LlmStatus::BudgetExceeded,
                    error_type: Some("budget_exceeded".to_string()),
                    http_status: None,
                    retry_count: 0,
                    raw: None,
                });
            }
        }

        // FIFO admission: tokio's semaphore queues waiters fairly, so a
        // later caller can never overtake an earlier one under contention.
        let _permit = self
            .queue
            .clone()
            .acquire_owned()
            .await
            .expect("brain queue closed");

        let start = Instant::now();
        self.emit(
            &scope,
            "llm_request_started",
            "LLM request started",
            json!({"provider": provider_name, "model_id": model_id}),
        )
        .await;

        let provider_call = ProviderCall {
            messages,
            model: model_id.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            json_schema: request.json_schema.clone(),
            tools: request.tools.clone(),
            run_id: run_id.clone(),
            step_id: step_id.clone(),
            purpose: Some(request.purpose.clone()),
        };

        let outcome = match route {
            Route::Local => self.local.chat(&provider_call).await.map(|result| {
                let response = self.make_response(result, "local", &model_id, start, &route_reason, 0);
                self.note_local_result(run_id.as_deref(), &request.preferred_model_kind, &response);
                response
            }),
            Route::Cloud => {
                self.call_cloud_with_retry(&provider_call, start, &route_reason)
                    .await
            }
        };

        match outcome {
            Ok(response) => {
                self.emit(
                    &scope,
                    "llm_request_succeeded",
                    "LLM request succeeded",
                    json!({
                        "provider": response.provider.clone(),
                        "model_id": response.model_id.clone(),
                        "latency_ms": response.latency_ms,
                        "usage_if_available": response.usage.clone(),
                        "cache_hit": response.cache_hit,
                    }),
                )
                .await;
                self.cache_set(run_id.as_deref(), &cache_key, &response);
                self.increment_budget(run_id.as_deref(), step_id.as_deref());
                Ok(response)
            }
            Err(error) => {
                self.emit(
                    &scope,
                    "llm_request_failed",
                    "LLM request failed",
                    json!({
                        "provider": error.provider,
                        "model_id": model_id,
                        "error_type": error.error_type.clone(),
                        "http_status_if_any": error.status_code,
                        "retry_count": error.retry_count,
                    }),
                )
                .await;
                if error.provider == "local" {
                    if let Some(artifact_path) = &error.artifact_path {
                        self.emit(
                            &scope,
                            "local_llm_http_error",
                            "Local LLM HTTP error",
                            json!({
                                "status": error.status_code,
                                "model_id": model_id,
                                "artifact_path": artifact_path,
                            }),
                        )
                        .await;
                    }
                    self.note_local_failure(run_id.as_deref(), &request.preferred_model_kind);
                }
                Err(BrainError::Provider(error))
            }
        }
    }

    // ── QA mode ────────────────────────────────────────────────────────

    async fn qa_response(&self, request: &LlmRequest, scope: &EmitScope) -> LlmResponse {
        let model_id = "qa_stub";
        self.emit(
            scope,
            "llm_route_decided",
            "LLM route decided",
            json!({
                "route": Route::Local.as_str(),
                "reason": "qa_mode",
                "provider": "local",
                "model_id": model_id,
                "items_summary_by_source_type": summarize_items_by_source(&request.context_items),
            }),
        )
        .await;
        self.emit(
            scope,
            "llm_request_started",
            "LLM request started",
            json!({"provider": "local", "model_id": model_id}),
        )
        .await;
        let text = if request.json_schema.is_some() {
            "{\"qa_mode\": true}".to_string()
        } else if !request.messages.is_empty() {
            "QA mode: response stub.".to_string()
        } else {
            "QA mode".to_string()
        };
        let response = LlmResponse {
            text,
            usage: None,
            provider: "local".to_string(),
            model_id: Some(model_id.to_string()),
            latency_ms: 0,
            cache_hit: true,
            route_reason: "qa_mode".to_string(),
            status: LlmStatus::Ok,
            error_type: None,
            http_status: None,
            retry_count: 0,
            raw: None,
        };
        self.emit(
            scope,
            "llm_request_succeeded",
            "LLM request succeeded",
            json!({
                "provider": response.provider.clone(),
                "model_id": response.model_id.clone(),
                "latency_ms": response.latency_ms,
                "usage_if_available": response.usage.clone(),
                "cache_hit": true,
            }),
        )
        .await;
        response
    }

    // ── Cloud retry loop ───────────────────────────────────────────────

    async fn call_cloud_with_retry(
        &self,
        call: &ProviderCall,
        start: Instant,
        route_reason: &str,
    ) -> Result<LlmResponse, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            match self.cloud.chat(call).await {
                Ok(result) => {
                    return Ok(self.make_response(
                        result,
                        "cloud",
                        &call.model,
                        start,
                        route_reason,
                        attempt,
                    ));
                }
                Err(mut error) => {
                    let status = error.status_code.unwrap_or(0);
                    let retryable = status == 429 || status >= 500;
                    if !retryable || attempt >= self.config.max_retries {
                        error.retry_count = attempt;
                        return Err(error);
                    }
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// `base · 2^attempt + jitter ∈ [0, base)`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base_ms as f64 / 1000.0;
        let jitter = rand::random::<f64>() * base;
        Duration::from_secs_f64(base * 2f64.powi(attempt as i32) + jitter)
    }

    fn make_response(
        &self,
        result: ProviderResult,
        provider: &str,
        model_id: &str,
        start: Instant,
        route_reason: &str,
        retry_count: u32,
    ) -> LlmResponse {
        LlmResponse {
            text: result.text,
            usage: result.usage,
            provider: provider.to_string(),
            model_id: result.model_id.or_else(|| Some(model_id.to_string())),
            latency_ms: start.elapsed().as_millis() as i64,
            cache_hit: false,
            route_reason: route_reason.to_string(),
            status: LlmStatus::Ok,
            error_type: None,
            http_status: None,
            retry_count,
            raw: result.raw,
        }
    }

    // ── Cloud-financial approval ───────────────────────────────────────

    /// Creates a `CLOUD_FINANCIAL` approval, parks the task in
    /// `waiting_approval` and polls until the user (or run cancellation)
    /// resolves it. Returns true only on explicit approval.
    async fn request_cloud_approval(
        &self,
        scope: &EmitScope,
        decision: &RoutingDecision,
        items: &[ContextItem],
        flags: &PolicyFlags,
    ) -> Result<bool, BrainError> {
        let Some(approval_scope) = decision.required_approval.as_deref() else {
            return Ok(false);
        };
        let (Some(run_id), Some(task_id)) = (scope.run_id.as_deref(), scope.task_id.as_deref())
        else {
            // No task to suspend: nothing to approve against, stay local.
            return Ok(false);
        };

        let redaction = sanitize_context_items(items, true, flags);
        let files: Vec<Value> = items
            .iter()
            .filter(|item| item.source_type == SourceType::FileContent)
            .map(|item| json!({"source_type": item.source_type.as_str(), "provenance": item.provenance}))
            .collect();
        let preview = json!({
            "summary": "Отправка финансового файла в облачную модель",
            "details": {
                "files": files,
                "redaction_summary": redaction.removed_counts_by_source,
            },
            "risk": "Финансовые данные покинут устройство",
            "suggested_user_action": "Подтвердите отправку или отклоните",
            "expires_in_ms": null,
        });
        let proposed_actions = json!([{"action": "send_to_cloud", "scope": approval_scope}]);

        let approval = self
            .store
            .create_approval(
                run_id,
                task_id,
                scope.step_id.as_deref(),
                approval_scope,
                Some("CLOUD_FINANCIAL"),
                "Подтверждение отправки финансовых данных",
                "Требуется подтверждение на отправку финансового файла в облако.",
                proposed_actions,
                Some(preview.clone()),
            )
            .await?;

        self.emit(
            scope,
            "approval_requested",
            "Запрошено подтверждение",
            json!({
                "approval_id": approval.id.clone(),
                "approval_type": approval.approval_type.clone(),
                "step_id": approval.step_id.clone(),
                "scope": approval.scope.clone(),
                "title": approval.title.clone(),
                "description": approval.description.clone(),
                "preview_summary": preview.get("summary"),
            }),
        )
        .await;

        self.store
            .update_task_status(task_id, TaskStatus::WaitingApproval, None, None, None)
            .await?;
        self.emit(
            scope,
            "task_progress",
            "Ожидание подтверждения",
            json!({
                "task_id": task_id,
                "step_id": scope.step_id,
                "progress": {"current": 0, "total": 1, "unit": "подтверждение"},
                "last_message": "Ожидание подтверждения",
            }),
        )
        .await;

        let resolved = self.wait_for_approval(run_id, &approval.id).await?;
        if let Some(resolved) = &resolved {
            self.emit(
                scope,
                "approval_resolved",
                "Подтверждение рассмотрено",
                json!({
                    "approval_id": resolved.id.clone(),
                    "status": resolved.status,
                    "decision": resolved.decision.clone(),
                    "approval_type": resolved.approval_type.clone(),
                    "step_id": resolved.step_id.clone(),
                }),
            )
            .await;
        }

        let approved = resolved
            .as_ref()
            .map(|a| a.status == ApprovalStatus::Approved)
            .unwrap_or(false);
        if approved {
            self.emit(
                scope,
                "approval_approved",
                "Подтверждение принято",
                json!({"approval_id": resolved.as_ref().map(|a| a.id.clone())}),
            )
            .await;
        } else {
            self.emit(
                scope,
                "approval_rejected",
                "Подтверждение отклонено",
                json!({"approval_id": resolved.as_ref().map(|a| a.id.clone())}),
            )
            .await;
        }
        self.store
            .update_task_status(task_id, TaskStatus::Running, None, None, None)
            .await?;
        Ok(approved)
    }

    /// Polls the approval at a fixed cadence; run cancellation expires it
    /// on the system's behalf.
    async fn wait_for_approval(
        &self,
        run_id: &str,
        approval_id: &str,
    ) -> Result<Option<aura_types::Approval>, BrainError> {
        loop {
            let Some(approval) = self.store.get_approval(approval_id).await? else {
                return Ok(None);
            };
            if approval.status.is_terminal() {
                return Ok(Some(approval));
            }
            if let Some(run) = self.store.get_run(run_id).await? {
                if run.status == RunStatus::Canceled {
                    let expired = self
                        .store
                        .update_approval_status(approval_id, ApprovalStatus::Expired, "system", None)
                        .await?;
                    return Ok(expired);
                }
            }
            tokio::time::sleep(APPROVAL_POLL_INTERVAL).await;
        }
    }

    // ── Heuristics, model selection, messages ──────────────────────────

    fn auto_switch_reason(
        &self,
        request: &LlmRequest,
        items: &[ContextItem],
        run_id: Option<&str>,
        flags: &PolicyFlags,
    ) -> Option<String> {
        if !flags.auto_cloud_enabled || !flags.cloud_allowed {
            return None;
        }

        if matches!(
            request.task_kind.as_deref(),
            Some("heavy_writing") | Some("long_form") | Some("report")
        ) && items
            .iter()
            .all(|i| i.sensitivity == crate::routing::Sensitivity::Public)
        {
            return Some("heavy_writing".to_string());
        }

        if !items.is_empty()
            && items.iter().all(|i| i.source_type == SourceType::WebPageText)
            && items_length(items) >= 1200
        {
            return Some("web_page_text_long".to_string());
        }

        let key = (
            run_id.unwrap_or("").to_string(),
            request.preferred_model_kind.clone(),
        );
        let failures = *self
            .local_failures
            .lock()
            .expect("failures lock")
            .get(&key)
            .unwrap_or(&0);
        if failures >= 2 {
            return Some("local_failures".to_string());
        }
        if request.preferred_model_kind == "code" && failures >= 1 {
            return Some("code_local_failures".to_string());
        }
        None
    }

    fn select_model(&self, route: Route, kind: &str, ctx: &CallContext) -> String {
        match route {
            Route::Local => {
                if kind == "code" {
                    self.config.local_code_model.clone()
                } else {
                    self.config.local_chat_model.clone()
                }
            }
            Route::Cloud => ctx
                .settings
                .get("llm_cloud")
                .or_else(|| ctx.settings.get("llm"))
                .and_then(|cfg| cfg.get("model"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| self.config.cloud_model.clone()),
        }
    }

    fn build_messages(
        &self,
        request: &LlmRequest,
        items: &[ContextItem],
    ) -> Result<Vec<ChatMessage>, BrainError> {
        if let Some(render) = &request.render_messages {
            return Ok(render(items));
        }
        if !request.messages.is_empty() {
            return Ok(request.messages.clone());
        }
        Err(BrainError::Invalid(
            "LLMRequest requires messages or render_messages".to_string(),
        ))
    }

    // ── Cache and budgets ──────────────────────────────────────────────

    fn cache_key(
        &self,
        route: Route,
        model_id: &str,
        request: &LlmRequest,
        messages: &[ChatMessage],
    ) -> String {
        // serde_json maps are BTree-backed, so serialization is key-sorted
        // and deterministic.
        let payload = json!({
            "route": route.as_str(),
            "model": model_id,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "messages": messages.iter().map(|m| json!({"role": m.role.clone(), "content": m.content.clone()})).collect::<Vec<_>>(),
            "json_schema": request.json_schema,
            "tools": request.tools,
        });
        let mut hasher = Sha256::new();
        hasher.update(payload.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn cache_get(&self, run_id: Option<&str>, key: &str) -> Option<LlmResponse> {
        let run_id = run_id?;
        let cache = self.cache.lock().expect("cache lock");
        let cached = cache.get(run_id)?.get(key)?;
        let mut response = cached.clone();
        response.latency_ms = 0;
        response.cache_hit = true;
        Some(response)
    }

    fn cache_set(&self, run_id: Option<&str>, key: &str, response: &LlmResponse) {
        let Some(run_id) = run_id else { return };
        self.cache
            .lock()
            .expect("cache lock")
            .entry(run_id.to_string())
            .or_default()
            .insert(key.to_string(), response.clone());
    }

    fn check_budget(&self, run_id: &str, step_id: Option<&str>) -> Option<(&'static str, u32, u32)> {
        if let Some(limit) = self.config.budget_per_run {
            let current = *self
                .run_counts
                .lock()
                .expect("budget lock")
                .get(run_id)
                .unwrap_or(&0);
            if current >= limit {
                return Some(("per_run", limit, current));
            }
        }
        if let (Some(step_id), Some(limit)) = (step_id, self.config.budget_per_step) {
            let current = *self
                .step_counts
                .lock()
                .expect("budget lock")
                .get(&(run_id.to_string(), step_id.to_string()))
                .unwrap_or(&0);
            if current >= limit {
                return Some(("per_step", limit, current));
            }
        }
        None
    }

    fn increment_budget(&self, run_id: Option<&str>, step_id: Option<&str>) {
        let Some(run_id) = run_id else { return };
        *self
            .run_counts
            .lock()
            .expect("budget lock")
            .entry(run_id.to_string())
            .or_insert(0) += 1;
        if let Some(step_id) = step_id {
            *self
                .step_counts
                .lock()
                .expect("budget lock")
                .entry((run_id.to_string(), step_id.to_string()))
                .or_insert(0) += 1;
        }
    }

    // ── Local failure accounting ───────────────────────────────────────

    fn note_local_failure(&self, run_id: Option<&str>, kind: &str) {
        let key = (run_id.unwrap_or("").to_string(), kind.to_string());
        *self
            .local_failures
            .lock()
            .expect("failures lock")
            .entry(key)
            .or_insert(0) += 1;
    }

    fn note_local_result(&self, run_id: Option<&str>, kind: &str, response: &LlmResponse) {
        let key = (run_id.unwrap_or("").to_string(), kind.to_string());
        let mut failures = self.local_failures.lock().expect("failures lock");
        if response.text.trim().is_empty() {
            *failures.entry(key).or_insert(0) += 1;
        } else {
            failures.insert(key, 0);
        }
    }

    // ── Event emission ─────────────────────────────────────────────────

    async fn emit(&self, scope: &EmitScope, event_type: &str, message: &str, payload: Value) {
        let Some(run_id) = scope.run_id.as_deref() else {
            return;
        };
        if let Err(error) = self
            .bus
            .emit_scoped(
                run_id,
                event_type,
                message,
                payload,
                scope.task_id.as_deref(),
                scope.step_id.as_deref(),
            )
            .await
        {
            tracing::warn!(%error, event_type, "failed to append brain event");
        }
    }
}

struct EmitScope {
    run_id: Option<String>,
    task_id: Option<String>,
    step_id: Option<String>,
}
