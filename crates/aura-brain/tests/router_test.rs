use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use aura_brain::{
    BrainConfig, BrainRouter, CallContext, ChatProvider, ContextItem, LlmRequest, LlmStatus,
    ProviderCall, ProviderError, ProviderResult, Sensitivity, SourceType,
};
use aura_store::Store;

fn test_config() -> BrainConfig {
    BrainConfig {
        local_base_url: "http://127.0.0.1:11434".to_string(),
        local_chat_model: "chat-model".to_string(),
        local_code_model: "code-model".to_string(),
        local_timeout_s: 5,
        cloud_base_url: "https://cloud.example".to_string(),
        cloud_model: "cloud-model".to_string(),
        cloud_timeout_s: 5,
        cloud_enabled: true,
        auto_cloud_enabled: true,
        cloud_enabled_override: false,
        auto_cloud_override: false,
        max_concurrency: 1,
        max_retries: 3,
        backoff_base_ms: 1,
        budget_per_run: None,
        budget_per_step: None,
        qa_mode: false,
        artifact_dir: PathBuf::from("artifacts"),
    }
}

struct StubProvider {
    calls: AtomicU32,
    /// Per-call scripted outcomes; once exhausted, keeps returning the
    /// last one.
    script: Mutex<Vec<Result<String, (u16, &'static str)>>>,
    delay: Option<Duration>,
    log: Option<Arc<Mutex<Vec<&'static str>>>>,
    label: &'static str,
    provider: &'static str,
}

impl StubProvider {
    fn ok(provider: &'static str, text: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            script: Mutex::new(vec![Ok(text.to_string())]),
            delay: None,
            log: None,
            label: "stub",
            provider,
        })
    }

    fn scripted(
        provider: &'static str,
        script: Vec<Result<String, (u16, &'static str)>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            script: Mutex::new(script),
            delay: None,
            log: None,
            label: "stub",
            provider,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for StubProvider {
    async fn chat(&self, _call: &ProviderCall) -> Result<ProviderResult, ProviderError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        if let Some(log) = &self.log {
            log.lock().unwrap().push(self.label);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let script = self.script.lock().unwrap();
        let outcome = script
            .get(index)
            .or_else(|| script.last())
            .cloned()
            .unwrap_or_else(|| Ok("ok".to_string()));
        match outcome {
            Ok(text) => Ok(ProviderResult {
                text,
                usage: None,
                raw: None,
                model_id: None,
            }),
            Err((status, error_type)) => {
                let mut error = ProviderError::new(self.provider, error_type, "stubbed failure");
                error.status_code = Some(status);
                Err(error)
            }
        }
    }
}

fn cloud_settings() -> serde_json::Value {
    json!({"privacy": {"auto_cloud_enabled": true, "cloud_allowed": true}})
}

fn user_prompt_request(run_id: &str, text: &str) -> LlmRequest {
    let mut request = LlmRequest::new("test");
    request.run_id = Some(run_id.to_string());
    request.messages = vec![aura_brain::ChatMessage::user(text)];
    request.context_items = vec![ContextItem::text(
        text,
        SourceType::UserPrompt,
        Sensitivity::Personal,
    )];
    request
}

async fn event_types(store: &Store, run_id: &str) -> Vec<String> {
    store
        .list_events(run_id, 500)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[tokio::test]
async fn local_call_emits_exact_event_sequence() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let local = StubProvider::ok("local", "ответ");
    let cloud = StubProvider::ok("cloud", "cloud");
    let router =
        BrainRouter::with_providers(test_config(), store.clone(), local.clone(), cloud);

    let request = user_prompt_request("run-seq", "привет");
    let response = router
        .call(&request, &CallContext::default())
        .await
        .unwrap();
    assert_eq!(response.text, "ответ");
    assert_eq!(response.provider, "local");
    assert_eq!(response.status, LlmStatus::Ok);

    let types = event_types(&store, "run-seq").await;
    assert_eq!(
        types,
        vec!["llm_route_decided", "llm_request_started", "llm_request_succeeded"]
    );
    assert_eq!(local.calls(), 1);
}

#[tokio::test]
async fn telegram_context_forces_local_and_drops_item() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let local = StubProvider::ok("local", "ок");
    let cloud = StubProvider::ok("cloud", "нет");
    let router =
        BrainRouter::with_providers(test_config(), store.clone(), local, cloud.clone());

    let seen_items: Arc<Mutex<usize>> = Arc::new(Mutex::new(usize::MAX));
    let seen = seen_items.clone();
    let mut request = LlmRequest::new("test");
    request.run_id = Some("run-tg".to_string());
    request.context_items = vec![
        ContextItem::text("из телеграма", SourceType::TelegramText, Sensitivity::Personal),
        ContextItem::text("со страницы", SourceType::WebPageText, Sensitivity::Public),
    ];
    request.render_messages = Some(Arc::new(move |items: &[ContextItem]| {
        *seen.lock().unwrap() = items.len();
        vec![aura_brain::ChatMessage::user("привет")]
    }));

    let ctx = CallContext {
        settings: cloud_settings(),
        ..Default::default()
    };
    router.call(&request, &ctx).await.unwrap();

    let events = store.list_events("run-tg", 100).await.unwrap();
    let decided = events
        .iter()
        .find(|e| e.event_type == "llm_route_decided")
        .unwrap();
    assert_eq!(decided.payload["route"], "LOCAL");
    assert_eq!(decided.payload["reason"], "telegram_text_present");
    assert_eq!(
        decided.payload["items_summary_by_source_type"]["telegram_text"],
        1
    );

    let sanitized = events
        .iter()
        .find(|e| e.event_type == "llm_request_sanitized")
        .unwrap();
    assert_eq!(
        sanitized.payload["removed_counts_by_source_type"]["telegram_text"],
        1
    );
    // The telegram item was dropped before messages were rendered.
    assert_eq!(*seen_items.lock().unwrap(), 1);
    assert_eq!(cloud.calls(), 0);
}

#[tokio::test]
async fn cloud_retries_on_429_with_backoff() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let local = StubProvider::ok("local", "local");
    let cloud = StubProvider::scripted(
        "cloud",
        vec![
            Err((429, "http_error")),
            Err((500, "http_error")),
            Ok("облачный ответ".to_string()),
        ],
    );
    let router =
        BrainRouter::with_providers(test_config(), store.clone(), local, cloud.clone());

    let mut request = user_prompt_request("run-retry", "найди");
    request.context_items = vec![ContextItem::text(
        "веб-текст",
        SourceType::WebPageText,
        Sensitivity::Public,
    )];
    let ctx = CallContext {
        settings: cloud_settings(),
        ..Default::default()
    };
    let response = router.call(&request, &ctx).await.unwrap();
    assert_eq!(response.text, "облачный ответ");
    assert_eq!(response.provider, "cloud");
    assert_eq!(response.retry_count, 2);
    assert_eq!(cloud.calls(), 3);
}

#[tokio::test]
async fn non_retryable_cloud_error_surfaces_immediately() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let local = StubProvider::ok("local", "local");
    let cloud = StubProvider::scripted("cloud", vec![Err((401, "http_error"))]);
    let router =
        BrainRouter::with_providers(test_config(), store.clone(), local, cloud.clone());

    let mut request = user_prompt_request("run-401", "найди");
    request.context_items = vec![ContextItem::text(
        "веб-текст",
        SourceType::WebPageText,
        Sensitivity::Public,
    )];
    let ctx = CallContext {
        settings: cloud_settings(),
        ..Default::default()
    };
    let error = router.call(&request, &ctx).await.unwrap_err();
    assert!(error.to_string().contains("stubbed failure"));
    assert_eq!(cloud.calls(), 1);

    let types = event_types(&store, "run-401").await;
    assert!(types.contains(&"llm_request_failed".to_string()));
    assert!(!types.contains(&"llm_request_succeeded".to_string()));
}

#[tokio::test]
async fn budget_exactly_at_limit_stops_next_call() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let local = StubProvider::ok("local", "ответ");
    let cloud = StubProvider::ok("cloud", "cloud");
    let mut config = test_config();
    config.budget_per_run = Some(1);
    let router = BrainRouter::with_providers(config, store.clone(), local.clone(), cloud);

    let request = user_prompt_request("run-budget", "раз");
    let first = router
        .call(&request, &CallContext::default())
        .await
        .unwrap();
    assert_eq!(first.status, LlmStatus::Ok);

    let request = user_prompt_request("run-budget", "два");
    let second = router
        .call(&request, &CallContext::default())
        .await
        .unwrap();
    assert_eq!(second.status, LlmStatus::BudgetExceeded);
    assert_eq!(second.error_type.as_deref(), Some("budget_exceeded"));
    // Provider was not touched by the rejected call.
    assert_eq!(local.calls(), 1);

    let types = event_types(&store, "run-budget").await;
    assert!(types.contains(&"llm_budget_exceeded".to_string()));
}

#[tokio::test]
async fn per_run_cache_returns_identical_response() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let local = StubProvider::ok("local", "закэшировано");
    let cloud = StubProvider::ok("cloud", "cloud");
    let router = BrainRouter::with_providers(test_config(), store.clone(), local.clone(), cloud);

    let request = user_prompt_request("run-cache", "одно и то же");
    let first = router
        .call(&request, &CallContext::default())
        .await
        .unwrap();
    assert!(!first.cache_hit);
    let second = router
        .call(&request, &CallContext::default())
        .await
        .unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.latency_ms, 0);
    assert_eq!(second.text, first.text);
    assert_eq!(local.calls(), 1);
}

#[tokio::test]
async fn sanitized_empty_context_falls_back_to_local() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let local = StubProvider::ok("local", "локальный ответ");
    let cloud = StubProvider::ok("cloud", "cloud");
    let router =
        BrainRouter::with_providers(test_config(), store.clone(), local.clone(), cloud.clone());

    let mut request = LlmRequest::new("test");
    request.run_id = Some("run-empty".to_string());
    request.messages = vec![aura_brain::ChatMessage::user("пусто")];
    request.context_items = vec![ContextItem::text(
        "",
        SourceType::WebPageText,
        Sensitivity::Public,
    )];
    let ctx = CallContext {
        settings: cloud_settings(),
        ..Default::default()
    };
    let response = router.call(&request, &ctx).await.unwrap();
    assert_eq!(response.provider, "local");
    assert_eq!(response.route_reason, "sanitized_empty_fallback");
    assert_eq!(cloud.calls(), 0);
    assert_eq!(local.calls(), 1);

    let events = store.list_events("run-empty", 100).await.unwrap();
    let decided = events
        .iter()
        .find(|e| e.event_type == "llm_route_decided")
        .unwrap();
    assert_eq!(decided.payload["route"], "LOCAL");
    assert_eq!(decided.payload["reason"], "sanitized_empty_fallback");
}

#[tokio::test]
async fn qa_mode_short_circuits_without_provider_call() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let local = StubProvider::ok("local", "real");
    let cloud = StubProvider::ok("cloud", "real");
    let mut config = test_config();
    config.qa_mode = true;
    let router =
        BrainRouter::with_providers(config, store.clone(), local.clone(), cloud.clone());

    let mut request = user_prompt_request("run-qa", "что угодно");
    request.json_schema = Some(json!({"type": "object"}));
    let response = router
        .call(&request, &CallContext::default())
        .await
        .unwrap();
    assert_eq!(response.text, "{\"qa_mode\": true}");
    assert_eq!(response.route_reason, "qa_mode");
    assert_eq!(local.calls(), 0);
    assert_eq!(cloud.calls(), 0);

    let types = event_types(&store, "run-qa").await;
    assert_eq!(
        types,
        vec!["llm_route_decided", "llm_request_started", "llm_request_succeeded"]
    );
}

#[tokio::test]
async fn queue_is_fifo_under_contention() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let slow = Arc::new(StubProvider {
        calls: AtomicU32::new(0),
        script: Mutex::new(vec![Ok("ok".to_string())]),
        delay: Some(Duration::from_millis(50)),
        log: Some(order.clone()),
        label: "call",
        provider: "local",
    });
    let cloud = StubProvider::ok("cloud", "cloud");
    let router = Arc::new(BrainRouter::with_providers(
        test_config(),
        store.clone(),
        slow.clone(),
        cloud,
    ));

    let mut handles = Vec::new();
    for i in 0..3 {
        let router = router.clone();
        let request = user_prompt_request("run-queue", &format!("запрос {i}"));
        handles.push(tokio::spawn(async move {
            router.call(&request, &CallContext::default()).await.unwrap()
        }));
        // Give each task a chance to reach the queue in order.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // max_concurrency=1: all three ran, strictly one at a time.
    assert_eq!(slow.calls(), 3);
    let started = store
        .list_events("run-queue", 500)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == "llm_request_started")
        .count();
    assert_eq!(started, 3);
}

#[tokio::test]
async fn local_failures_flip_route_to_cloud() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let local = StubProvider::scripted(
        "local",
        vec![Err((500, "http_error")), Err((500, "http_error"))],
    );
    let cloud = StubProvider::ok("cloud", "облако подхватило");
    let router =
        BrainRouter::with_providers(test_config(), store.clone(), local.clone(), cloud.clone());

    let ctx = CallContext {
        settings: cloud_settings(),
        ..Default::default()
    };
    // Two local failures for (run, chat)...
    for i in 0..2 {
        let request = user_prompt_request("run-flip", &format!("попытка {i}"));
        let _ = router.call(&request, &ctx).await;
    }
    assert_eq!(local.calls(), 2);

    // ...and the third call auto-switches to the cloud.
    let request = user_prompt_request("run-flip", "третья попытка");
    let response = router.call(&request, &ctx).await.unwrap();
    assert_eq!(response.provider, "cloud");
    assert_eq!(response.route_reason, "local_failures");
    assert_eq!(cloud.calls(), 1);
}
