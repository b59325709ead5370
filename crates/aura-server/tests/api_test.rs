use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use aura_brain::{
    BrainConfig, BrainRouter, ChatProvider, ProviderCall, ProviderError, ProviderResult, Secrets,
};
use aura_server::{app_router, AppState};
use aura_store::Store;

/// Local-model stub keyed on the call's purpose; unknown purposes fail
/// like an unreachable Ollama.
struct PurposeStub {
    responses: HashMap<String, String>,
}

#[async_trait]
impl ChatProvider for PurposeStub {
    async fn chat(&self, call: &ProviderCall) -> Result<ProviderResult, ProviderError> {
        let purpose = call.purpose.clone().unwrap_or_default();
        match self.responses.get(&purpose) {
            Some(text) => Ok(ProviderResult {
                text: text.clone(),
                usage: None,
                raw: None,
                model_id: Some(call.model.clone()),
            }),
            None => Err(ProviderError::new(
                "local",
                "connection_error",
                "stub has no response for this purpose",
            )),
        }
    }
}

struct DeadStub;

#[async_trait]
impl ChatProvider for DeadStub {
    async fn chat(&self, _call: &ProviderCall) -> Result<ProviderResult, ProviderError> {
        Err(ProviderError::new(
            "local",
            "connection_error",
            "Local LLM request failed: connection refused",
        ))
    }
}

fn test_config(base_dir: &std::path::Path) -> BrainConfig {
    BrainConfig {
        local_base_url: "http://127.0.0.1:11434".to_string(),
        local_chat_model: "chat-model".to_string(),
        local_code_model: "code-model".to_string(),
        local_timeout_s: 5,
        cloud_base_url: "https://cloud.example".to_string(),
        cloud_model: "cloud-model".to_string(),
        cloud_timeout_s: 5,
        cloud_enabled: false,
        auto_cloud_enabled: false,
        cloud_enabled_override: false,
        auto_cloud_override: false,
        max_concurrency: 2,
        max_retries: 0,
        backoff_base_ms: 1,
        budget_per_run: None,
        budget_per_step: None,
        qa_mode: false,
        artifact_dir: base_dir.join("artifacts"),
    }
}

struct TestApp {
    router: Router,
    store: Arc<Store>,
    token: String,
    _tmp: tempfile::TempDir,
}

impl TestApp {
    fn new(local: Arc<dyn ChatProvider>) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cloud: Arc<dyn ChatProvider> = Arc::new(DeadStub);
        let brain = Arc::new(BrainRouter::with_providers(
            test_config(tmp.path()),
            store.clone(),
            local,
            cloud,
        ));
        let secrets = Arc::new(Secrets::new());
        let state = AppState::with_brain(
            store.clone(),
            brain,
            secrets,
            tmp.path().to_path_buf(),
            false,
        );
        Self {
            router: app_router(state),
            store,
            token: "test-token".to_string(),
            _tmp: tmp,
        }
    }

    async fn request(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.request_raw(method, uri, body, true).await
    }

    async fn request_raw(
        &self,
        method: &str,
        uri: &str,
        body: Option<Value>,
        with_auth: bool,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if with_auth {
            builder = builder.header("Authorization", format!("Bearer {}", self.token));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn request_text(&self, uri: &str, extra_header: Option<(&str, &str)>) -> (StatusCode, String) {
        let mut builder = Request::builder()
            .method("GET")
            .uri(uri)
            .header("Authorization", format!("Bearer {}", self.token));
        if let Some((name, value)) = extra_header {
            builder = builder.header(name, value);
        }
        let response = self
            .router
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn bootstrap(&self) {
        let (status, _) = self
            .request_raw(
                "POST",
                "/api/v1/auth/bootstrap",
                Some(json!({"token": self.token})),
                false,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    async fn create_project(&self) -> String {
        let (status, body) = self
            .request("POST", "/api/v1/projects", Some(json!({"name": "P"})))
            .await;
        assert_eq!(status, StatusCode::OK);
        body["id"].as_str().unwrap().to_string()
    }
}

fn chat_stub_with_memory() -> Arc<dyn ChatProvider> {
    let semantic = json!({
        "intent": "CHAT",
        "confidence": 0.92,
        "memory_item": {
            "kind": "user_profile",
            "text": "Имя пользователя: Михаил.",
            "evidence": "меня Михаил зовут",
        },
        "plan_hint": ["CHAT_RESPONSE"],
        "response_style_hint": null,
        "user_visible_note": null,
    });
    let interpretation = json!({
        "should_store": true,
        "confidence": 0.9,
        "facts": [
            {"key": "user.name", "value": "Михаил", "confidence": 0.95, "evidence": "меня Михаил зовут"}
        ],
        "preferences": [],
        "title": "Профиль пользователя",
        "summary": "Пользователь представился как Михаил",
        "possible_facts": [],
    });
    let mut responses = HashMap::new();
    responses.insert("semantic_decision".to_string(), semantic.to_string());
    responses.insert("memory_interpreter".to_string(), interpretation.to_string());
    responses.insert("chat_response".to_string(), "Привет, Михаил!".to_string());
    Arc::new(PurposeStub { responses })
}

#[tokio::test]
async fn bootstrap_is_idempotent_and_conflicts_on_mismatch() {
    let app = TestApp::new(chat_stub_with_memory());

    let (status, body) = app
        .request_raw(
            "POST",
            "/api/v1/auth/bootstrap",
            Some(json!({"token": "test-token"})),
            false,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("создано"));

    let (status, body) = app
        .request_raw(
            "POST",
            "/api/v1/auth/bootstrap",
            Some(json!({"token": "test-token"})),
            false,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ок"));

    let (status, _) = app
        .request_raw(
            "POST",
            "/api/v1/auth/bootstrap",
            Some(json!({"token": "другой"})),
            false,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = app
        .request_raw("GET", "/api/v1/auth/status", None, false)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["initialized"], json!(true));
}

#[tokio::test]
async fn requests_without_token_are_rejected() {
    let app = TestApp::new(chat_stub_with_memory());
    app.bootstrap().await;

    let (status, _) = app
        .request_raw("GET", "/api/v1/projects", None, false)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut builder = Request::builder().method("GET").uri("/api/v1/projects");
    builder = builder.header("Authorization", "Bearer неправильный");
    let response = app
        .router
        .clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn chat_introduction_stores_exactly_one_memory() {
    let app = TestApp::new(chat_stub_with_memory());
    app.bootstrap().await;
    let project_id = app.create_project().await;

    let (status, body) = app
        .request(
            "POST",
            &format!("/api/v1/projects/{project_id}/runs"),
            Some(json!({"query_text": "кстати меня Михаил зовут", "mode": "plan_only"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], json!("chat"));
    assert_eq!(body["run"]["meta"]["intent"], json!("CHAT"));
    assert_eq!(body["chat_response"], json!("Привет, Михаил!"));

    let memories = app.store.list_user_memories(None, None, 50, false).await.unwrap();
    assert_eq!(memories.len(), 1);
    assert_eq!(memories[0].content, "Пользователь представился как Михаил.");
    assert_eq!(memories[0].source, "auto");
}

#[tokio::test]
async fn semantic_failure_degrades_to_chat_without_5xx() {
    let app = TestApp::new(Arc::new(DeadStub));
    app.bootstrap().await;
    let project_id = app.create_project().await;

    let (status, body) = app
        .request(
            "POST",
            &format!("/api/v1/projects/{project_id}/runs"),
            Some(json!({"query_text": "Сколько будет 2+2?", "mode": "plan_only"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], json!("chat"));
    assert_eq!(body["run"]["meta"]["intent_path"], json!("semantic_resilience"));
    assert!(body["chat_response"]
        .as_str()
        .unwrap()
        .contains("Локальная модель"));

    let run_id = body["run"]["id"].as_str().unwrap();
    let types: Vec<String> = app
        .store
        .list_events(run_id, 200)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(types.contains(&"llm_request_failed".to_string()));
    assert!(!types.contains(&"run_failed".to_string()));
}

#[tokio::test]
async fn reminder_created_via_api_is_claimed_once()
{
    let app = TestApp::new(chat_stub_with_memory());
    app.bootstrap().await;

    let (status, body) = app
        .request(
            "POST",
            "/api/v1/reminders/create",
            Some(json!({"due_at": "2024-01-01T11:59:00Z", "text": "попить воды"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("pending"));
    assert_eq!(body["delivery"], json!("local"));

    let claimed = app
        .store
        .claim_due_reminders("2024-01-01T12:00:00Z", 20)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].text, "попить воды");
    assert_eq!(claimed[0].attempts, 1);
    assert_eq!(claimed[0].status, aura_types::ReminderStatus::Sending);

    let again = app
        .store
        .claim_due_reminders("2024-01-01T12:00:00Z", 20)
        .await
        .unwrap();
    assert!(again.is_empty());
}

fn sse_ids(body: &str) -> Vec<i64> {
    body.lines()
        .filter_map(|line| line.strip_prefix("id: "))
        .filter_map(|raw| raw.trim().parse().ok())
        .collect()
}

#[tokio::test]
async fn sse_stream_resumes_after_last_event_id() {
    let app = TestApp::new(chat_stub_with_memory());
    app.bootstrap().await;
    let project_id = app.create_project().await;

    let (_, body) = app
        .request(
            "POST",
            &format!("/api/v1/projects/{project_id}/runs"),
            Some(json!({"query_text": "кстати меня Михаил зовут", "mode": "plan_only"})),
        )
        .await;
    let run_id = body["run"]["id"].as_str().unwrap().to_string();

    let (status, first_batch) = app
        .request_text(&format!("/api/v1/runs/{run_id}/events?once=1"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let ids = sse_ids(&first_batch);
    assert!(ids.len() >= 2, "expected several events, got {ids:?}");
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    // Resume from somewhere in the middle.
    let resume_from = ids[ids.len() / 2];
    let (status, second_batch) = app
        .request_text(
            &format!("/api/v1/runs/{run_id}/events?once=1"),
            Some(("Last-Event-ID", &resume_from.to_string())),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let resumed = sse_ids(&second_batch);
    assert!(!resumed.is_empty());
    assert!(resumed.iter().all(|seq| *seq > resume_from));
}

#[tokio::test]
async fn snapshot_contains_consistent_collections_and_metrics() {
    let app = TestApp::new(chat_stub_with_memory());
    app.bootstrap().await;
    let project_id = app.create_project().await;

    let (_, body) = app
        .request(
            "POST",
            &format!("/api/v1/projects/{project_id}/runs"),
            Some(json!({"query_text": "кстати меня Михаил зовут", "mode": "plan_only"})),
        )
        .await;
    let run_id = body["run"]["id"].as_str().unwrap().to_string();

    let (status, snapshot) = app
        .request("GET", &format!("/api/v1/runs/{run_id}/snapshot"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["run"]["id"], json!(run_id));
    for key in ["plan", "tasks", "sources", "facts", "conflicts", "artifacts", "approvals", "last_events"] {
        assert!(snapshot[key].is_array(), "snapshot missing {key}");
    }
    assert!(snapshot["metrics"]["coverage"]["total"].is_number());

    let (status, _) = app
        .request("GET", "/api/v1/runs/нет-такого/snapshot", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn act_run_creates_plan_and_executes_on_start() {
    let semantic = json!({
        "intent": "ACT",
        "confidence": 0.9,
        "memory_item": {
            "kind": "user_profile",
            "text": "Имя пользователя: Михаил.",
            "evidence": "я Михаил",
        },
        "plan_hint": ["MEMORY_COMMIT"],
        "response_style_hint": null,
        "user_visible_note": null,
    });
    let interpretation = json!({
        "should_store": false,
        "confidence": 0.2,
        "facts": [],
        "preferences": [],
        "title": "Профиль пользователя",
        "summary": "Ничего нового",
        "possible_facts": [],
    });
    let mut responses = HashMap::new();
    responses.insert("semantic_decision".to_string(), semantic.to_string());
    responses.insert("memory_interpreter".to_string(), interpretation.to_string());
    let app = TestApp::new(Arc::new(PurposeStub { responses }));
    app.bootstrap().await;
    let project_id = app.create_project().await;

    let (status, body) = app
        .request(
            "POST",
            &format!("/api/v1/projects/{project_id}/runs"),
            Some(json!({"query_text": "запомни, я Михаил", "mode": "execute_confirm"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], json!("act"));
    let plan = body["plan"].as_array().unwrap();
    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0]["kind"], json!("MEMORY_COMMIT"));
    let run_id = body["run"]["id"].as_str().unwrap().to_string();
    // ACT with a text-only hint upgrades to the confirm-gated mode.
    assert_eq!(body["run"]["mode"], json!("execute_confirm"));

    let (status, body) = app
        .request("POST", &format!("/api/v1/runs/{run_id}/start"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("запущено"));

    // The background worker completes the single memory step.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let run = app.store.get_run(&run_id).await.unwrap().unwrap();
        if run.status == aura_types::RunStatus::Done {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run did not finish, status {:?}",
            run.status
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    let memories = app.store.list_user_memories(None, None, 50, false).await.unwrap();
    assert_eq!(memories.len(), 1);
}

#[tokio::test]
async fn clarify_intent_returns_questions() {
    let semantic = json!({
        "intent": "ASK_CLARIFY",
        "confidence": 0.5,
        "memory_item": null,
        "plan_hint": ["CLARIFY_QUESTION"],
        "response_style_hint": null,
        "user_visible_note": "Что именно нужно сделать?",
    });
    let interpretation = json!({
        "should_store": false,
        "confidence": 0.1,
        "facts": [],
        "preferences": [],
        "title": "Профиль пользователя",
        "summary": "Ничего",
        "possible_facts": [],
    });
    let mut responses = HashMap::new();
    responses.insert("semantic_decision".to_string(), semantic.to_string());
    responses.insert("memory_interpreter".to_string(), interpretation.to_string());
    let app = TestApp::new(Arc::new(PurposeStub { responses }));
    app.bootstrap().await;
    let project_id = app.create_project().await;

    let (status, body) = app
        .request(
            "POST",
            &format!("/api/v1/projects/{project_id}/runs"),
            Some(json!({"query_text": "сделай это", "mode": "research"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], json!("clarify"));
    assert_eq!(body["questions"], json!(["Что именно нужно сделать?"]));
    assert_eq!(body["run"]["mode"], json!("plan_only"));

    let run_id = body["run"]["id"].as_str().unwrap();
    let types: Vec<String> = app
        .store
        .list_events(run_id, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(types.contains(&"clarify_requested".to_string()));
    assert!(types.contains(&"intent_decided".to_string()));
}
