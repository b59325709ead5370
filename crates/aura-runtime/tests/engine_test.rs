use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use aura_brain::{
    BrainConfig, BrainRouter, ChatProvider, ProviderCall, ProviderError, ProviderResult,
};
use aura_runtime::RunEngine;
use aura_skills::{NoopBridge, SkillRegistry};
use aura_store::Store;
use aura_types::{new_id, ApprovalStatus, PlanStep, Run, RunStatus, StepStatus, TaskStatus};

struct StubLocal {
    text: String,
}

#[async_trait]
impl ChatProvider for StubLocal {
    async fn chat(&self, _call: &ProviderCall) -> Result<ProviderResult, ProviderError> {
        Ok(ProviderResult {
            text: self.text.clone(),
            usage: None,
            raw: None,
            model_id: None,
        })
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

fn engine_with_store(base_dir: PathBuf, local_text: &str) -> (Arc<RunEngine>, Arc<Store>) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let local = Arc::new(StubLocal {
        text: local_text.to_string(),
    });
    let cloud = Arc::new(StubLocal {
        text: "cloud".to_string(),
    });
    let brain = Arc::new(BrainRouter::with_providers(
        test_config(&base_dir),
        store.clone(),
        local,
        cloud,
    ));
    let registry = Arc::new(SkillRegistry::builtin());
    let engine = Arc::new(RunEngine::new(
        store.clone(),
        brain,
        registry,
        Arc::new(NoopBridge),
        base_dir,
    ));
    (engine, store)
}

async fn make_run(store: &Store, mode: &str, meta: Value) -> Run {
    let project = store
        .create_project("Тестовый проект", vec![], json!({}))
        .await
        .unwrap();
    let run = store
        .create_run(&project.id, "сделай задачу", mode, None, None, meta)
        .await
        .unwrap();
    run
}

fn shell_step(run_id: &str) -> PlanStep {
    PlanStep {
        id: new_id(),
        run_id: run_id.to_string(),
        step_index: 0,
        title: "Команда оболочки".to_string(),
        skill_name: "shell".to_string(),
        inputs: json!({"command": "echo привет"}),
        depends_on: vec![],
        status: StepStatus::Created,
        kind: "COMPUTER_ACTIONS".to_string(),
        success_checks: vec![],
        danger_flags: vec![],
        requires_approval: true,
    }
}

/// Waits for a pending approval on the run and resolves it.
async fn resolve_next_pending(store: &Store, run_id: &str, status: ApprovalStatus) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let approvals = store.list_approvals(run_id).await.unwrap();
        if let Some(pending) = approvals.iter().find(|a| a.status == ApprovalStatus::Pending) {
            store
                .update_approval_status(&pending.id, status, "user", None)
                .await
                .unwrap();
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn plan_only_run_completes_immediately_and_start_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, store) = engine_with_store(tmp.path().to_path_buf(), "ок");
    let run = make_run(&store, "plan_only", json!({"intent": "CHAT"})).await;

    engine.start_run(&run.id).await.unwrap();
    let run_after = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run_after.status, RunStatus::Done);

    let events_before = store.list_events(&run.id, 100).await.unwrap().len();
    // Terminal run: a second start is a no-op.
    engine.start_run(&run.id).await.unwrap();
    let events_after = store.list_events(&run.id, 100).await.unwrap().len();
    assert_eq!(events_before, events_after);

    let types: Vec<String> = store
        .list_events(&run.id, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types, vec!["run_started", "run_done"]);
}

#[tokio::test]
async fn memory_commit_plan_executes_and_stores_fact() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, store) = engine_with_store(tmp.path().to_path_buf(), "ок");
    let run = make_run(
        &store,
        "execute_confirm",
        json!({
            "intent": "ACT",
            "plan_hint": ["MEMORY_COMMIT"],
            "memory_item": {
                "kind": "user_profile",
                "text": "Имя пользователя: Михаил.",
                "evidence": "Михаил",
            },
        }),
    )
    .await;

    let plan = engine.create_plan(&run).await.unwrap();
    assert_eq!(plan.len(), 1);
    engine.start_run(&run.id).await.unwrap();

    let run_after = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run_after.status, RunStatus::Done);

    let memories = store.list_user_memories(None, None, 10, false).await.unwrap();
    assert_eq!(memories.len(), 1);
    assert_eq!(memories[0].content, "Имя пользователя: Михаил.");

    let tasks = store.list_tasks(&run.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].attempt, 1);
    assert_eq!(tasks[0].status, TaskStatus::Done);
}

#[tokio::test]
async fn confirm_gated_skill_fails_outside_execute_confirm() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, store) = engine_with_store(tmp.path().to_path_buf(), "ок");
    let run = make_run(&store, "autopilot_safe", json!({"intent": "ACT"})).await;
    let step = shell_step(&run.id);
    store.insert_plan_steps(&run.id, &[step]).await.unwrap();

    engine.start_run(&run.id).await.unwrap();

    let run_after = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run_after.status, RunStatus::Failed);

    let tasks = store.list_tasks(&run.id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[0].error.as_deref(), Some("требуется_подтверждение"));

    let types: Vec<String> = store
        .list_events(&run.id, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(types.contains(&"task_failed".to_string()));
    assert!(types.contains(&"run_failed".to_string()));
}

#[tokio::test]
async fn approved_shell_run_retries_with_monotone_attempts() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, store) = engine_with_store(tmp.path().to_path_buf(), "ок");
    let run = make_run(&store, "execute_confirm", json!({"intent": "ACT"})).await;
    let step = shell_step(&run.id);
    store.insert_plan_steps(&run.id, &[step.clone()]).await.unwrap();

    // First execution suspends on the approval; approve it.
    let worker = {
        let engine = engine.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move { engine.start_run(&run_id).await })
    };
    let approved = resolve_next_pending(&store, &run.id, ApprovalStatus::Approved).await;
    assert!(approved, "no pending approval appeared");
    worker.await.unwrap().unwrap();
    assert_eq!(
        store.get_run(&run.id).await.unwrap().unwrap().status,
        RunStatus::Done
    );
    let first_task_id = store.list_tasks(&run.id).await.unwrap()[0].id.clone();

    // Retry the step and approve again.
    let retry_worker = {
        let engine = engine.clone();
        let run_id = run.id.clone();
        let step_id = step.id.clone();
        tokio::spawn(async move { engine.retry_step(&run_id, &step_id).await })
    };
    let approved = resolve_next_pending(&store, &run.id, ApprovalStatus::Approved).await;
    assert!(approved, "no pending approval appeared on retry");
    retry_worker.await.unwrap().unwrap();

    let attempts: Vec<i64> = store
        .list_tasks_for_step(&run.id, &step.id)
        .await
        .unwrap()
        .iter()
        .map(|t| t.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2]);

    let events = store.list_events(&run.id, 500).await.unwrap();
    let retried = events
        .iter()
        .find(|e| e.event_type == "task_retried")
        .expect("task_retried event");
    assert_eq!(
        retried.payload["previous_task_id"],
        json!(first_task_id)
    );
    assert_eq!(
        store.get_run(&run.id).await.unwrap().unwrap().status,
        RunStatus::Done
    );
}

#[tokio::test]
async fn rejected_approval_fails_step_and_run() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, store) = engine_with_store(tmp.path().to_path_buf(), "ок");
    let run = make_run(&store, "execute_confirm", json!({"intent": "ACT"})).await;
    let step = shell_step(&run.id);
    store.insert_plan_steps(&run.id, &[step]).await.unwrap();

    let worker = {
        let engine = engine.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move { engine.start_run(&run_id).await })
    };
    let rejected = resolve_next_pending(&store, &run.id, ApprovalStatus::Rejected).await;
    assert!(rejected);
    worker.await.unwrap().unwrap();

    let run_after = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run_after.status, RunStatus::Failed);
    let tasks = store.list_tasks(&run.id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[0].error.as_deref(), Some("approval_rejected"));
}

#[tokio::test]
async fn canceled_run_is_absorbing() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, store) = engine_with_store(tmp.path().to_path_buf(), "ок");
    let run = make_run(&store, "execute_confirm", json!({"intent": "ACT"})).await;

    engine.cancel_run(&run.id).await.unwrap();
    assert_eq!(
        store.get_run(&run.id).await.unwrap().unwrap().status,
        RunStatus::Canceled
    );

    // start_run on a canceled run is a no-op.
    engine.start_run(&run.id).await.unwrap();
    assert_eq!(
        store.get_run(&run.id).await.unwrap().unwrap().status,
        RunStatus::Canceled
    );

    // Retrying a canceled run is refused.
    let step = shell_step(&run.id);
    store.insert_plan_steps(&run.id, &[step.clone()]).await.unwrap();
    let error = engine.retry_step(&run.id, &step.id).await.unwrap_err();
    assert!(error.to_string().contains("Запуск отменён"));
}
