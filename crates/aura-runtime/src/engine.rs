use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use serde_json::{json, Value};

use aura_brain::BrainRouter;
use aura_core::planner;
use aura_skills::{DesktopBridge, SkillContext, SkillRegistry, SkillRunner};
use aura_store::{EventBus, Store};
use aura_types::{
    new_id, now_iso, Artifact, Conflict, Fact, PlanStep, Run, RunStatus, SkillResult, Source,
    StepStatus, Task, TaskStatus,
};

/// Drives plan execution: creates tasks with monotone attempts, enforces
/// the manifest scope gate, persists skill results and keeps the run
/// status in sync with its steps. Step execution is strictly sequential
/// and cancellation is observed cooperatively between steps.
pub struct RunEngine {
    store: Arc<Store>,
    bus: EventBus,
    brain: Arc<BrainRouter>,
    registry: Arc<SkillRegistry>,
    runner: SkillRunner,
    bridge: Arc<dyn DesktopBridge>,
    base_dir: PathBuf,
}

impl RunEngine {
    pub fn new(
        store: Arc<Store>,
        brain: Arc<BrainRouter>,
        registry: Arc<SkillRegistry>,
        bridge: Arc<dyn DesktopBridge>,
        base_dir: PathBuf,
    ) -> Self {
        let bus = EventBus::new(store.clone());
        let runner = SkillRunner::new(registry.clone());
        Self {
            store,
            bus,
            brain,
            registry,
            runner,
            bridge,
            base_dir,
        }
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    /// Skill context with no live task/step, for skills invoked outside
    /// plan execution (e.g. the chat flow's best-effort memory save).
    pub fn placeholder_context(&self, run: &Run, settings: Value) -> SkillContext {
        let empty_step = PlanStep {
            id: String::new(),
            run_id: run.id.clone(),
            step_index: 0,
            title: String::new(),
            skill_name: String::new(),
            inputs: json!({}),
            depends_on: vec![],
            status: StepStatus::Created,
            kind: String::new(),
            success_checks: vec![],
            danger_flags: vec![],
            requires_approval: false,
        };
        let empty_task = Task {
            id: String::new(),
            run_id: run.id.clone(),
            plan_step_id: String::new(),
            attempt: 0,
            status: TaskStatus::Queued,
            started_at: None,
            finished_at: None,
            error: None,
            duration_ms: None,
        };
        SkillContext {
            run: run.clone(),
            plan_step: empty_step,
            task: empty_task,
            settings,
            base_dir: self.base_dir.clone(),
            store: self.store.clone(),
            bus: self.bus.clone(),
            brain: self.brain.clone(),
            bridge: self.bridge.clone(),
        }
    }

    async fn emit(&self, run_id: &str, event_type: &str, message: &str, payload: Value) {
        if let Err(error) = self.bus.emit(run_id, event_type, message, payload).await {
            tracing::warn!(%error, event_type, "failed to append engine event");
        }
    }

    async fn emit_error(&self, run_id: &str, event_type: &str, message: &str, payload: Value) {
        if let Err(error) = self.bus.emit_error(run_id, event_type, message, payload).await {
            tracing::warn!(%error, event_type, "failed to append engine event");
        }
    }

    /// Builds and atomically persists the plan for a run.
    pub async fn create_plan(&self, run: &Run) -> anyhow::Result<Vec<PlanStep>> {
        let steps = planner::create_plan_for_run(run)?;
        self.store.insert_plan_steps(&run.id, &steps).await?;
        self.emit(
            &run.id,
            "plan_created",
            "План создан",
            json!({"steps_count": steps.len()}),
        )
        .await;
        Ok(steps)
    }

    /// Detached background worker for one run. Errors never reach the
    /// HTTP handler that accepted the run.
    pub fn spawn_start(self: &Arc<Self>, run_id: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(error) = engine.start_run(&run_id).await {
                tracing::error!(%error, %run_id, "run worker failed");
            }
        });
    }

    /// Idempotent: a run that is already running, paused or terminal is
    /// left untouched.
    pub async fn start_run(&self, run_id: &str) -> anyhow::Result<()> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| anyhow!("Запуск не найден"))?;

        if run.status != RunStatus::Created {
            return Ok(());
        }

        let settings = match self.store.get_project(&run.project_id).await? {
            Some(project) => project.settings,
            None => json!({}),
        };

        self.store
            .update_run_status(run_id, RunStatus::Running, Some(now_iso()), None)
            .await?;
        self.emit(run_id, "run_started", "Запуск начат", json!({"mode": run.mode.clone()}))
            .await;

        if run.mode == "plan_only" {
            self.store
                .update_run_status(run_id, RunStatus::Done, None, Some(now_iso()))
                .await?;
            self.emit(
                run_id,
                "run_done",
                "Запуск завершён (только план)",
                json!({"status": "done"}),
            )
            .await;
            return Ok(());
        }

        let steps = self.store.list_plan_steps(run_id).await?;
        for step in &steps {
            let current = self
                .store
                .get_run(run_id)
                .await?
                .ok_or_else(|| anyhow!("Запуск не найден"))?;
            if current.status == RunStatus::Canceled {
                self.emit(run_id, "run_canceled", "Запуск отменён", json!({})).await;
                return Ok(());
            }
            if let Err(error) = self.execute_step(&current, step, None, &settings).await {
                self.store
                    .update_run_status(run_id, RunStatus::Failed, None, Some(now_iso()))
                    .await?;
                self.emit_error(
                    run_id,
                    "run_failed",
                    "Запуск завершён с ошибкой",
                    json!({"error": error.to_string()}),
                )
                .await;
                return Ok(());
            }
        }

        let current = self.store.get_run(run_id).await?;
        if current.map(|r| r.status) == Some(RunStatus::Canceled) {
            self.emit(run_id, "run_canceled", "Запуск отменён", json!({})).await;
            return Ok(());
        }
        self.store
            .update_run_status(run_id, RunStatus::Done, None, Some(now_iso()))
            .await?;
        self.emit(run_id, "run_done", "Запуск завершён", json!({"status": "done"}))
            .await;
        Ok(())
    }

    pub async fn cancel_run(&self, run_id: &str) -> anyhow::Result<()> {
        self.store
            .update_run_status(run_id, RunStatus::Canceled, None, Some(now_iso()))
            .await?;
        self.emit(run_id, "run_canceled", "Запуск отменён", json!({})).await;
        Ok(())
    }

    pub async fn pause_run(&self, run_id: &str) -> anyhow::Result<()> {
        self.store
            .update_run_status(run_id, RunStatus::Paused, None, None)
            .await?;
        self.emit(run_id, "run_paused", "Запуск на паузе", json!({})).await;
        Ok(())
    }

    pub async fn resume_run(&self, run_id: &str) -> anyhow::Result<()> {
        self.store
            .update_run_status(run_id, RunStatus::Running, None, None)
            .await?;
        self.emit(run_id, "run_resumed", "Запуск возобновлён", json!({})).await;
        Ok(())
    }

    pub async fn retry_task(&self, run_id: &str, task_id: &str) -> anyhow::Result<Task> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| anyhow!("Запуск не найден"))?;
        let task = self
            .store
            .get_task(task_id)
            .await?
            .filter(|t| t.run_id == run_id)
            .ok_or_else(|| anyhow!("Задача не найдена"))?;
        let step = self
            .store
            .get_plan_step(&task.plan_step_id)
            .await?
            .ok_or_else(|| anyhow!("Шаг плана не найден"))?;

        let run = self.ensure_run_running(run, "retry_task").await?;
        let settings = self.settings_for(&run).await?;
        let result = self.execute_step(&run, &step, Some(task_id), &settings).await;
        self.sync_run_status(run_id).await?;
        result
    }

    pub async fn retry_step(&self, run_id: &str, step_id: &str) -> anyhow::Result<Task> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| anyhow!("Запуск не найден"))?;
        let step = self
            .store
            .get_plan_step(step_id)
            .await?
            .filter(|s| s.run_id == run_id)
            .ok_or_else(|| anyhow!("Шаг плана не найден"))?;
        let previous_task_id = self
            .store
            .get_last_task_for_step(run_id, step_id)
            .await?
            .map(|task| task.id);

        let run = self.ensure_run_running(run, "retry_step").await?;
        let settings = self.settings_for(&run).await?;
        let result = self
            .execute_step(&run, &step, previous_task_id.as_deref(), &settings)
            .await;
        self.sync_run_status(run_id).await?;
        result
    }

    async fn settings_for(&self, run: &Run) -> anyhow::Result<Value> {
        Ok(self
            .store
            .get_project(&run.project_id)
            .await?
            .map(|project| project.settings)
            .unwrap_or_else(|| json!({})))
    }

    async fn ensure_run_running(&self, run: Run, reason: &str) -> anyhow::Result<Run> {
        if run.status == RunStatus::Canceled {
            bail!("Запуск отменён");
        }
        if run.status != RunStatus::Running {
            self.store
                .update_run_status(
                    &run.id,
                    RunStatus::Running,
                    run.started_at.clone().or_else(|| Some(now_iso())),
                    None,
                )
                .await?;
            self.emit(
                &run.id,
                "run_started",
                "Запуск возобновлён",
                json!({"reason": reason}),
            )
            .await;
        }
        Ok(self
            .store
            .get_run(&run.id)
            .await?
            .ok_or_else(|| anyhow!("Запуск не найден"))?)
    }

    /// Re-derives the run status from its plan after a retry.
    async fn sync_run_status(&self, run_id: &str) -> anyhow::Result<()> {
        let plan = self.store.list_plan_steps(run_id).await?;
        if plan.is_empty() {
            return Ok(());
        }
        let new_status = if plan.iter().all(|s| s.status == StepStatus::Done) {
            RunStatus::Done
        } else if plan.iter().any(|s| s.status == StepStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Running
        };

        let current = self.store.get_run(run_id).await?.map(|r| r.status);
        if current == Some(new_status) {
            return Ok(());
        }
        let finished_at = matches!(new_status, RunStatus::Done | RunStatus::Failed)
            .then(now_iso);
        self.store
            .update_run_status(run_id, new_status, None, finished_at)
            .await?;
        match new_status {
            RunStatus::Done => {
                self.emit(run_id, "run_done", "Запуск завершён", json!({"status": "done"}))
                    .await;
            }
            RunStatus::Failed => {
                self.emit_error(
                    run_id,
                    "run_failed",
                    "Запуск завершён с ошибкой",
                    json!({"status": "failed"}),
                )
                .await;
            }
            _ => {}
        }
        Ok(())
    }

    async fn execute_step(
        &self,
        run: &Run,
        step: &PlanStep,
        retry_from_task_id: Option<&str>,
        settings: &Value,
    ) -> anyhow::Result<Task> {
        let run_id = run.id.clone();
        self.store
            .update_plan_step_status(&step.id, StepStatus::Running)
            .await?;

        let task = self.store.create_task(&run_id, &step.id).await?;

        if let Some(previous_task_id) = retry_from_task_id {
            self.bus
                .emit_scoped(
                    &run_id,
                    "task_retried",
                    "Повтор задачи",
                    json!({
                        "task_id": task.id.clone(),
                        "step_id": step.id.clone(),
                        "previous_task_id": previous_task_id,
                        "attempt": task.attempt,
                    }),
                    Some(&task.id),
                    Some(&step.id),
                )
                .await
                .ok();
        }

        self.bus
            .emit_scoped(
                &run_id,
                "task_queued",
                "Задача поставлена в очередь",
                json!({
                    "task_id": task.id.clone(),
                    "step_id": step.id.clone(),
                    "step_index": step.step_index,
                    "skill_name": step.skill_name.clone(),
                }),
                Some(&task.id),
                Some(&step.id),
            )
            .await
            .ok();

        self.store
            .update_task_status(&task.id, TaskStatus::Running, Some(now_iso()), None, None)
            .await?;
        self.bus
            .emit_scoped(
                &run_id,
                "task_started",
                "Задача начата",
                json!({
                    "task_id": task.id.clone(),
                    "step_id": step.id.clone(),
                    "skill_name": step.skill_name.clone(),
                    "started_at": now_iso(),
                }),
                Some(&task.id),
                Some(&step.id),
            )
            .await
            .ok();

        let manifest = self
            .registry
            .get_manifest(&step.skill_name)
            .ok_or_else(|| anyhow!("Навык не найден: {}", step.skill_name))?;

        // The scope gate: confirm-gated skills only run in the mode where
        // a human can actually answer the approval.
        if manifest.scope.needs_approval() && run.mode != "execute_confirm" {
            self.fail_task(&run_id, &task, step, "требуется_подтверждение", "Требуется подтверждение")
                .await?;
            bail!("Требуется режим выполнения с подтверждением");
        }

        let ctx = SkillContext {
            run: run.clone(),
            plan_step: step.clone(),
            task: task.clone(),
            settings: settings.clone(),
            base_dir: self.base_dir.clone(),
            store: self.store.clone(),
            bus: self.bus.clone(),
            brain: self.brain.clone(),
            bridge: self.bridge.clone(),
        };

        let result = match self.runner.run_skill(&ctx).await {
            Ok(result) => result,
            Err(error) => {
                self.fail_task(
                    &run_id,
                    &task,
                    step,
                    &error.to_string(),
                    "Задача завершилась с ошибкой",
                )
                .await?;
                return Err(error);
            }
        };

        self.persist_skill_result(&run_id, step, &task, &result).await?;

        self.store
            .update_task_status(&task.id, TaskStatus::Done, None, Some(now_iso()), None)
            .await?;
        self.store
            .update_plan_step_status(&step.id, StepStatus::Done)
            .await?;
        self.bus
            .emit_scoped(
                &run_id,
                "task_done",
                "Задача завершена",
                json!({
                    "task_id": task.id.clone(),
                    "step_id": step.id.clone(),
                    "finished_at": now_iso(),
                }),
                Some(&task.id),
                Some(&step.id),
            )
            .await
            .ok();

        Ok(task)
    }

    async fn fail_task(
        &self,
        run_id: &str,
        task: &Task,
        step: &PlanStep,
        error: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        self.store
            .update_task_status(
                &task.id,
                TaskStatus::Failed,
                None,
                Some(now_iso()),
                Some(error.to_string()),
            )
            .await?;
        self.store
            .update_plan_step_status(&step.id, StepStatus::Failed)
            .await?;
        self.bus
            .emit_full(
                run_id,
                "task_failed",
                "error",
                message,
                json!({
                    "task_id": task.id.clone(),
                    "step_id": step.id.clone(),
                    "error": error,
                }),
                Some(&task.id),
                Some(&step.id),
            )
            .await
            .ok();
        Ok(())
    }

    async fn persist_skill_result(
        &self,
        run_id: &str,
        step: &PlanStep,
        task: &Task,
        result: &SkillResult,
    ) -> anyhow::Result<()> {
        if !result.sources.is_empty() {
            let sources: Vec<Source> = result
                .sources
                .iter()
                .map(|candidate| Source {
                    id: new_id(),
                    run_id: run_id.to_string(),
                    url: candidate.url.clone(),
                    title: candidate.title.clone(),
                    domain: candidate.domain.clone(),
                    quality: candidate.quality.clone(),
                    retrieved_at: candidate.retrieved_at.clone(),
                    snippet: candidate.snippet.clone(),
                    pinned: candidate.pinned,
                })
                .collect();
            for source in &sources {
                self.bus
                    .emit_scoped(
                        run_id,
                        "source_found",
                        "Источник найден",
                        json!({"source_id": source.id.clone(), "url": source.url.clone(), "title": source.title.clone()}),
                        Some(&task.id),
                        Some(&step.id),
                    )
                    .await
                    .ok();
            }
            self.store.insert_sources(run_id, &sources).await?;
            self.bus
                .emit_scoped(
                    run_id,
                    "source_fetched",
                    "Источники сохранены",
                    json!({"count": sources.len()}),
                    Some(&task.id),
                    Some(&step.id),
                )
                .await
                .ok();
        }

        if !result.facts.is_empty() {
            let facts: Vec<Fact> = result
                .facts
                .iter()
                .map(|candidate| Fact {
                    id: new_id(),
                    run_id: run_id.to_string(),
                    key: candidate.key.clone(),
                    value: candidate.value.clone(),
                    confidence: candidate.confidence,
                    source_ids: candidate.source_ids.clone(),
                    created_at: candidate.created_at.clone().unwrap_or_else(now_iso),
                })
                .collect();
            for fact in &facts {
                self.bus
                    .emit_scoped(
                        run_id,
                        "fact_extracted",
                        "Факт извлечён",
                        json!({"fact_id": fact.id.clone(), "key": fact.key.clone()}),
                        Some(&task.id),
                        Some(&step.id),
                    )
                    .await
                    .ok();
            }
            self.store.insert_facts(run_id, &facts).await?;
        }

        let conflict_events: Vec<&Value> = result
            .events
            .iter()
            .filter(|event| event.get("type").and_then(|v| v.as_str()) == Some("conflict"))
            .collect();
        if !conflict_events.is_empty() {
            let conflicts: Vec<Conflict> = conflict_events
                .iter()
                .map(|event| Conflict {
                    id: new_id(),
                    run_id: run_id.to_string(),
                    fact_key: event
                        .get("fact_key")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    group: event.get("group").cloned().unwrap_or_else(|| json!([])),
                    status: "open".to_string(),
                })
                .collect();
            for conflict in &conflicts {
                self.bus
                    .emit_scoped(
                        run_id,
                        "conflict_detected",
                        "Обнаружен конфликт",
                        json!({"conflict_id": conflict.id.clone(), "fact_key": conflict.fact_key.clone()}),
                        Some(&task.id),
                        Some(&step.id),
                    )
                    .await
                    .ok();
            }
            self.store.insert_conflicts(run_id, &conflicts).await?;
        }

        if !result.artifacts.is_empty() {
            let artifacts: Vec<Artifact> = result
                .artifacts
                .iter()
                .map(|candidate| Artifact {
                    id: new_id(),
                    run_id: run_id.to_string(),
                    artifact_type: candidate.artifact_type.clone(),
                    title: candidate.title.clone(),
                    content_uri: candidate.content_uri.clone(),
                    created_at: candidate.created_at.clone().unwrap_or_else(now_iso),
                    meta: candidate.meta.clone(),
                })
                .collect();
            for artifact in &artifacts {
                self.bus
                    .emit_scoped(
                        run_id,
                        "artifact_created",
                        "Артефакт создан",
                        json!({
                            "artifact_id": artifact.id.clone(),
                            "type": artifact.artifact_type.clone(),
                            "title": artifact.title.clone(),
                        }),
                        Some(&task.id),
                        Some(&step.id),
                    )
                    .await
                    .ok();
            }
            self.store.insert_artifacts(run_id, &artifacts).await?;
        }

        for event in &result.events {
            if event.get("type").and_then(|v| v.as_str()) == Some("conflict") {
                continue;
            }
            let message = event
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("Событие навыка");
            self.bus
                .emit_scoped(
                    run_id,
                    "task_progress",
                    message,
                    json!({
                        "task_id": task.id.clone(),
                        "step_id": step.id.clone(),
                        "progress": event
                            .get("progress")
                            .cloned()
                            .unwrap_or_else(|| json!({"current": 0, "total": 1, "unit": "шаг"})),
                        "last_message": message,
                    }),
                    Some(&task.id),
                    Some(&step.id),
                )
                .await
                .ok();
        }

        Ok(())
    }
}
