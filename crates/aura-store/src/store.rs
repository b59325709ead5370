use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use aura_types::{
    new_id, now_iso, now_ms, Approval, ApprovalStatus, Artifact, Conflict, Event, Fact, PlanStep,
    Project, Reminder, ReminderStatus, Run, RunStatus, Source, StepStatus, Task, TaskStatus,
    UserMemory,
};

use crate::db::{self, StoreError, StoreResult};

/// Transactional persistence for every entity. All writes serialize through
/// the single connection mutex, which is what guarantees monotone event
/// `seq` and collision-free `attempt` allocation.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    memory_max_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTokenRow {
    pub token_hash: String,
    pub salt: String,
    pub created_at: String,
}

/// One reconstructed chat turn from the parent-run chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub ts: Option<Value>,
    #[serde(default)]
    pub run_id: Option<String>,
}

fn json_dump(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn json_dump_of<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}

fn json_load(raw: Option<String>) -> Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null)
}

fn json_load_or_object(raw: Option<String>) -> Value {
    let value = json_load(raw);
    if value.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        value
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn index_list(value: &Value) -> Vec<i64> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(|v| v.as_i64()).collect())
        .unwrap_or_default()
}

fn memory_max_chars_from_env() -> usize {
    std::env::var("AURA_MEMORY_MAX_CHARS")
        .ok()
        .and_then(|raw| raw.parse::<usize>().ok())
        .filter(|limit| *limit > 0)
        .unwrap_or(4000)
}

impl Store {
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        let conn = db::open(data_dir)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            memory_max_chars: memory_max_chars_from_env(),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = db::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            memory_max_chars: memory_max_chars_from_env(),
        })
    }

    // ── Projects ───────────────────────────────────────────────────────

    pub async fn create_project(
        &self,
        name: &str,
        tags: Vec<String>,
        settings: Value,
    ) -> StoreResult<Project> {
        let project = Project {
            id: new_id(),
            name: name.to_string(),
            tags,
            settings: if settings.is_null() {
                Value::Object(serde_json::Map::new())
            } else {
                settings
            },
            created_at: now_iso(),
            updated_at: now_iso(),
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO projects (id, name, tags, settings, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                project.id,
                project.name,
                json_dump_of(&project.tags),
                json_dump(&project.settings),
                project.created_at,
                project.updated_at,
            ],
        )?;
        Ok(project)
    }

    pub async fn list_projects(&self) -> StoreResult<Vec<Project>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM projects ORDER BY updated_at DESC")?;
        let rows = stmt.query_map([], project_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn get_project(&self, project_id: &str) -> StoreResult<Option<Project>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM projects WHERE id = ?1",
                [project_id],
                project_from_row,
            )
            .optional()?)
    }

    pub async fn update_project(
        &self,
        project_id: &str,
        name: Option<String>,
        tags: Option<Vec<String>>,
        settings: Option<Value>,
    ) -> StoreResult<Option<Project>> {
        let Some(mut project) = self.get_project(project_id).await? else {
            return Ok(None);
        };
        if let Some(name) = name {
            project.name = name;
        }
        if let Some(tags) = tags {
            project.tags = tags;
        }
        if let Some(settings) = settings {
            project.settings = settings;
        }
        project.updated_at = now_iso();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE projects SET name = ?1, tags = ?2, settings = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                project.name,
                json_dump_of(&project.tags),
                json_dump(&project.settings),
                project.updated_at,
                project_id,
            ],
        )?;
        Ok(Some(project))
    }

    // ── Runs ───────────────────────────────────────────────────────────

    pub async fn create_run(
        &self,
        project_id: &str,
        query_text: &str,
        mode: &str,
        parent_run_id: Option<String>,
        purpose: Option<String>,
        meta: Value,
    ) -> StoreResult<Run> {
        let run = Run {
            id: new_id(),
            project_id: project_id.to_string(),
            query_text: query_text.to_string(),
            mode: mode.to_string(),
            status: RunStatus::Created,
            parent_run_id,
            purpose,
            meta,
            created_at: now_iso(),
            started_at: None,
            finished_at: None,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO runs (id, project_id, query_text, mode, status, parent_run_id, purpose, meta, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.id,
                run.project_id,
                run.query_text,
                run.mode,
                run.status.as_str(),
                run.parent_run_id,
                run.purpose,
                json_dump(&run.meta),
                run.created_at,
            ],
        )?;
        Ok(run)
    }

    pub async fn get_run(&self, run_id: &str) -> StoreResult<Option<Run>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row("SELECT * FROM runs WHERE id = ?1", [run_id], run_from_row)
            .optional()?)
    }

    pub async fn list_runs(&self, project_id: &str, limit: usize) -> StoreResult<Vec<Run>> {
        let limit = limit.clamp(1, 200);
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM runs WHERE project_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project_id, limit as i64], run_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn update_run_meta_and_mode(
        &self,
        run_id: &str,
        mode: &str,
        purpose: Option<&str>,
        meta: &Value,
    ) -> StoreResult<Option<Run>> {
        {
            let conn = self.conn.lock().await;
            let updated = conn.execute(
                "UPDATE runs SET mode = ?1, purpose = ?2, meta = ?3 WHERE id = ?4",
                params![mode, purpose, json_dump(meta), run_id],
            )?;
            if updated == 0 {
                return Ok(None);
            }
        }
        self.get_run(run_id).await
    }

    pub async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        started_at: Option<String>,
        finished_at: Option<String>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE runs SET status = ?1,
                 started_at = COALESCE(?2, started_at),
                 finished_at = COALESCE(?3, finished_at)
             WHERE id = ?4",
            params![status.as_str(), started_at, finished_at, run_id],
        )?;
        Ok(())
    }

    /// Chain of runs from the root to `run_id` (inclusive), following
    /// `parent_run_id`. Cycle-safe.
    pub async fn list_run_chain(&self, run_id: &str, limit: usize) -> StoreResult<Vec<Run>> {
        let limit = limit.clamp(1, 500);
        let mut chain: Vec<Run> = Vec::new();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut current = Some(run_id.to_string());
        while let Some(id) = current {
            if seen.contains(&id) || chain.len() >= limit {
                break;
            }
            seen.insert(id.clone());
            let Some(run) = self.get_run(&id).await? else {
                break;
            };
            current = run.parent_run_id.clone();
            chain.push(run);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Chat history (user/assistant turns) for the run chain ending at
    /// `anchor_run_id`. A run contributes its query text and, when present,
    /// the text of its latest `chat_response_generated` event.
    pub async fn list_recent_chat_turns(
        &self,
        anchor_run_id: Option<&str>,
        limit_turns: usize,
    ) -> StoreResult<Vec<ChatTurn>> {
        let Some(anchor) = anchor_run_id else {
            return Ok(Vec::new());
        };
        let limit_turns = limit_turns.clamp(1, 100);
        let chain = self.list_run_chain(anchor, limit_turns * 5).await?;
        let mut chat_runs: Vec<Run> = chain.into_iter().filter(is_chat_run).collect();
        if chat_runs.len() > limit_turns {
            chat_runs = chat_runs.split_off(chat_runs.len() - limit_turns);
        }

        let mut history = Vec::new();
        for run in chat_runs {
            if !run.query_text.is_empty() {
                history.push(ChatTurn {
                    role: "user".to_string(),
                    content: run.query_text.clone(),
                    ts: Some(Value::String(run.created_at.clone())),
                    run_id: Some(run.id.clone()),
                });
            }
            if let Some(event) = self
                .get_latest_event_by_type(&run.id, "chat_response_generated")
                .await?
            {
                if let Some(text) = event.payload.get("text").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        history.push(ChatTurn {
                            role: "assistant".to_string(),
                            content: text.to_string(),
                            ts: Some(Value::Number(event.ts.into())),
                            run_id: Some(run.id.clone()),
                        });
                    }
                }
            }
        }
        Ok(history)
    }

    // ── Plan steps ─────────────────────────────────────────────────────

    /// Replaces the run's plan atomically: no reader ever observes a
    /// partial rewrite.
    pub async fn insert_plan_steps(&self, run_id: &str, steps: &[PlanStep]) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM plan_steps WHERE run_id = ?1", [run_id])?;
        for step in steps {
            tx.execute(
                "INSERT INTO plan_steps (id, run_id, step_index, title, skill_name, inputs, depends_on, status, kind, success_checks, danger_flags, requires_approval)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    step.id,
                    run_id,
                    step.step_index,
                    step.title,
                    step.skill_name,
                    json_dump(&step.inputs),
                    json_dump_of(&step.depends_on),
                    step.status.as_str(),
                    step.kind,
                    json_dump_of(&step.success_checks),
                    json_dump_of(&step.danger_flags),
                    step.requires_approval as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn list_plan_steps(&self, run_id: &str) -> StoreResult<Vec<PlanStep>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM plan_steps WHERE run_id = ?1 ORDER BY step_index ASC")?;
        let rows = stmt.query_map([run_id], plan_step_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn get_plan_step(&self, step_id: &str) -> StoreResult<Option<PlanStep>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM plan_steps WHERE id = ?1",
                [step_id],
                plan_step_from_row,
            )
            .optional()?)
    }

    pub async fn update_plan_step_status(
        &self,
        step_id: &str,
        status: StepStatus,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE plan_steps SET status = ?1 WHERE id = ?2",
            params![status.as_str(), step_id],
        )?;
        Ok(())
    }

    // ── Tasks ──────────────────────────────────────────────────────────

    /// Allocates `max(attempt)+1` and inserts the task inside one locked
    /// section, so concurrent retries never collide on the same attempt.
    pub async fn create_task(&self, run_id: &str, plan_step_id: &str) -> StoreResult<Task> {
        let conn = self.conn.lock().await;
        let max_attempt: i64 = conn.query_row(
            "SELECT COALESCE(MAX(attempt), 0) FROM tasks WHERE run_id = ?1 AND plan_step_id = ?2",
            params![run_id, plan_step_id],
            |row| row.get(0),
        )?;
        let task = Task {
            id: new_id(),
            run_id: run_id.to_string(),
            plan_step_id: plan_step_id.to_string(),
            attempt: max_attempt + 1,
            status: TaskStatus::Queued,
            started_at: None,
            finished_at: None,
            error: None,
            duration_ms: None,
        };
        conn.execute(
            "INSERT INTO tasks (id, run_id, plan_step_id, attempt, status) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task.id,
                task.run_id,
                task.plan_step_id,
                task.attempt,
                task.status.as_str()
            ],
        )?;
        Ok(task)
    }

    pub async fn next_task_attempt(&self, run_id: &str, plan_step_id: &str) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        let max_attempt: i64 = conn.query_row(
            "SELECT COALESCE(MAX(attempt), 0) FROM tasks WHERE run_id = ?1 AND plan_step_id = ?2",
            params![run_id, plan_step_id],
            |row| row.get(0),
        )?;
        Ok(max_attempt + 1)
    }

    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        started_at: Option<String>,
        finished_at: Option<String>,
        error: Option<String>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET status = ?1,
                 started_at = COALESCE(?2, started_at),
                 finished_at = COALESCE(?3, finished_at),
                 error = COALESCE(?4, error)
             WHERE id = ?5",
            params![status.as_str(), started_at, finished_at, error, task_id],
        )?;
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row("SELECT * FROM tasks WHERE id = ?1", [task_id], task_from_row)
            .optional()?)
    }

    pub async fn list_tasks(&self, run_id: &str) -> StoreResult<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM tasks WHERE run_id = ?1 ORDER BY rowid ASC")?;
        let rows = stmt.query_map([run_id], task_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn list_tasks_for_step(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> StoreResult<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks WHERE run_id = ?1 AND plan_step_id = ?2 ORDER BY attempt ASC",
        )?;
        let rows = stmt.query_map(params![run_id, step_id], task_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn get_last_task_for_step(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> StoreResult<Option<Task>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM tasks WHERE run_id = ?1 AND plan_step_id = ?2 ORDER BY attempt DESC LIMIT 1",
                params![run_id, step_id],
                task_from_row,
            )
            .optional()?)
    }

    // ── Approvals ──────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_approval(
        &self,
        run_id: &str,
        task_id: &str,
        step_id: Option<&str>,
        scope: &str,
        approval_type: Option<&str>,
        title: &str,
        description: &str,
        proposed_actions: Value,
        preview: Option<Value>,
    ) -> StoreResult<Approval> {
        let approval = Approval {
            id: new_id(),
            run_id: run_id.to_string(),
            task_id: task_id.to_string(),
            step_id: step_id.map(|s| s.to_string()),
            created_at: now_iso(),
            scope: scope.to_string(),
            approval_type: Some(approval_type.unwrap_or("ACCOUNT_CHANGE").to_string()),
            title: title.to_string(),
            description: description.to_string(),
            proposed_actions,
            preview: Some(preview.unwrap_or_else(|| {
                serde_json::json!({
                    "summary": title,
                    "details": {},
                    "risk": "Опасное действие",
                    "suggested_user_action": "Подтвердите выполнение",
                    "expires_in_ms": null,
                })
            })),
            status: ApprovalStatus::Pending,
            decided_at: None,
            resolved_at: None,
            decided_by: None,
            decision: None,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO approvals (id, run_id, task_id, step_id, created_at, scope, approval_type, title, description, proposed_actions, preview_json, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                approval.id,
                approval.run_id,
                approval.task_id,
                approval.step_id,
                approval.created_at,
                approval.scope,
                approval.approval_type,
                approval.title,
                approval.description,
                json_dump(&approval.proposed_actions),
                approval.preview.as_ref().map(json_dump),
                approval.status.as_str(),
            ],
        )?;
        Ok(approval)
    }

    pub async fn list_approvals(&self, run_id: &str) -> StoreResult<Vec<Approval>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM approvals WHERE run_id = ?1 ORDER BY created_at DESC")?;
        let rows = stmt.query_map([run_id], approval_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn get_approval(&self, approval_id: &str) -> StoreResult<Option<Approval>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM approvals WHERE id = ?1",
                [approval_id],
                approval_from_row,
            )
            .optional()?)
    }

    /// Terminal approval statuses are final: updating an already-decided
    /// approval is a no-op that returns its current state.
    pub async fn update_approval_status(
        &self,
        approval_id: &str,
        status: ApprovalStatus,
        decided_by: &str,
        decision: Option<Value>,
    ) -> StoreResult<Option<Approval>> {
        let Some(current) = self.get_approval(approval_id).await? else {
            return Ok(None);
        };
        if current.status.is_terminal() {
            return Ok(Some(current));
        }
        let decided_at = now_iso();
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE approvals SET status = ?1, decided_at = ?2, decided_by = ?3, decision_json = ?4 WHERE id = ?5",
                params![
                    status.as_str(),
                    decided_at,
                    decided_by,
                    decision.as_ref().map(json_dump),
                    approval_id,
                ],
            )?;
        }
        self.get_approval(approval_id).await
    }

    // ── Session token ──────────────────────────────────────────────────

    pub async fn set_session_token_hash(&self, token_hash: &str, salt: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO session_tokens (id, token_hash, salt, created_at) VALUES ('default', ?1, ?2, ?3)",
            params![token_hash, salt, now_iso()],
        )?;
        Ok(())
    }

    pub async fn get_session_token_hash(&self) -> StoreResult<Option<SessionTokenRow>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT token_hash, salt, created_at FROM session_tokens WHERE id = 'default'",
                [],
                |row| {
                    Ok(SessionTokenRow {
                        token_hash: row.get(0)?,
                        salt: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    // ── User memories ──────────────────────────────────────────────────

    pub async fn create_user_memory(
        &self,
        title: Option<&str>,
        content: &str,
        tags: Option<Vec<String>>,
        source: &str,
        meta: Value,
    ) -> StoreResult<UserMemory> {
        let content_trimmed = content.trim();
        if content_trimmed.is_empty() {
            return Err(StoreError::Invalid("content_required".to_string()));
        }
        if content.chars().count() > self.memory_max_chars {
            return Err(StoreError::ContentTooLong(self.memory_max_chars));
        }

        let mut title_text = title.unwrap_or("").trim().to_string();
        if title_text.is_empty() {
            title_text = content_trimmed
                .lines()
                .next()
                .unwrap_or("Память пользователя")
                .to_string();
        }
        if title_text.chars().count() > 120 {
            title_text = title_text.chars().take(117).collect::<String>() + "...";
        }

        let memory = UserMemory {
            id: new_id(),
            created_at: now_iso(),
            updated_at: now_iso(),
            title: title_text,
            content: content.to_string(),
            tags: tags.unwrap_or_default(),
            source: source.to_string(),
            is_deleted: false,
            pinned: false,
            last_used_at: None,
            meta: if meta.is_null() {
                Value::Object(serde_json::Map::new())
            } else {
                meta
            },
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_memories (id, created_at, updated_at, title, content, tags, source, is_deleted, pinned, last_used_at, meta)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, NULL, ?8)",
            params![
                memory.id,
                memory.created_at,
                memory.updated_at,
                memory.title,
                memory.content,
                json_dump_of(&memory.tags),
                memory.source,
                json_dump(&memory.meta),
            ],
        )?;
        Ok(memory)
    }

    pub async fn list_user_memories(
        &self,
        query: Option<&str>,
        tag: Option<&str>,
        limit: usize,
        include_deleted: bool,
    ) -> StoreResult<Vec<UserMemory>> {
        let limit = limit.clamp(1, 200);
        let mut clauses: Vec<String> = Vec::new();
        let mut params_vec: Vec<String> = Vec::new();
        if !include_deleted {
            clauses.push("is_deleted = 0".to_string());
        }
        if let Some(query) = query.map(str::trim).filter(|q| !q.is_empty()) {
            clauses.push("(title LIKE ? OR content LIKE ?)".to_string());
            let like = format!("%{query}%");
            params_vec.push(like.clone());
            params_vec.push(like);
        }
        if let Some(tag) = tag.map(str::trim).filter(|t| !t.is_empty()) {
            clauses.push("tags LIKE ?".to_string());
            params_vec.push(format!("%{tag}%"));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT * FROM user_memories {where_clause} ORDER BY pinned DESC, updated_at DESC LIMIT {limit}"
        );
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params_vec.iter()),
            memory_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn get_user_memory(&self, memory_id: &str) -> StoreResult<Option<UserMemory>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM user_memories WHERE id = ?1",
                [memory_id],
                memory_from_row,
            )
            .optional()?)
    }

    pub async fn delete_user_memory(&self, memory_id: &str) -> StoreResult<Option<UserMemory>> {
        let Some(mut memory) = self.get_user_memory(memory_id).await? else {
            return Ok(None);
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE user_memories SET is_deleted = 1, updated_at = ?1 WHERE id = ?2",
            params![now_iso(), memory_id],
        )?;
        memory.is_deleted = true;
        Ok(Some(memory))
    }

    pub async fn set_user_memory_pinned(
        &self,
        memory_id: &str,
        pinned: bool,
    ) -> StoreResult<Option<UserMemory>> {
        let Some(mut memory) = self.get_user_memory(memory_id).await? else {
            return Ok(None);
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE user_memories SET pinned = ?1, updated_at = ?2 WHERE id = ?3",
            params![pinned as i64, now_iso(), memory_id],
        )?;
        memory.pinned = pinned;
        Ok(Some(memory))
    }

    // ── Reminders ──────────────────────────────────────────────────────

    pub async fn create_reminder(
        &self,
        due_at: &str,
        text: &str,
        delivery: &str,
        run_id: Option<String>,
        source: Option<String>,
    ) -> StoreResult<Reminder> {
        let reminder = Reminder {
            id: new_id(),
            created_at: now_iso(),
            due_at: due_at.to_string(),
            text: text.to_string(),
            status: ReminderStatus::Pending,
            delivery: delivery.to_string(),
            last_error: None,
            run_id,
            source,
            sent_at: None,
            updated_at: now_iso(),
            attempts: 0,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO reminders (id, created_at, due_at, text, status, delivery, last_error, run_id, source, sent_at, updated_at, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, NULL, ?9, 0)",
            params![
                reminder.id,
                reminder.created_at,
                reminder.due_at,
                reminder.text,
                reminder.status.as_str(),
                reminder.delivery,
                reminder.run_id,
                reminder.source,
                reminder.updated_at,
            ],
        )?;
        Ok(reminder)
    }

    pub async fn list_reminders(
        &self,
        status: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Reminder>> {
        let limit = limit.clamp(1, 500);
        let conn = self.conn.lock().await;
        let mut rows = Vec::new();
        if let Some(status) = status {
            let mut stmt = conn.prepare(
                "SELECT * FROM reminders WHERE status = ?1 ORDER BY due_at ASC LIMIT ?2",
            )?;
            let mapped = stmt.query_map(params![status, limit as i64], reminder_from_row)?;
            for row in mapped {
                rows.push(row?);
            }
        } else {
            let mut stmt =
                conn.prepare("SELECT * FROM reminders ORDER BY due_at DESC LIMIT ?1")?;
            let mapped = stmt.query_map(params![limit as i64], reminder_from_row)?;
            for row in mapped {
                rows.push(row?);
            }
        }
        Ok(rows)
    }

    pub async fn get_reminder(&self, reminder_id: &str) -> StoreResult<Option<Reminder>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM reminders WHERE id = ?1",
                [reminder_id],
                reminder_from_row,
            )
            .optional()?)
    }

    pub async fn cancel_reminder(&self, reminder_id: &str) -> StoreResult<Option<Reminder>> {
        let Some(mut reminder) = self.get_reminder(reminder_id).await? else {
            return Ok(None);
        };
        let updated_at = now_iso();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE reminders SET status = 'cancelled', updated_at = ?1 WHERE id = ?2",
            params![updated_at, reminder_id],
        )?;
        reminder.status = ReminderStatus::Cancelled;
        reminder.updated_at = updated_at;
        Ok(Some(reminder))
    }

    /// Atomically claims due reminders: `pending → sending` with
    /// `attempts += 1` behind a status guard, so two concurrent claimers
    /// never both get the same row.
    pub async fn claim_due_reminders(
        &self,
        now_ts: &str,
        limit: usize,
    ) -> StoreResult<Vec<Reminder>> {
        let limit = limit.clamp(1, 200);
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM reminders WHERE status = 'pending' AND due_at <= ?1 ORDER BY due_at ASC LIMIT ?2",
        )?;
        let candidates: Vec<Reminder> = stmt
            .query_map(params![now_ts, limit as i64], reminder_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut claimed = Vec::new();
        for mut reminder in candidates {
            let updated_at = now_iso();
            let changed = conn.execute(
                "UPDATE reminders SET status = 'sending', updated_at = ?1, attempts = attempts + 1
                 WHERE id = ?2 AND status = 'pending'",
                params![updated_at, reminder.id],
            )?;
            if changed == 0 {
                continue;
            }
            reminder.status = ReminderStatus::Sending;
            reminder.updated_at = updated_at;
            reminder.attempts += 1;
            claimed.push(reminder);
        }
        Ok(claimed)
    }

    pub async fn mark_reminder_sent(
        &self,
        reminder_id: &str,
        delivery: &str,
    ) -> StoreResult<Option<Reminder>> {
        let Some(mut reminder) = self.get_reminder(reminder_id).await? else {
            return Ok(None);
        };
        let sent_at = now_iso();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE reminders SET status = 'sent', delivery = ?1, sent_at = ?2, last_error = NULL, updated_at = ?2 WHERE id = ?3",
            params![delivery, sent_at, reminder_id],
        )?;
        reminder.status = ReminderStatus::Sent;
        reminder.delivery = delivery.to_string();
        reminder.sent_at = Some(sent_at.clone());
        reminder.last_error = None;
        reminder.updated_at = sent_at;
        Ok(Some(reminder))
    }

    pub async fn mark_reminder_failed(
        &self,
        reminder_id: &str,
        error: &str,
        delivery: &str,
    ) -> StoreResult<Option<Reminder>> {
        let Some(mut reminder) = self.get_reminder(reminder_id).await? else {
            return Ok(None);
        };
        let updated_at = now_iso();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE reminders SET status = 'failed', delivery = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
            params![delivery, error, updated_at, reminder_id],
        )?;
        reminder.status = ReminderStatus::Failed;
        reminder.delivery = delivery.to_string();
        reminder.last_error = Some(error.to_string());
        reminder.updated_at = updated_at;
        Ok(Some(reminder))
    }

    // ── Run results: sources, facts, conflicts, artifacts ──────────────

    pub async fn insert_sources(&self, run_id: &str, sources: &[Source]) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        for source in sources {
            conn.execute(
                "INSERT INTO sources (id, run_id, url, title, domain, quality, retrieved_at, snippet, pinned)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    source.id,
                    run_id,
                    source.url,
                    source.title,
                    source.domain,
                    source.quality,
                    source.retrieved_at,
                    source.snippet,
                    source.pinned as i64,
                ],
            )?;
        }
        Ok(())
    }

    pub async fn list_sources(&self, run_id: &str) -> StoreResult<Vec<Source>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM sources WHERE run_id = ?1")?;
        let rows = stmt.query_map([run_id], source_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn get_source(&self, source_id: &str) -> StoreResult<Option<Source>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM sources WHERE id = ?1",
                [source_id],
                source_from_row,
            )
            .optional()?)
    }

    pub async fn insert_facts(&self, run_id: &str, facts: &[Fact]) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        for fact in facts {
            conn.execute(
                "INSERT INTO facts (id, run_id, key, value, confidence, source_ids, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    fact.id,
                    run_id,
                    fact.key,
                    json_dump(&fact.value),
                    fact.confidence,
                    json_dump_of(&fact.source_ids),
                    fact.created_at,
                ],
            )?;
        }
        Ok(())
    }

    pub async fn list_facts(&self, run_id: &str) -> StoreResult<Vec<Fact>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM facts WHERE run_id = ?1")?;
        let rows = stmt.query_map([run_id], fact_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn get_fact(&self, fact_id: &str) -> StoreResult<Option<Fact>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row("SELECT * FROM facts WHERE id = ?1", [fact_id], fact_from_row)
            .optional()?)
    }

    pub async fn insert_conflicts(&self, run_id: &str, conflicts: &[Conflict]) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        for conflict in conflicts {
            conn.execute(
                "INSERT INTO conflicts (id, run_id, fact_key, group_json, status) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conflict.id,
                    run_id,
                    conflict.fact_key,
                    json_dump(&conflict.group),
                    conflict.status,
                ],
            )?;
        }
        Ok(())
    }

    pub async fn list_conflicts(&self, run_id: &str) -> StoreResult<Vec<Conflict>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM conflicts WHERE run_id = ?1")?;
        let rows = stmt.query_map([run_id], conflict_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn get_conflict(&self, conflict_id: &str) -> StoreResult<Option<Conflict>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM conflicts WHERE id = ?1",
                [conflict_id],
                conflict_from_row,
            )
            .optional()?)
    }

    pub async fn insert_artifacts(&self, run_id: &str, artifacts: &[Artifact]) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        for artifact in artifacts {
            conn.execute(
                "INSERT INTO artifacts (id, run_id, type, title, content_uri, created_at, meta)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    artifact.id,
                    run_id,
                    artifact.artifact_type,
                    artifact.title,
                    artifact.content_uri,
                    artifact.created_at,
                    json_dump(&artifact.meta),
                ],
            )?;
        }
        Ok(())
    }

    pub async fn list_artifacts(&self, run_id: &str) -> StoreResult<Vec<Artifact>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM artifacts WHERE run_id = ?1")?;
        let rows = stmt.query_map([run_id], artifact_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn get_artifact(&self, artifact_id: &str) -> StoreResult<Option<Artifact>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM artifacts WHERE id = ?1",
                [artifact_id],
                artifact_from_row,
            )
            .optional()?)
    }

    /// LIKE-based search over a project's sources, facts and artifacts.
    pub async fn search_memory(
        &self,
        project_id: &str,
        query: &str,
        item_type: Option<&str>,
        from_ts: Option<&str>,
        to_ts: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Value>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let like = format!("%{}%", query.trim());
        let limit = limit.clamp(1, 200);
        let mut results: Vec<Value> = Vec::new();
        let conn = self.conn.lock().await;

        if item_type.is_none() || item_type == Some("source") {
            let mut stmt = conn.prepare(
                "SELECT * FROM sources WHERE run_id IN (SELECT id FROM runs WHERE project_id = ?1)
                 AND (url LIKE ?2 OR title LIKE ?2 OR snippet LIKE ?2)",
            )?;
            let rows = stmt.query_map(params![project_id, like], source_from_row)?;
            for row in rows {
                let item = row?;
                results.push(serde_json::json!({"type": "source", "item": item}));
            }
        }
        if item_type.is_none() || item_type == Some("fact") {
            let mut stmt = conn.prepare(
                "SELECT * FROM facts WHERE run_id IN (SELECT id FROM runs WHERE project_id = ?1)
                 AND (key LIKE ?2 OR value LIKE ?2)",
            )?;
            let rows = stmt.query_map(params![project_id, like], fact_from_row)?;
            for row in rows {
                let item = row?;
                results.push(serde_json::json!({"type": "fact", "item": item}));
            }
        }
        if item_type.is_none() || item_type == Some("artifact") {
            let mut stmt = conn.prepare(
                "SELECT * FROM artifacts WHERE run_id IN (SELECT id FROM runs WHERE project_id = ?1)
                 AND (title LIKE ?2 OR content_uri LIKE ?2)",
            )?;
            let rows = stmt.query_map(params![project_id, like], artifact_from_row)?;
            for row in rows {
                let item = row?;
                results.push(serde_json::json!({"type": "artifact", "item": item}));
            }
        }

        let filtered = results
            .into_iter()
            .filter(|entry| {
                let created_at = entry
                    .get("item")
                    .and_then(|item| {
                        item.get("created_at")
                            .or_else(|| item.get("retrieved_at"))
                            .and_then(|v| v.as_str())
                    })
                    .unwrap_or("");
                if let Some(from_ts) = from_ts {
                    if !created_at.is_empty() && created_at < from_ts {
                        return false;
                    }
                }
                if let Some(to_ts) = to_ts {
                    if !created_at.is_empty() && created_at > to_ts {
                        return false;
                    }
                }
                true
            })
            .take(limit)
            .collect();
        Ok(filtered)
    }

    // ── Events ─────────────────────────────────────────────────────────

    /// Appends an event and assigns its `seq` inside the same locked
    /// section, returning the enriched row.
    pub async fn add_event(
        &self,
        run_id: &str,
        event_type: &str,
        level: &str,
        message: &str,
        payload: Value,
        task_id: Option<&str>,
        step_id: Option<&str>,
    ) -> StoreResult<Event> {
        let mut event = Event {
            seq: 0,
            id: new_id(),
            run_id: run_id.to_string(),
            ts: now_ms(),
            event_type: event_type.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            payload,
            task_id: task_id.map(|s| s.to_string()),
            step_id: step_id.map(|s| s.to_string()),
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO events (id, run_id, ts, type, level, message, payload, task_id, step_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.id,
                event.run_id,
                event.ts,
                event.event_type,
                event.level,
                event.message,
                json_dump(&event.payload),
                event.task_id,
                event.step_id,
            ],
        )?;
        event.seq = conn.last_insert_rowid();
        Ok(event)
    }

    pub async fn list_events(&self, run_id: &str, limit: usize) -> StoreResult<Vec<Event>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM events WHERE run_id = ?1 ORDER BY seq ASC LIMIT ?2")?;
        let rows = stmt.query_map(params![run_id, limit as i64], event_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Exactly the events with `seq > last_seq`, ascending.
    pub async fn list_events_since(&self, run_id: &str, last_seq: i64) -> StoreResult<Vec<Event>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM events WHERE run_id = ?1 AND seq > ?2 ORDER BY seq ASC")?;
        let rows = stmt.query_map(params![run_id, last_seq], event_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn get_latest_event_by_type(
        &self,
        run_id: &str,
        event_type: &str,
    ) -> StoreResult<Option<Event>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM events WHERE run_id = ?1 AND type = ?2 ORDER BY seq DESC LIMIT 1",
                params![run_id, event_type],
                event_from_row,
            )
            .optional()?)
    }
}

fn is_chat_run(run: &Run) -> bool {
    if run.meta_str("intent") == Some("CHAT") {
        return true;
    }
    run.purpose.as_deref() == Some("chat_only")
}

// ── Row mappers ────────────────────────────────────────────────────────

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get("id")?,
        name: row.get("name")?,
        tags: string_list(&json_load(row.get("tags")?)),
        settings: json_load_or_object(row.get("settings")?),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let status: String = row.get("status")?;
    Ok(Run {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        query_text: row.get("query_text")?,
        mode: row.get("mode")?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Created),
        parent_run_id: row.get("parent_run_id")?,
        purpose: row.get("purpose")?,
        meta: json_load_or_object(row.get("meta")?),
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
    })
}

fn plan_step_from_row(row: &Row<'_>) -> rusqlite::Result<PlanStep> {
    let status: String = row.get("status")?;
    Ok(PlanStep {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        step_index: row.get("step_index")?,
        title: row.get("title")?,
        skill_name: row.get("skill_name")?,
        inputs: json_load_or_object(row.get("inputs")?),
        depends_on: index_list(&json_load(row.get("depends_on")?)),
        status: StepStatus::parse(&status).unwrap_or(StepStatus::Created),
        kind: row.get("kind")?,
        success_checks: string_list(&json_load(row.get("success_checks")?)),
        danger_flags: string_list(&json_load(row.get("danger_flags")?)),
        requires_approval: row.get::<_, i64>("requires_approval")? != 0,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    Ok(Task {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        plan_step_id: row.get("plan_step_id")?,
        attempt: row.get("attempt")?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Queued),
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        error: row.get("error")?,
        duration_ms: row.get("duration_ms")?,
    })
}

fn approval_from_row(row: &Row<'_>) -> rusqlite::Result<Approval> {
    let status: String = row.get("status")?;
    let decided_at: Option<String> = row.get("decided_at")?;
    Ok(Approval {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        task_id: row.get("task_id")?,
        step_id: row.get("step_id")?,
        created_at: row.get("created_at")?,
        scope: row.get("scope")?,
        approval_type: row.get("approval_type")?,
        title: row.get("title")?,
        description: row.get("description")?,
        proposed_actions: json_load(row.get("proposed_actions")?),
        preview: {
            let preview = json_load(row.get("preview_json")?);
            if preview.is_null() {
                None
            } else {
                Some(preview)
            }
        },
        status: ApprovalStatus::parse(&status).unwrap_or(ApprovalStatus::Pending),
        decided_at: decided_at.clone(),
        resolved_at: decided_at,
        decided_by: row.get("decided_by")?,
        decision: {
            let decision = json_load(row.get("decision_json")?);
            if decision.is_null() {
                None
            } else {
                Some(decision)
            }
        },
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        seq: row.get("seq")?,
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        ts: row.get("ts")?,
        event_type: row.get("type")?,
        level: row.get("level")?,
        message: row.get("message")?,
        payload: json_load_or_object(row.get("payload")?),
        task_id: row.get("task_id")?,
        step_id: row.get("step_id")?,
    })
}

fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<UserMemory> {
    Ok(UserMemory {
        id: row.get("id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        title: row.get("title")?,
        content: row.get("content")?,
        tags: string_list(&json_load(row.get("tags")?)),
        source: row.get("source")?,
        is_deleted: row.get::<_, i64>("is_deleted")? != 0,
        pinned: row.get::<_, i64>("pinned")? != 0,
        last_used_at: row.get("last_used_at")?,
        meta: json_load_or_object(row.get("meta")?),
    })
}

fn reminder_from_row(row: &Row<'_>) -> rusqlite::Result<Reminder> {
    let status: String = row.get("status")?;
    let status = match status.as_str() {
        "pending" => ReminderStatus::Pending,
        "sending" => ReminderStatus::Sending,
        "sent" => ReminderStatus::Sent,
        "failed" => ReminderStatus::Failed,
        _ => ReminderStatus::Cancelled,
    };
    Ok(Reminder {
        id: row.get("id")?,
        created_at: row.get("created_at")?,
        due_at: row.get("due_at")?,
        text: row.get("text")?,
        status,
        delivery: row.get("delivery")?,
        last_error: row.get("last_error")?,
        run_id: row.get("run_id")?,
        source: row.get("source")?,
        sent_at: row.get("sent_at")?,
        updated_at: row.get("updated_at")?,
        attempts: row.get("attempts")?,
    })
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        url: row.get("url")?,
        title: row.get("title")?,
        domain: row.get("domain")?,
        quality: row.get("quality")?,
        retrieved_at: row.get("retrieved_at")?,
        snippet: row.get("snippet")?,
        pinned: row.get::<_, i64>("pinned")? != 0,
    })
}

fn fact_from_row(row: &Row<'_>) -> rusqlite::Result<Fact> {
    Ok(Fact {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        key: row.get("key")?,
        value: json_load(row.get("value")?),
        confidence: row.get("confidence")?,
        source_ids: string_list(&json_load(row.get("source_ids")?)),
        created_at: row.get("created_at")?,
    })
}

fn conflict_from_row(row: &Row<'_>) -> rusqlite::Result<Conflict> {
    Ok(Conflict {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        fact_key: row.get("fact_key")?,
        group: json_load(row.get("group_json")?),
        status: row.get("status")?,
    })
}

fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<Artifact> {
    Ok(Artifact {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        artifact_type: row.get("type")?,
        title: row.get("title")?,
        content_uri: row.get("content_uri")?,
        created_at: row.get("created_at")?,
        meta: json_load_or_object(row.get("meta")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aura_types::PlanStep;

    async fn test_store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn step(run_id: &str, index: i64) -> PlanStep {
        PlanStep {
            id: new_id(),
            run_id: run_id.to_string(),
            step_index: index,
            title: format!("Шаг {index}"),
            skill_name: "memory_save".to_string(),
            inputs: serde_json::json!({}),
            depends_on: vec![],
            status: StepStatus::Created,
            kind: "MEMORY_COMMIT".to_string(),
            success_checks: vec![],
            danger_flags: vec![],
            requires_approval: false,
        }
    }

    #[tokio::test]
    async fn event_seq_is_strictly_monotone_per_run() {
        let store = test_store().await;
        let mut last = 0;
        for i in 0..5 {
            let event = store
                .add_event(
                    "run-1",
                    "task_progress",
                    "info",
                    &format!("событие {i}"),
                    serde_json::json!({}),
                    None,
                    None,
                )
                .await
                .unwrap();
            assert!(event.seq > last);
            last = event.seq;
        }
        let since = store.list_events_since("run-1", 2).await.unwrap();
        assert!(since.iter().all(|e| e.seq > 2));
        assert!(since.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn task_attempts_form_dense_prefix() {
        let store = test_store().await;
        let run = store
            .create_run("p1", "сделай", "execute_confirm", None, None, serde_json::json!({}))
            .await
            .unwrap();
        let s = step(&run.id, 0);
        store.insert_plan_steps(&run.id, &[s.clone()]).await.unwrap();

        let t1 = store.create_task(&run.id, &s.id).await.unwrap();
        let t2 = store.create_task(&run.id, &s.id).await.unwrap();
        let t3 = store.create_task(&run.id, &s.id).await.unwrap();
        assert_eq!((t1.attempt, t2.attempt, t3.attempt), (1, 2, 3));

        let attempts: Vec<i64> = store
            .list_tasks_for_step(&run.id, &s.id)
            .await
            .unwrap()
            .iter()
            .map(|t| t.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn plan_steps_are_replaced_atomically() {
        let store = test_store().await;
        let run = store
            .create_run("p1", "сделай", "research", None, None, serde_json::json!({}))
            .await
            .unwrap();
        store
            .insert_plan_steps(&run.id, &[step(&run.id, 0), step(&run.id, 1)])
            .await
            .unwrap();
        store.insert_plan_steps(&run.id, &[step(&run.id, 0)]).await.unwrap();
        assert_eq!(store.list_plan_steps(&run.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_due_reminders_is_single_shot() {
        let store = test_store().await;
        store
            .create_reminder("2024-01-01T11:59:00Z", "попить воды", "local", None, None)
            .await
            .unwrap();

        let claimed = store
            .claim_due_reminders("2024-01-01T12:00:00.000Z", 20)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, ReminderStatus::Sending);
        assert_eq!(claimed[0].attempts, 1);

        let again = store
            .claim_due_reminders("2024-01-01T12:00:00.000Z", 20)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn reminder_not_due_is_not_claimed() {
        let store = test_store().await;
        store
            .create_reminder("2024-01-01T12:10:00Z", "попозже", "local", None, None)
            .await
            .unwrap();
        let claimed = store
            .claim_due_reminders("2024-01-01T12:00:00.000Z", 20)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn memory_content_limit_is_enforced() {
        std::env::remove_var("AURA_MEMORY_MAX_CHARS");
        let store = test_store().await;
        let long = "я".repeat(5000);
        let err = store
            .create_user_memory(None, &long, None, "user_command", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ContentTooLong(_)));
    }

    #[tokio::test]
    async fn terminal_approval_status_is_final() {
        let store = test_store().await;
        let approval = store
            .create_approval(
                "run-1",
                "task-1",
                None,
                "bash",
                None,
                "Команда оболочки",
                "rm -rf",
                serde_json::json!([]),
                None,
            )
            .await
            .unwrap();
        let rejected = store
            .update_approval_status(&approval.id, ApprovalStatus::Rejected, "user", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rejected.status, ApprovalStatus::Rejected);

        let after = store
            .update_approval_status(&approval.id, ApprovalStatus::Approved, "user", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, ApprovalStatus::Rejected);
    }
}
