use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::{ApprovalStatus, ReminderStatus, RunStatus, StepStatus, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub settings: Value,
    pub created_at: String,
    pub updated_at: String,
}

/// One user utterance and everything derived from it. `meta` is an opaque
/// JSON object (intent, confidence, plan_hint, memory_item, …) validated
/// only at the boundaries that write it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub project_id: String,
    pub query_text: String,
    pub mode: String,
    pub status: RunStatus,
    #[serde(default)]
    pub parent_run_id: Option<String>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub meta: Value,
    pub created_at: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
}

impl Run {
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(|v| v.as_str())
    }

    pub fn meta_bool(&self, key: &str) -> bool {
        self.meta.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub run_id: String,
    pub step_index: i64,
    pub title: String,
    pub skill_name: String,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub depends_on: Vec<i64>,
    pub status: StepStatus,
    pub kind: String,
    #[serde(default)]
    pub success_checks: Vec<String>,
    #[serde(default)]
    pub danger_flags: Vec<String>,
    #[serde(default)]
    pub requires_approval: bool,
}

/// One attempt at one plan step. `attempt` is 1-based and strictly
/// monotone per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub run_id: String,
    pub plan_step_id: String,
    pub attempt: i64,
    pub status: TaskStatus,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub run_id: String,
    pub task_id: String,
    #[serde(default)]
    pub step_id: Option<String>,
    pub created_at: String,
    pub scope: String,
    #[serde(default)]
    pub approval_type: Option<String>,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub proposed_actions: Value,
    #[serde(default)]
    pub preview: Option<Value>,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub decided_at: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<String>,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub decision: Option<Value>,
}

/// Append-only log entry. `seq` is assigned by the store at write time and
/// is strictly increasing within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub id: String,
    pub run_id: String,
    pub ts: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMemory {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub source: String,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub last_used_at: Option<String>,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub created_at: String,
    pub due_at: String,
    pub text: String,
    pub status: ReminderStatus,
    pub delivery: String,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub sent_at: Option<String>,
    pub updated_at: String,
    pub attempts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub run_id: String,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub retrieved_at: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub pinned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub run_id: String,
    pub key: String,
    pub value: Value,
    pub confidence: f64,
    #[serde(default)]
    pub source_ids: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub run_id: String,
    pub fact_key: String,
    #[serde(default)]
    pub group: Value,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub run_id: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub title: String,
    pub content_uri: String,
    pub created_at: String,
    #[serde(default)]
    pub meta: Value,
}
