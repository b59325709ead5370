use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::routing::ContextItem;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

pub type RenderMessages = Arc<dyn Fn(&[ContextItem]) -> Vec<ChatMessage> + Send + Sync>;

/// One LLM call. Either `messages` is non-empty or `render_messages`
/// produces them from the (possibly sanitized) context items.
#[derive(Clone)]
pub struct LlmRequest {
    pub purpose: String,
    pub task_kind: Option<String>,
    pub context_items: Vec<ContextItem>,
    pub messages: Vec<ChatMessage>,
    pub render_messages: Option<RenderMessages>,
    pub preferred_model_kind: String,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub json_schema: Option<Value>,
    pub tools: Option<Value>,
    pub run_id: Option<String>,
    pub task_id: Option<String>,
    pub step_id: Option<String>,
}

impl LlmRequest {
    pub fn new(purpose: &str) -> Self {
        Self {
            purpose: purpose.to_string(),
            task_kind: None,
            context_items: Vec::new(),
            messages: Vec::new(),
            render_messages: None,
            preferred_model_kind: "chat".to_string(),
            temperature: 0.2,
            max_tokens: None,
            json_schema: None,
            tools: None,
            run_id: None,
            task_id: None,
            step_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LlmStatus {
    Ok,
    BudgetExceeded,
    Error,
}

impl LlmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmStatus::Ok => "ok",
            LlmStatus::BudgetExceeded => "budget_exceeded",
            LlmStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default)]
    pub usage: Option<Value>,
    pub provider: String,
    #[serde(default)]
    pub model_id: Option<String>,
    pub latency_ms: i64,
    pub cache_hit: bool,
    pub route_reason: String,
    pub status: LlmStatus,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub http_status: Option<u16>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub raw: Option<Value>,
}
