use async_trait::async_trait;
use serde_json::{json, Value};

use aura_brain::{ContextItem, LlmRequest, Sensitivity, SourceType};
use aura_core::chat_context::{build_chat_messages, build_chat_system_prompt};
use aura_core::phrases;
use aura_types::{SkillResult, SkillScope};

use crate::context::SkillContext;
use crate::registry::{Skill, SkillManifest};

const CHAT_HISTORY_TURNS: usize = 20;

pub struct ChatResponseSkill {
    manifest: SkillManifest,
}

impl ChatResponseSkill {
    pub fn new() -> Self {
        let schema = json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
            },
        });
        Self {
            manifest: SkillManifest::new("chat_response", SkillScope::Safe, schema)
                .with_capabilities(&["chat"]),
        }
    }
}

impl Default for ChatResponseSkill {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Skill for ChatResponseSkill {
    fn manifest(&self) -> &SkillManifest {
        &self.manifest
    }

    async fn execute(&self, inputs: &Value, ctx: &SkillContext) -> anyhow::Result<SkillResult> {
        let query = inputs
            .get("query")
            .and_then(|v| v.as_str())
            .filter(|q| !q.trim().is_empty())
            .unwrap_or(&ctx.run.query_text)
            .to_string();

        let memories = ctx.store.list_user_memories(None, None, 50, false).await?;
        let style_hint = ctx.run.meta_str("response_style_hint").map(|s| s.to_string());
        let system_text = build_chat_system_prompt(&memories, style_hint.as_deref());
        let history = ctx
            .store
            .list_recent_chat_turns(ctx.run.parent_run_id.as_deref(), CHAT_HISTORY_TURNS)
            .await?;

        let mut request = LlmRequest::new("chat_response");
        request.task_kind = Some("chat".to_string());
        request.run_id = Some(ctx.run.id.clone());
        request.task_id = Some(ctx.task.id.clone());
        request.step_id = Some(ctx.plan_step.id.clone());
        request.messages = build_chat_messages(&system_text, &history, &query);
        request.context_items = vec![ContextItem::text(
            query,
            SourceType::UserPrompt,
            Sensitivity::Personal,
        )];

        match ctx.brain.call(&request, &ctx.brain_ctx()).await {
            Ok(response) if response.status == aura_brain::LlmStatus::Ok => {
                ctx.emit(
                    "chat_response_generated",
                    "Ответ сформирован",
                    json!({
                        "provider": response.provider,
                        "model_id": response.model_id,
                        "latency_ms": response.latency_ms,
                        "text": response.text,
                    }),
                )
                .await;
                let mut result = SkillResult::new("Сформирован ответ в чате.");
                result.confidence = 0.9;
                result.events = vec![json!({"message": "ответ готов"})];
                Ok(result)
            }
            Ok(response) => {
                let text = phrases::chat_resilience_text(response.error_type.as_deref());
                ctx.emit(
                    "chat_response_generated",
                    "Ответ сформирован (degraded)",
                    json!({
                        "provider": response.provider,
                        "model_id": response.model_id,
                        "latency_ms": response.latency_ms,
                        "text": text,
                        "degraded": true,
                        "error_type": response.error_type,
                    }),
                )
                .await;
                let mut result = SkillResult::new("Сформирован резервный ответ в чате.");
                result.confidence = 0.3;
                Ok(result)
            }
            Err(error) => {
                let error_type = match &error {
                    aura_brain::BrainError::Provider(p) => Some(p.error_type.clone()),
                    _ => None,
                };
                let text = phrases::chat_resilience_text(error_type.as_deref());
                ctx.emit(
                    "chat_response_generated",
                    "Ответ сформирован (degraded)",
                    json!({
                        "provider": "local",
                        "model_id": null,
                        "latency_ms": null,
                        "text": text,
                        "degraded": true,
                        "error_type": error_type,
                    }),
                )
                .await;
                let mut result = SkillResult::new("Сформирован резервный ответ в чате.");
                result.confidence = 0.3;
                Ok(result)
            }
        }
    }
}
