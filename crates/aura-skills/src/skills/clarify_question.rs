use async_trait::async_trait;
use serde_json::{json, Value};

use aura_core::phrases;
use aura_types::{SkillResult, SkillScope};

use crate::context::SkillContext;
use crate::registry::{Skill, SkillManifest};

pub struct ClarifyQuestionSkill {
    manifest: SkillManifest,
}

impl ClarifyQuestionSkill {
    pub fn new() -> Self {
        let schema = json!({
            "type": "object",
            "properties": {
                "questions": {"type": "array", "items": {"type": "string"}},
            },
        });
        Self {
            manifest: SkillManifest::new("clarify_question", SkillScope::Safe, schema),
        }
    }
}

impl Default for ClarifyQuestionSkill {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Skill for ClarifyQuestionSkill {
    fn manifest(&self) -> &SkillManifest {
        &self.manifest
    }

    async fn execute(&self, inputs: &Value, ctx: &SkillContext) -> anyhow::Result<SkillResult> {
        let questions = inputs
            .get("questions")
            .and_then(|v| v.as_array())
            .cloned()
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| vec![json!(phrases::ASK_CLARIFY_ACTION)]);

        ctx.emit(
            "clarify_requested",
            "Запрошено уточнение",
            json!({"questions": questions}),
        )
        .await;

        let mut result = SkillResult::new("Задан уточняющий вопрос пользователю.");
        result.confidence = 1.0;
        result.events = vec![json!({"message": "ожидается уточнение от пользователя"})];
        Ok(result)
    }
}
