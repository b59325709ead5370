use anyhow::bail;
use async_trait::async_trait;
use serde_json::{json, Value};

use aura_core::reminders::parse_reminder_text;
use aura_types::{SkillResult, SkillScope};

use crate::context::SkillContext;
use crate::registry::{Skill, SkillManifest};

fn default_delivery() -> &'static str {
    let token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
    let chat_id = std::env::var("TELEGRAM_CHAT_ID").unwrap_or_default();
    if !token.trim().is_empty() && !chat_id.trim().is_empty() {
        "telegram"
    } else {
        "local"
    }
}

pub struct ReminderCreateSkill {
    manifest: SkillManifest,
}

impl ReminderCreateSkill {
    pub fn new() -> Self {
        let schema = json!({
            "type": "object",
            "properties": {
                "due_at": {"type": "string"},
                "text": {"type": "string"},
                "delivery": {"type": "string", "enum": ["local", "telegram"]},
            },
        });
        Self {
            manifest: SkillManifest::new("reminder_create", SkillScope::Safe, schema)
                .with_side_effects(&["reminder_write"]),
        }
    }
}

impl Default for ReminderCreateSkill {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Skill for ReminderCreateSkill {
    fn manifest(&self) -> &SkillManifest {
        &self.manifest
    }

    async fn execute(&self, inputs: &Value, ctx: &SkillContext) -> anyhow::Result<SkillResult> {
        let mut due_at = inputs
            .get("due_at")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let mut text = inputs
            .get("text")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        if due_at.is_none() || text.is_none() {
            let parsed = parse_reminder_text(&ctx.run.query_text, None);
            due_at = due_at.or(parsed.due_at);
            text = text.or(parsed.text);
        }

        let (Some(due_at), Some(text)) = (due_at, text) else {
            bail!("reminder_parse_failed");
        };

        let delivery: &str = match inputs.get("delivery").and_then(|v| v.as_str()) {
            Some(d) => d,
            None => default_delivery(),
        };

        let reminder = ctx
            .store
            .create_reminder(
                &due_at,
                &text,
                delivery,
                Some(ctx.run.id.clone()),
                Some("user_command".to_string()),
            )
            .await?;

        ctx.emit(
            "reminder_created",
            "Напоминание создано",
            json!({
                "id": reminder.id,
                "due_at": reminder.due_at,
                "delivery": reminder.delivery,
            }),
        )
        .await;

        let mut result = SkillResult::new("Создано напоминание в локальном хранилище.");
        result.confidence = 1.0;
        Ok(result)
    }
}
