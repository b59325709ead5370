use async_trait::async_trait;
use serde_json::{json, Value};

use aura_types::{SkillResult, SkillScope};

use crate::context::SkillContext;
use crate::registry::{Skill, SkillManifest};

pub struct ShellSkill {
    manifest: SkillManifest,
}

impl ShellSkill {
    pub fn new() -> Self {
        let schema = json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"},
                "args": {"type": "array", "items": {"type": "string"}},
            },
            "required": ["command"],
        });
        Self {
            manifest: SkillManifest::new("shell", SkillScope::Dangerous, schema)
                .with_side_effects(&["shell_execute"]),
        }
    }
}

impl Default for ShellSkill {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Skill for ShellSkill {
    fn manifest(&self) -> &SkillManifest {
        &self.manifest
    }

    fn build_approval(&self, inputs: &Value, _ctx: &SkillContext) -> Option<Value> {
        let command = inputs.get("command").and_then(|v| v.as_str()).unwrap_or("");
        Some(json!({
            "scope": "bash",
            "approval_type": "SHELL_COMMAND",
            "title": "Команда оболочки",
            "description": command,
            "proposed_actions": [{
                "command": command,
                "args": inputs.get("args").cloned().unwrap_or_else(|| json!([])),
            }],
            "preview": {
                "summary": format!("Выполнить команду: {command}"),
                "details": {"command": command},
                "risk": "Команда может изменить систему",
                "suggested_user_action": "Проверь команду и подтверди выполнение",
                "expires_in_ms": null,
            },
        }))
    }

    async fn execute(&self, inputs: &Value, ctx: &SkillContext) -> anyhow::Result<SkillResult> {
        let command = inputs.get("command").and_then(|v| v.as_str()).unwrap_or("");
        let _ = ctx.bridge.shell_execute(command).await?;
        let mut result = SkillResult::new("Выполнена команда оболочки через десктоп-мост.");
        result.confidence = 0.6;
        result.events = vec![json!({
            "message": "команда выполнена",
            "progress": {"current": 1, "total": 1, "unit": "команда"},
        })];
        Ok(result)
    }
}
