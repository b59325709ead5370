use std::time::{Duration, Instant};

use anyhow::bail;
use async_trait::async_trait;
use serde_json::{json, Value};

use aura_brain::{ContextItem, LlmRequest, Sensitivity, SourceType};
use aura_types::{RunStatus, SkillResult, SkillScope};

use crate::context::SkillContext;
use crate::registry::{Skill, SkillManifest};
use crate::runner::coordinate_approval;

const ALLOWED_ACTIONS: &[&str] = &[
    "move_mouse",
    "click",
    "double_click",
    "drag",
    "type",
    "key",
    "scroll",
    "wait",
];

const DANGEROUS_KEYWORDS: &[&str] = &[
    "оплат",
    "покуп",
    "перевод",
    "подписк",
    "удал",
    "очист",
    "отправ",
    "публикац",
];

const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn max_cycles_default() -> u64 {
    std::env::var("AURA_AUTOPILOT_MAX_CYCLES")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(30)
}

fn total_timeout() -> Duration {
    let seconds = std::env::var("AURA_AUTOPILOT_TOTAL_TIMEOUT_S")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(600);
    Duration::from_secs(seconds)
}

fn step_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "done": {"type": "boolean"},
            "reason": {"type": "string"},
            "action": {
                "anyOf": [
                    {"type": "null"},
                    {
                        "type": "object",
                        "properties": {
                            "type": {"type": "string", "enum": ALLOWED_ACTIONS},
                            "params": {"type": "object"},
                        },
                        "required": ["type"],
                    },
                ]
            },
        },
        "required": ["done"],
    })
}

fn looks_dangerous(goal: &str, action: &Value) -> bool {
    let haystack = format!("{} {}", goal.to_lowercase(), action.to_string().to_lowercase());
    DANGEROUS_KEYWORDS
        .iter()
        .any(|keyword| haystack.contains(keyword))
}

/// Drives the desktop through micro-steps: the brain proposes one typed
/// action per cycle from the goal plus the current screen observation,
/// the bridge executes it. Pause and cancel are observed between cycles;
/// dangerous actions escalate to an approval.
pub struct ComputerAutopilotSkill {
    manifest: SkillManifest,
}

impl ComputerAutopilotSkill {
    pub fn new() -> Self {
        let schema = json!({
            "type": "object",
            "properties": {
                "goal": {"type": "string"},
                "max_cycles": {"type": "integer"},
            },
        });
        Self {
            manifest: SkillManifest::new("computer_autopilot", SkillScope::Safe, schema)
                .with_capabilities(&["computer_control"])
                .with_side_effects(&["desktop_input"]),
        }
    }

    async fn propose_action(
        &self,
        goal: &str,
        cycle: u64,
        observation: &str,
        ctx: &SkillContext,
    ) -> anyhow::Result<Value> {
        let mut request = LlmRequest::new("autopilot_step");
        request.task_kind = Some("computer_actions".to_string());
        request.run_id = Some(ctx.run.id.clone());
        request.task_id = Some(ctx.task.id.clone());
        request.step_id = Some(ctx.plan_step.id.clone());
        request.messages = vec![
            aura_brain::ChatMessage::system(
                "Ты управляешь компьютером пользователя маленькими шагами. \
                 По цели и наблюдению экрана предложи ровно одно действие из списка \
                 move_mouse, click, double_click, drag, type, key, scroll, wait, \
                 либо done=true, если цель достигнута. Верни строго JSON.",
            ),
            aura_brain::ChatMessage::user(
                json!({"goal": goal, "cycle": cycle, "observation": observation}).to_string(),
            ),
        ];
        // The observation is screen text, so the router keeps the whole
        // call on the local model.
        request.context_items = vec![
            ContextItem::text(goal, SourceType::UserPrompt, Sensitivity::Personal),
            ContextItem::text(observation, SourceType::ScreenshotText, Sensitivity::Personal),
        ];
        request.temperature = 0.1;
        request.max_tokens = Some(400);
        request.json_schema = Some(step_schema());

        let response = ctx.brain.call(&request, &ctx.brain_ctx()).await?;
        if response.status != aura_brain::LlmStatus::Ok {
            bail!(
                "autopilot_llm_failed:{}",
                response.error_type.unwrap_or_else(|| "unknown".to_string())
            );
        }
        Ok(serde_json::from_str(response.text.trim()).unwrap_or_else(|_| json!({"done": true})))
    }
}

impl Default for ComputerAutopilotSkill {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Skill for ComputerAutopilotSkill {
    fn manifest(&self) -> &SkillManifest {
        &self.manifest
    }

    async fn execute(&self, inputs: &Value, ctx: &SkillContext) -> anyhow::Result<SkillResult> {
        let goal = inputs
            .get("goal")
            .and_then(|v| v.as_str())
            .filter(|g| !g.trim().is_empty())
            .unwrap_or(&ctx.run.query_text)
            .to_string();
        let max_cycles = inputs
            .get("max_cycles")
            .and_then(|v| v.as_u64())
            .unwrap_or_else(max_cycles_default);
        let deadline = Instant::now() + total_timeout();

        let mut executed: u64 = 0;
        let mut finished_reason: Option<String> = None;

        for cycle in 0..max_cycles {
            if Instant::now() >= deadline {
                finished_reason = Some("превышен лимит времени автопилота".to_string());
                break;
            }

            // Cooperative pause/cancel between micro-steps.
            loop {
                let Some(run) = ctx.store.get_run(&ctx.run.id).await? else {
                    bail!("Запуск не найден");
                };
                match run.status {
                    RunStatus::Canceled => {
                        ctx.emit(
                            "step_cancelled_by_user",
                            "Шаг остановлен: запуск отменён",
                            json!({"cycle": cycle}),
                        )
                        .await;
                        let mut result =
                            SkillResult::new("Выполнение остановлено: запуск отменён.");
                        result.confidence = 0.2;
                        return Ok(result);
                    }
                    RunStatus::Paused => {
                        tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
                        continue;
                    }
                    _ => break,
                }
            }

            let observation = ctx.bridge.capture_observation().await?;
            ctx.emit(
                "observation_captured",
                "Снято наблюдение экрана",
                json!({"cycle": cycle, "chars": observation.chars().count()}),
            )
            .await;

            let proposal = self.propose_action(&goal, cycle, &observation, ctx).await?;
            if proposal.get("qa_mode").and_then(|v| v.as_bool()).unwrap_or(false)
                || proposal.get("done").and_then(|v| v.as_bool()).unwrap_or(false)
            {
                finished_reason = proposal
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                break;
            }

            let Some(action) = proposal.get("action").filter(|a| a.is_object()) else {
                finished_reason = Some("модель не предложила действие".to_string());
                break;
            };
            let action_type = action.get("type").and_then(|v| v.as_str()).unwrap_or("");
            if !ALLOWED_ACTIONS.contains(&action_type) {
                bail!("autopilot_unknown_action:{action_type}");
            }

            ctx.emit(
                "micro_action_proposed",
                "Предложено микро-действие",
                json!({"cycle": cycle, "action": action, "reason": proposal.get("reason")}),
            )
            .await;

            if looks_dangerous(&goal, action) {
                let payload = json!({
                    "scope": "autopilot_danger",
                    "approval_type": "COMPUTER_ACTION",
                    "title": "Подтверждение действия автопилота",
                    "description": format!("Автопилот собирается выполнить: {action_type}"),
                    "proposed_actions": [action],
                    "preview": {
                        "summary": format!("Действие {action_type} может быть опасным"),
                        "details": {"action": action, "goal": goal.clone()},
                        "risk": "Действие затрагивает данные или внешние сервисы",
                        "suggested_user_action": "Подтвердите выполнение или отклоните",
                        "expires_in_ms": null,
                    },
                });
                if !coordinate_approval(ctx, payload).await? {
                    bail!("approval_rejected");
                }
            }

            let outcome = ctx.bridge.execute_action(action).await?;
            executed += 1;
            ctx.emit(
                "micro_action_executed",
                "Микро-действие выполнено",
                json!({"cycle": cycle, "action": action, "outcome": outcome}),
            )
            .await;
        }

        let what_i_did = match &finished_reason {
            Some(reason) => format!("Автопилот завершён: {reason}. Выполнено действий: {executed}."),
            None => format!("Автопилот завершён. Выполнено действий: {executed}."),
        };
        let mut result = SkillResult::new(what_i_did);
        result.confidence = if executed > 0 { 0.6 } else { 0.4 };
        result.events = vec![json!({
            "message": "автопилот завершил работу",
            "progress": {"current": executed, "total": executed.max(1), "unit": "действие"},
        })];
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn danger_keywords_are_detected() {
        let action = json!({"type": "click", "params": {"label": "Оплатить заказ"}});
        assert!(looks_dangerous("купи билет", &json!({"type": "wait"})));
        assert!(looks_dangerous("открой сайт", &action));
        assert!(!looks_dangerous("открой сайт", &json!({"type": "wait"})));
    }
}
