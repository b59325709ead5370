use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use serde_json::{json, Value};

use aura_types::{Approval, ApprovalStatus, RunStatus, SkillResult, TaskStatus};

use crate::context::SkillContext;
use crate::registry::{Skill, SkillRegistry};
use crate::validate::validate_inputs;

const APPROVAL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Resolves the manifest, validates inputs, walks the scope gate and
/// invokes the skill. Confirm-gated skills are suspended on a pending
/// approval until a human (or run cancellation) resolves it.
pub struct SkillRunner {
    registry: Arc<SkillRegistry>,
}

impl SkillRunner {
    pub fn new(registry: Arc<SkillRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    pub async fn run_skill(&self, ctx: &SkillContext) -> anyhow::Result<SkillResult> {
        let skill_name = ctx.plan_step.skill_name.clone();
        let skill = self
            .registry
            .get(&skill_name)
            .ok_or_else(|| anyhow!("Навык не найден: {skill_name}"))?;
        let manifest = skill.manifest().clone();

        let inputs = ctx.plan_step.inputs.clone();
        validate_inputs(&manifest.inputs_schema, &inputs)?;

        if manifest.scope.needs_approval() {
            let payload = skill.build_approval(&inputs, ctx).unwrap_or_else(|| {
                json!({
                    "scope": manifest.name.clone(),
                    "title": format!("Подтверждение: {}", manifest.name),
                    "description": "Требуется подтверждение",
                    "proposed_actions": inputs.get("actions").cloned().unwrap_or_else(|| json!([])),
                })
            });
            if !coordinate_approval(ctx, payload).await? {
                bail!("approval_rejected");
            }
        }

        skill.execute(&inputs, ctx).await
    }
}

/// Creates the approval, parks the task in `waiting_approval`, polls for
/// the resolution and emits the full event sequence. Returns whether the
/// action was approved; run cancellation expires the approval.
pub(crate) async fn coordinate_approval(
    ctx: &SkillContext,
    payload: Value,
) -> anyhow::Result<bool> {
    let scope = payload
        .get("scope")
        .and_then(|v| v.as_str())
        .unwrap_or(&ctx.plan_step.skill_name)
        .to_string();
    let title = payload
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or("Требуется подтверждение")
        .to_string();
    let description = payload
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let proposed_actions = payload
        .get("proposed_actions")
        .cloned()
        .unwrap_or_else(|| json!([]));
    let approval_type = payload.get("approval_type").and_then(|v| v.as_str());
    let preview = payload.get("preview").cloned();

    let approval = ctx
        .store
        .create_approval(
            &ctx.run.id,
            &ctx.task.id,
            Some(&ctx.plan_step.id),
            &scope,
            approval_type,
            &title,
            &description,
            proposed_actions,
            preview,
        )
        .await?;

    ctx.emit(
        "approval_requested",
        "Запрошено подтверждение",
        json!({
            "approval_id": approval.id.clone(),
            "approval_type": approval.approval_type.clone(),
            "scope": approval.scope.clone(),
            "title": approval.title.clone(),
            "description": approval.description.clone(),
            "proposed_actions": approval.proposed_actions.clone(),
        }),
    )
    .await;
    ctx.emit(
        "step_paused_for_approval",
        "Шаг приостановлен до подтверждения",
        json!({"approval_id": approval.id.clone(), "step_id": ctx.plan_step.id.clone()}),
    )
    .await;
    ctx.store
        .update_task_status(&ctx.task.id, TaskStatus::WaitingApproval, None, None, None)
        .await?;

    let resolved = wait_for_approval(ctx, &approval.id).await?;
    if let Some(resolved) = &resolved {
        ctx.emit(
            "approval_resolved",
            "Подтверждение рассмотрено",
            json!({
                "approval_id": resolved.id.clone(),
                "status": resolved.status,
                "decision": resolved.decision.clone(),
                "approval_type": resolved.approval_type.clone(),
            }),
        )
        .await;
    }

    let approved = resolved
        .as_ref()
        .map(|a| a.status == ApprovalStatus::Approved)
        .unwrap_or(false);
    if approved {
        ctx.emit(
            "approval_approved",
            "Подтверждение принято",
            json!({"approval_id": approval.id.clone()}),
        )
        .await;
        ctx.store
            .update_task_status(&ctx.task.id, TaskStatus::Running, None, None, None)
            .await?;
    } else {
        ctx.emit(
            "approval_rejected",
            "Подтверждение отклонено",
            json!({"approval_id": approval.id.clone()}),
        )
        .await;
    }
    Ok(approved)
}

async fn wait_for_approval(
    ctx: &SkillContext,
    approval_id: &str,
) -> anyhow::Result<Option<Approval>> {
    loop {
        let Some(approval) = ctx.store.get_approval(approval_id).await? else {
            bail!("Подтверждение не найдено");
        };
        if approval.status.is_terminal() {
            return Ok(Some(approval));
        }
        if let Some(run) = ctx.store.get_run(&ctx.run.id).await? {
            if run.status == RunStatus::Canceled {
                let expired = ctx
                    .store
                    .update_approval_status(approval_id, ApprovalStatus::Expired, "system", None)
                    .await?;
                return Ok(expired);
            }
        }
        tokio::time::sleep(APPROVAL_POLL_INTERVAL).await;
    }
}
