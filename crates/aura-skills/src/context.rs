use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use aura_brain::{BrainRouter, CallContext};
use aura_store::{EventBus, Store};
use aura_types::{PlanStep, Run, Task};

use crate::bridge::DesktopBridge;

/// Everything a skill may touch while executing one task.
#[derive(Clone)]
pub struct SkillContext {
    pub run: Run,
    pub plan_step: PlanStep,
    pub task: Task,
    pub settings: Value,
    pub base_dir: PathBuf,
    pub store: Arc<Store>,
    pub bus: EventBus,
    pub brain: Arc<BrainRouter>,
    pub bridge: Arc<dyn DesktopBridge>,
}

impl SkillContext {
    pub fn brain_ctx(&self) -> CallContext {
        CallContext {
            run_id: Some(self.run.id.clone()),
            task_id: Some(self.task.id.clone()),
            step_id: Some(self.plan_step.id.clone()),
            settings: self.settings.clone(),
            qa_mode: self.run.meta_bool("qa_mode"),
        }
    }

    pub async fn emit(&self, event_type: &str, message: &str, payload: Value) {
        // Placeholder contexts (e.g. memory save during chat) carry empty
        // task/step ids; those must not land in the event log.
        let task_id = Some(self.task.id.as_str()).filter(|id| !id.is_empty());
        let step_id = Some(self.plan_step.id.as_str()).filter(|id| !id.is_empty());
        if let Err(error) = self
            .bus
            .emit_scoped(&self.run.id, event_type, message, payload, task_id, step_id)
            .await
        {
            tracing::warn!(%error, event_type, "failed to append skill event");
        }
    }
}
