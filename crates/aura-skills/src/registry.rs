use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use aura_types::{SkillResult, SkillScope};

use crate::context::SkillContext;
use crate::skills;

/// Declarative description of a skill: what it does, what it consumes and
/// which safety tier gates it.
#[derive(Debug, Clone, Serialize)]
pub struct SkillManifest {
    pub name: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub side_effects: Vec<String>,
    pub scope: SkillScope,
    pub inputs_schema: Value,
}

impl SkillManifest {
    pub fn new(name: &str, scope: SkillScope, inputs_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            version: "0.1.0".to_string(),
            capabilities: Vec::new(),
            side_effects: Vec::new(),
            scope,
            inputs_schema,
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_side_effects(mut self, side_effects: &[&str]) -> Self {
        self.side_effects = side_effects.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[async_trait]
pub trait Skill: Send + Sync {
    fn manifest(&self) -> &SkillManifest;

    /// Optional structured approval request for confirm-gated skills.
    fn build_approval(&self, inputs: &Value, ctx: &SkillContext) -> Option<Value> {
        let _ = (inputs, ctx);
        None
    }

    async fn execute(&self, inputs: &Value, ctx: &SkillContext) -> anyhow::Result<SkillResult>;
}

/// In-process registry mapping `skill_name` to its implementation.
pub struct SkillRegistry {
    skills: HashMap<String, Arc<dyn Skill>>,
}

impl SkillRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self {
            skills: HashMap::new(),
        };
        registry.register(Arc::new(skills::chat_response::ChatResponseSkill::new()));
        registry.register(Arc::new(skills::clarify_question::ClarifyQuestionSkill::new()));
        registry.register(Arc::new(skills::memory_save::MemorySaveSkill::new()));
        registry.register(Arc::new(skills::reminder_create::ReminderCreateSkill::new()));
        registry.register(Arc::new(skills::web_research::WebResearchSkill::new()));
        registry.register(Arc::new(
            skills::computer_autopilot::ComputerAutopilotSkill::new(),
        ));
        registry.register(Arc::new(skills::shell::ShellSkill::new()));
        registry.register(Arc::new(skills::report::ReportSkill::new()));
        registry
    }

    pub fn register(&mut self, skill: Arc<dyn Skill>) {
        self.skills.insert(skill.manifest().name.clone(), skill);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Skill>> {
        self.skills.get(name).cloned()
    }

    pub fn get_manifest(&self, name: &str) -> Option<SkillManifest> {
        self.skills.get(name).map(|skill| skill.manifest().clone())
    }

    pub fn list_manifests(&self) -> Vec<SkillManifest> {
        let mut manifests: Vec<SkillManifest> = self
            .skills
            .values()
            .map(|skill| skill.manifest().clone())
            .collect();
        manifests.sort_by(|a, b| a.name.cmp(&b.name));
        manifests
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_expected_skills() {
        let registry = SkillRegistry::builtin();
        for name in [
            "chat_response",
            "clarify_question",
            "memory_save",
            "reminder_create",
            "web_research",
            "computer_autopilot",
            "shell",
            "report",
        ] {
            assert!(registry.get(name).is_some(), "missing skill {name}");
        }
        assert_eq!(
            registry.get_manifest("shell").unwrap().scope,
            SkillScope::Dangerous
        );
        assert_eq!(
            registry.get_manifest("memory_save").unwrap().scope,
            SkillScope::Safe
        );
    }
}
