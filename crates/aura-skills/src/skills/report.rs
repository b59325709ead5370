use async_trait::async_trait;
use serde_json::{json, Value};

use aura_types::{ArtifactCandidate, Conflict, Fact, SkillResult, SkillScope, Source};

use crate::context::SkillContext;
use crate::registry::{Skill, SkillManifest};

fn render_report(
    run_id: &str,
    query_text: &str,
    sources: &[Source],
    facts: &[Fact],
    conflicts: &[Conflict],
) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!("# Отчёт по запуску {run_id}"));
    lines.push(String::new());
    lines.push("## Запрос".to_string());
    lines.push(query_text.to_string());
    lines.push(String::new());

    lines.push("## Источники".to_string());
    if sources.is_empty() {
        lines.push("- Не найдено".to_string());
    }
    for source in sources {
        let title = source.title.as_deref().unwrap_or(&source.url);
        lines.push(format!("- {title} ({})", source.url));
        if let Some(snippet) = &source.snippet {
            lines.push(format!("  - {snippet}"));
        }
    }
    lines.push(String::new());

    lines.push("## Факты".to_string());
    if facts.is_empty() {
        lines.push("- Не найдено".to_string());
    }
    for fact in facts {
        lines.push(format!(
            "- **{}**: {} (уверенность: {})",
            fact.key, fact.value, fact.confidence
        ));
    }
    lines.push(String::new());

    lines.push("## Конфликты".to_string());
    if conflicts.is_empty() {
        lines.push("- Нет".to_string());
    }
    for conflict in conflicts {
        lines.push(format!("- {}", conflict.fact_key));
        if let Some(entries) = conflict.group.as_array() {
            for entry in entries {
                lines.push(format!(
                    "  - {} (источники: {})",
                    entry.get("value").unwrap_or(&Value::Null),
                    entry.get("source_ids").unwrap_or(&Value::Null)
                ));
            }
        }
    }
    lines.push(String::new());

    lines.push("## Итог".to_string());
    if facts.is_empty() {
        lines.push("- Факты не извлечены.".to_string());
    } else {
        lines.push("- Сводка собрана на основе извлечённых фактов.".to_string());
    }
    lines.push(String::new());

    lines.join("\n")
}

pub struct ReportSkill {
    manifest: SkillManifest,
}

impl ReportSkill {
    pub fn new() -> Self {
        let schema = json!({"type": "object", "properties": {}});
        Self {
            manifest: SkillManifest::new("report", SkillScope::Safe, schema)
                .with_side_effects(&["artifact_write"]),
        }
    }
}

impl Default for ReportSkill {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Skill for ReportSkill {
    fn manifest(&self) -> &SkillManifest {
        &self.manifest
    }

    async fn execute(&self, _inputs: &Value, ctx: &SkillContext) -> anyhow::Result<SkillResult> {
        let run_id = ctx.run.id.clone();
        let sources = ctx.store.list_sources(&run_id).await?;
        let facts = ctx.store.list_facts(&run_id).await?;
        let conflicts = ctx.store.list_conflicts(&run_id).await?;
        let report_md = render_report(&run_id, &ctx.run.query_text, &sources, &facts, &conflicts);

        let out_dir = ctx.base_dir.join("artifacts").join(&run_id);
        tokio::fs::create_dir_all(&out_dir).await?;
        let report_path = out_dir.join("report.md");
        tokio::fs::write(&report_path, &report_md).await?;

        let mut result =
            SkillResult::new("Сформирован markdown-отчёт на основе источников, фактов и конфликтов.");
        result.confidence = if facts.is_empty() { 0.3 } else { 0.6 };
        result.artifacts = vec![ArtifactCandidate {
            artifact_type: "report_md".to_string(),
            title: "Отчёт".to_string(),
            content_uri: report_path.to_string_lossy().into_owned(),
            meta: json!({"format": "markdown"}),
            created_at: None,
        }];
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_renders_sections() {
        let report = render_report("run-1", "что известно", &[], &[], &[]);
        assert!(report.contains("# Отчёт по запуску run-1"));
        assert!(report.contains("## Источники"));
        assert!(report.contains("- Не найдено"));
        assert!(report.contains("- Факты не извлечены."));
    }
}
