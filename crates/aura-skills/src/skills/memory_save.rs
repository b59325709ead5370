use anyhow::bail;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use aura_core::normalize::normalize_memory_texts;
use aura_types::{SkillResult, SkillScope, UserMemory};

use crate::context::SkillContext;
use crate::registry::{Skill, SkillManifest};

const MAX_FACT_LEN: usize = 220;
const MAX_SUMMARY_LEN: usize = 320;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

fn truncate_fact(text: &str) -> String {
    if text.chars().count() <= MAX_FACT_LEN {
        return text.to_string();
    }
    let kept: String = text.chars().take(MAX_FACT_LEN - 3).collect();
    format!("{}...", kept.trim_end())
}

fn normalize_fact(text: &str) -> String {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return cleaned;
    }
    if cleaned.ends_with(['.', '!', '?']) {
        cleaned
    } else {
        format!("{cleaned}.")
    }
}

fn norm_key(value: &str) -> String {
    WHITESPACE
        .replace_all(&value.trim().to_lowercase().replace('ё', "е"), " ")
        .into_owned()
}

fn dedup_fact(fact: &str, existing: &[UserMemory]) -> Option<String> {
    let norm = norm_key(fact);
    if norm.is_empty() {
        return None;
    }
    if existing.iter().any(|item| norm_key(&item.content) == norm) {
        return None;
    }
    Some(fact.to_string())
}

fn clean_confidence(value: Option<&Value>) -> f64 {
    value.and_then(|v| v.as_f64()).unwrap_or(0.0).clamp(0.0, 1.0)
}

fn normalize_kv_items(values: Option<&Value>, require_evidence: bool, limit: usize) -> Vec<Value> {
    let Some(items) = values.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    let mut result = Vec::new();
    for item in items {
        if result.len() >= limit {
            break;
        }
        let Some(item) = item.as_object() else { continue };
        let key = item.get("key").and_then(|v| v.as_str()).unwrap_or("").trim();
        let value = item.get("value").and_then(|v| v.as_str()).unwrap_or("").trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        let mut payload = Map::new();
        payload.insert("key".to_string(), json!(key));
        payload.insert("value".to_string(), json!(value));
        payload.insert(
            "confidence".to_string(),
            json!(clean_confidence(item.get("confidence"))),
        );
        match item.get("evidence").and_then(|v| v.as_str()).map(str::trim) {
            Some(evidence) if !evidence.is_empty() => {
                payload.insert("evidence".to_string(), json!(evidence));
            }
            _ if require_evidence => continue,
            _ => {}
        }
        result.push(Value::Object(payload));
    }
    result
}

/// Structured interpretation payload attached by the planner or the chat
/// flow; `summary` is the actual memory content.
fn structured_payload(inputs: &Value) -> anyhow::Result<Option<Value>> {
    let Some(raw) = inputs.get("memory_payload").filter(|v| v.is_object()) else {
        return Ok(None);
    };
    let title = raw
        .get("title")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("Профиль пользователя");
    let summary = raw
        .get("summary")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or("");
    if summary.is_empty() {
        bail!("memory_payload_summary_missing");
    }
    let facts = normalize_kv_items(raw.get("facts"), true, 12);
    let preferences = normalize_kv_items(raw.get("preferences"), false, 12);
    let possible_facts = normalize_kv_items(raw.get("possible_facts"), true, 12);

    Ok(Some(json!({
        "title": title,
        "summary": summary,
        "meta": {
            "schema": "memory_interpretation.v1",
            "summary": summary,
            "confidence": clean_confidence(raw.get("confidence")),
            "facts": facts,
            "preferences": preferences,
            "possible_facts": possible_facts,
        },
    })))
}

pub struct MemorySaveSkill {
    manifest: SkillManifest,
}

impl MemorySaveSkill {
    pub fn new() -> Self {
        let schema = json!({
            "type": "object",
            "properties": {
                "content": {"type": "string"},
                "title": {"type": "string"},
                "tags": {"type": "array", "items": {"type": "string"}},
                "origin": {"type": "string"},
                "facts": {"type": "array", "items": {"type": "string"}},
                "memory_payload": {"type": "object"},
            },
        });
        Self {
            manifest: SkillManifest::new("memory_save", SkillScope::Safe, schema)
                .with_side_effects(&["memory_write"]),
        }
    }

    fn nothing_new() -> SkillResult {
        let mut result = SkillResult::new("Нет новых фактов для сохранения.");
        result.confidence = 0.3;
        result
    }
}

impl Default for MemorySaveSkill {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Skill for MemorySaveSkill {
    fn manifest(&self) -> &SkillManifest {
        &self.manifest
    }

    async fn execute(&self, inputs: &Value, ctx: &SkillContext) -> anyhow::Result<SkillResult> {
        let mut content = inputs
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if content.is_empty() {
            content = ctx.run.query_text.trim().to_string();
        }
        let title = inputs.get("title").and_then(|v| v.as_str());
        let tags: Option<Vec<String>> = inputs.get("tags").and_then(|v| v.as_array()).map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        });
        let origin = inputs
            .get("origin")
            .and_then(|v| v.as_str())
            .unwrap_or("user_command")
            .to_string();
        let auto = origin == "auto";

        ctx.emit(
            "memory_save_requested",
            "Запрошено сохранение в память",
            json!({"from": origin, "preview_len": content.chars().count()}),
        )
        .await;

        let existing = ctx
            .store
            .list_user_memories(None, None, 200, false)
            .await
            .unwrap_or_default();

        if let Some(structured) = structured_payload(inputs)? {
            let summary: String = structured["summary"]
                .as_str()
                .unwrap_or("")
                .chars()
                .take(MAX_SUMMARY_LEN)
                .collect();
            let summary = truncate_fact(&normalize_fact(&summary));
            let Some(summary) = dedup_fact(&summary, &existing) else {
                if auto {
                    return Ok(Self::nothing_new());
                }
                bail!("memory_extract_empty");
            };
            let memory = ctx
                .store
                .create_user_memory(
                    Some(title.unwrap_or_else(|| structured["title"].as_str().unwrap_or(""))),
                    &summary,
                    tags,
                    &origin,
                    structured["meta"].clone(),
                )
                .await?;
            ctx.emit(
                "memory_saved",
                "Память сохранена",
                json!({
                    "memory_id": memory.id,
                    "title": memory.title,
                    "len": memory.content.chars().count(),
                    "tags_count": memory.tags.len(),
                    "origin": origin,
                }),
            )
            .await;
            let mut result = SkillResult::new("Записано фактов: 1.");
            result.confidence = 1.0;
            return Ok(result);
        }

        let explicit_fact = inputs
            .get("facts")
            .and_then(|v| v.as_array())
            .and_then(|items| items.iter().find_map(|v| v.as_str()))
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(|f| f.to_string());
        let fact = match explicit_fact {
            Some(fact) => Some(fact),
            None => normalize_memory_texts(&content, &[], &ctx.brain, &ctx.settings)
                .await
                .into_iter()
                .next(),
        };
        let Some(fact) = fact else {
            if auto {
                return Ok(Self::nothing_new());
            }
            bail!("memory_extract_empty");
        };

        let fact = truncate_fact(&normalize_fact(&fact));
        let Some(fact) = dedup_fact(&fact, &existing) else {
            if auto {
                return Ok(Self::nothing_new());
            }
            bail!("memory_extract_empty");
        };

        let memory = ctx
            .store
            .create_user_memory(title, &fact, tags, &origin, json!({}))
            .await?;
        ctx.emit(
            "memory_saved",
            "Память сохранена",
            json!({
                "memory_id": memory.id,
                "title": memory.title,
                "len": memory.content.chars().count(),
                "tags_count": memory.tags.len(),
                "origin": origin,
            }),
        )
        .await;

        let mut result = SkillResult::new("Записано фактов: 1.");
        result.confidence = 1.0;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_payload_requires_summary() {
        let inputs = json!({"memory_payload": {"title": "Профиль", "summary": "  "}});
        assert!(structured_payload(&inputs).is_err());
        let inputs = json!({"memory_payload": {
            "summary": "Пользователь представился как Михаил.",
            "facts": [
                {"key": "user.name", "value": "Михаил", "confidence": 0.9, "evidence": "я Михаил"},
                {"key": "user.city", "value": "Москва", "confidence": 0.8},
            ],
        }});
        let structured = structured_payload(&inputs).unwrap().unwrap();
        // The second fact has no evidence and is dropped.
        assert_eq!(structured["meta"]["facts"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn facts_are_normalized_and_truncated() {
        assert_eq!(normalize_fact("  любит   чай  "), "любит чай.");
        let long = "б".repeat(400);
        assert!(truncate_fact(&long).chars().count() <= MAX_FACT_LEN);
    }
}
