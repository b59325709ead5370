//! Turns a free-form "remember this" message into short, typed one-line
//! facts. Best-effort: any model or parse failure yields an empty list.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use aura_brain::{
    BrainRouter, CallContext, ChatMessage, ContextItem, LlmRequest, LlmStatus, Sensitivity,
    SourceType,
};

use crate::semantic::strict_local_settings;

pub const MAX_ITEMS: usize = 5;
pub const MIN_CONFIDENCE: f64 = 0.75;
pub const MAX_TEXT_LEN: usize = 160;

const PROMPT: &str = include_str!("prompts/memory_normalize.txt");

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

fn type_prefix(item_type: &str) -> &'static str {
    match item_type {
        "identity" => "Имя пользователя",
        "preference" => "Предпочтение",
        "rule" => "Правило",
        _ => "Факт",
    }
}

fn normalize_key(text: &str) -> String {
    WHITESPACE
        .replace_all(&text.trim().to_lowercase().replace('ё', "е"), " ")
        .into_owned()
}

fn ensure_period(text: &str) -> String {
    let stripped = text.trim();
    if stripped.is_empty() {
        return String::new();
    }
    if stripped.ends_with(['.', '!', '?']) {
        stripped.to_string()
    } else {
        format!("{stripped}.")
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let kept: String = text.chars().take(limit.saturating_sub(3)).collect();
    format!("{}...", kept.trim_end())
}

fn apply_prefix(item_type: &str, text: &str) -> String {
    let base = text.trim();
    if base.is_empty() {
        return String::new();
    }
    let prefix = type_prefix(item_type);
    if base.to_lowercase().starts_with(&prefix.to_lowercase()) {
        ensure_period(base)
    } else {
        ensure_period(&format!("{prefix}: {base}"))
    }
}

fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "type": {"type": "string", "enum": ["identity", "preference", "rule", "other"]},
                        "text": {"type": "string"},
                        "confidence": {"type": "number"},
                        "evidence": {"type": "string"},
                    },
                    "required": ["type", "text", "confidence", "evidence"],
                    "additionalProperties": false,
                },
            }
        },
        "required": ["items"],
        "additionalProperties": false,
    })
}

/// Filters, normalizes and dedups the raw model items. Split out so the
/// selection rules are testable without a model.
pub fn select_items(raw_items: &[Value], content: &str) -> Vec<String> {
    let mut results: Vec<String> = Vec::new();
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    let content_norm = normalize_key(content);

    for item in raw_items {
        if results.len() >= MAX_ITEMS {
            break;
        }
        let Some(item) = item.as_object() else { continue };
        let item_type = item.get("type").and_then(|v| v.as_str()).unwrap_or("other");
        let text = item.get("text").and_then(|v| v.as_str()).unwrap_or("").trim();
        let evidence = item
            .get("evidence")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        let Some(confidence) = item.get("confidence").and_then(|v| v.as_f64()) else {
            continue;
        };
        if confidence < MIN_CONFIDENCE || text.is_empty() || evidence.is_empty() {
            continue;
        }
        if !content.contains(evidence) {
            continue;
        }
        let normalized = truncate(&apply_prefix(item_type, text), MAX_TEXT_LEN);
        // A fact that is just the raw message copied back is useless.
        if normalize_key(&normalized) == content_norm {
            continue;
        }
        let key = normalize_key(&normalized);
        if seen.contains(&key) {
            continue;
        }
        seen.insert(key);
        results.push(normalized);
    }
    results
}

pub async fn normalize_memory_texts(
    content: &str,
    draft_items: &[String],
    brain: &BrainRouter,
    settings: &Value,
) -> Vec<String> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    let mut user_block = format!("Сообщение пользователя:\n{content}");
    let draft_lines: Vec<String> = draft_items
        .iter()
        .filter(|item| !item.trim().is_empty())
        .map(|item| format!("- {}", item.trim()))
        .collect();
    if !draft_lines.is_empty() {
        user_block = format!(
            "{user_block}\n\nЧерновик фактов (если есть, можно уточнить):\n{}",
            draft_lines.join("\n")
        );
    }

    let ctx = CallContext {
        settings: strict_local_settings(settings),
        ..Default::default()
    };
    let mut request = LlmRequest::new("memory_normalize");
    request.task_kind = Some("chat".to_string());
    request.messages = vec![ChatMessage::system(PROMPT.trim()), ChatMessage::user(user_block)];
    request.context_items = vec![ContextItem::text(
        content,
        SourceType::UserPrompt,
        Sensitivity::Personal,
    )];
    request.temperature = 0.1;
    request.max_tokens = Some(500);
    request.json_schema = Some(schema());

    let response = match brain.call(&request, &ctx).await {
        Ok(response) if response.status == LlmStatus::Ok => response,
        _ => return Vec::new(),
    };

    let Ok(data) = serde_json::from_str::<Value>(response.text.trim()) else {
        return Vec::new();
    };
    let raw_items = data
        .get("items")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    select_items(&raw_items, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_enforces_confidence_evidence_and_dedup() {
        let content = "запомни: меня зовут Михаил, отвечай коротко";
        let raw = vec![
            json!({"type": "identity", "text": "Михаил", "confidence": 0.95, "evidence": "меня зовут Михаил"}),
            json!({"type": "identity", "text": "Михаил", "confidence": 0.95, "evidence": "меня зовут Михаил"}),
            json!({"type": "preference", "text": "короткие ответы", "confidence": 0.5, "evidence": "отвечай коротко"}),
            json!({"type": "rule", "text": "не выдумано", "confidence": 0.9, "evidence": "этого нет в сообщении"}),
        ];
        let items = select_items(&raw, content);
        assert_eq!(items, vec!["Имя пользователя: Михаил."]);
    }

    #[test]
    fn raw_copy_of_message_is_dropped() {
        let content = "Факт: пользователь любит чай.";
        let raw = vec![json!({
            "type": "other",
            "text": "пользователь любит чай",
            "confidence": 0.9,
            "evidence": "пользователь любит чай",
        })];
        assert!(select_items(&raw, content).is_empty());
    }

    #[test]
    fn long_text_is_truncated_with_ellipsis() {
        let long = "о".repeat(300);
        let truncated = truncate(&long, MAX_TEXT_LEN);
        assert!(truncated.chars().count() <= MAX_TEXT_LEN);
        assert!(truncated.ends_with("..."));
    }
}
