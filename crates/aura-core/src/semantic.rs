//! Single-call semantic classifier. Always runs against the local model
//! (strict_local is forced) and validates the JSON reply against a closed
//! schema with typed error codes. Degradation on failure is owned by the
//! caller, never by this module.

use serde::Serialize;
use serde_json::{json, Value};

use aura_brain::{
    BrainRouter, CallContext, ChatMessage, ContextItem, LlmRequest, LlmStatus, Sensitivity,
    SourceType,
};

pub const INTENT_CHAT: &str = "CHAT";
pub const INTENT_ACT: &str = "ACT";
pub const INTENT_ASK: &str = "ASK_CLARIFY";

pub const VALID_MEMORY_KINDS: &[&str] =
    &["user_profile", "assistant_profile", "user_preference", "other"];

pub const VALID_PLAN_HINTS: &[&str] = &[
    "CHAT_RESPONSE",
    "CLARIFY_QUESTION",
    "WEB_RESEARCH",
    "BROWSER_RESEARCH_UI",
    "COMPUTER_ACTIONS",
    "DOCUMENT_WRITE",
    "FILE_ORGANIZE",
    "CODE_ASSIST",
    "MEMORY_COMMIT",
    "REMINDER_CREATE",
    "SMOKE_RUN",
];

const PROMPT: &str = include_str!("prompts/semantic_decision.md");

#[derive(Debug, thiserror::Error)]
#[error("{code}: {detail}")]
pub struct SemanticDecisionError {
    pub code: String,
    pub detail: String,
}

impl SemanticDecisionError {
    pub fn new(code: &str, detail: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            detail: detail.into(),
        }
    }

    fn bare(code: &str) -> Self {
        Self::new(code, code)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SemanticMemoryItem {
    pub kind: String,
    pub text: String,
    pub evidence: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SemanticDecision {
    pub intent: String,
    pub confidence: f64,
    pub memory_item: Option<SemanticMemoryItem>,
    pub plan_hint: Vec<String>,
    pub response_style_hint: Option<String>,
    pub user_visible_note: Option<String>,
    #[serde(skip)]
    pub raw: Value,
}

fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "intent": {"type": "string", "enum": [INTENT_ACT, INTENT_ASK, INTENT_CHAT]},
            "confidence": {"type": "number"},
            "memory_item": {
                "anyOf": [
                    {"type": "null"},
                    {
                        "type": "object",
                        "properties": {
                            "kind": {"type": "string", "enum": VALID_MEMORY_KINDS},
                            "text": {"type": "string"},
                            "evidence": {"type": "string"},
                        },
                        "required": ["kind", "text", "evidence"],
                        "additionalProperties": false,
                    },
                ]
            },
            "plan_hint": {"type": "array", "items": {"type": "string", "enum": VALID_PLAN_HINTS}},
            "response_style_hint": {"type": ["string", "null"]},
            "user_visible_note": {"type": ["string", "null"]},
        },
        "required": ["intent", "confidence", "memory_item", "plan_hint", "response_style_hint", "user_visible_note"],
        "additionalProperties": false,
    })
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn as_optional_text(value: &Value, field: &str) -> Result<Option<String>, SemanticDecisionError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => {
            let normalized = collapse_whitespace(s.trim());
            Ok(if normalized.is_empty() { None } else { Some(normalized) })
        }
        _ => Err(SemanticDecisionError::new(
            "semantic_decision_invalid_field",
            format!("{field} must be string or null"),
        )),
    }
}

fn parse_memory_item(
    value: &Value,
    user_text: &str,
) -> Result<Option<SemanticMemoryItem>, SemanticDecisionError> {
    match value {
        Value::Null => Ok(None),
        Value::Array(_) => Err(SemanticDecisionError::new(
            "semantic_decision_memory_item_must_be_object",
            "memory_item array is forbidden",
        )),
        Value::Object(map) => {
            let kind = map.get("kind").and_then(|v| v.as_str()).unwrap_or("");
            if !VALID_MEMORY_KINDS.contains(&kind) {
                return Err(SemanticDecisionError::new(
                    "semantic_decision_memory_item_invalid_kind",
                    "memory_item.kind is invalid",
                ));
            }
            let text = map
                .get("text")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    SemanticDecisionError::new(
                        "semantic_decision_memory_item_invalid_text",
                        "memory_item.text is required",
                    )
                })?;
            let evidence = map
                .get("evidence")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .ok_or_else(|| {
                    SemanticDecisionError::new(
                        "semantic_decision_memory_item_invalid_evidence",
                        "memory_item.evidence is required",
                    )
                })?;
            if !user_text.contains(evidence) {
                return Err(SemanticDecisionError::new(
                    "semantic_decision_evidence_not_substring",
                    "memory_item.evidence must be a direct substring of user message",
                ));
            }
            Ok(Some(SemanticMemoryItem {
                kind: kind.to_string(),
                text: collapse_whitespace(text),
                evidence: evidence.to_string(),
            }))
        }
        _ => Err(SemanticDecisionError::new(
            "semantic_decision_memory_item_invalid",
            "memory_item must be object or null",
        )),
    }
}

fn parse_plan_hint(value: &Value) -> Result<Vec<String>, SemanticDecisionError> {
    let Some(items) = value.as_array() else {
        return Err(SemanticDecisionError::new(
            "semantic_decision_plan_hint_invalid",
            "plan_hint must be an array",
        ));
    };
    let mut result: Vec<String> = Vec::new();
    for item in items {
        let Some(hint) = item.as_str() else {
            return Err(SemanticDecisionError::new(
                "semantic_decision_plan_hint_invalid",
                "plan_hint entries must be strings",
            ));
        };
        if !VALID_PLAN_HINTS.contains(&hint) {
            return Err(SemanticDecisionError::new(
                "semantic_decision_plan_hint_unknown",
                format!("unknown plan_hint: {hint}"),
            ));
        }
        if !result.iter().any(|h| h == hint) {
            result.push(hint.to_string());
        }
    }
    Ok(result)
}

pub fn parse_response(text: &str, user_text: &str) -> Result<SemanticDecision, SemanticDecisionError> {
    let raw_text = text.trim();
    if raw_text.is_empty() {
        return Err(SemanticDecisionError::bare("semantic_decision_empty_response"));
    }

    let data: Value = serde_json::from_str(raw_text)
        .map_err(|e| SemanticDecisionError::new("semantic_decision_invalid_json", e.to_string()))?;
    if !data.is_object() {
        return Err(SemanticDecisionError::new(
            "semantic_decision_invalid_payload",
            "response must be JSON object",
        ));
    }

    let intent = data.get("intent").and_then(|v| v.as_str()).unwrap_or("");
    if !matches!(intent, INTENT_CHAT | INTENT_ACT | INTENT_ASK) {
        return Err(SemanticDecisionError::new(
            "semantic_decision_invalid_intent",
            "intent is invalid",
        ));
    }

    let confidence = data
        .get("confidence")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| {
            SemanticDecisionError::new(
                "semantic_decision_invalid_confidence",
                "confidence must be number",
            )
        })?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(SemanticDecisionError::new(
            "semantic_decision_invalid_confidence",
            "confidence must be in [0, 1]",
        ));
    }

    let memory_item = parse_memory_item(data.get("memory_item").unwrap_or(&Value::Null), user_text)?;
    let plan_hint = parse_plan_hint(data.get("plan_hint").unwrap_or(&Value::Null))?;
    let response_style_hint = as_optional_text(
        data.get("response_style_hint").unwrap_or(&Value::Null),
        "response_style_hint",
    )?;
    let user_visible_note = as_optional_text(
        data.get("user_visible_note").unwrap_or(&Value::Null),
        "user_visible_note",
    )?;

    Ok(SemanticDecision {
        intent: intent.to_string(),
        confidence,
        memory_item,
        plan_hint,
        response_style_hint,
        user_visible_note,
        raw: data,
    })
}

/// Forces strict-local privacy on a settings object for classifier-family
/// calls: they must never reach the cloud.
pub fn strict_local_settings(settings: &Value) -> Value {
    let mut settings = if settings.is_object() {
        settings.clone()
    } else {
        json!({})
    };
    let privacy = settings
        .get("privacy")
        .cloned()
        .unwrap_or_else(|| json!({}));
    let mut privacy = if privacy.is_object() { privacy } else { json!({}) };
    privacy["strict_local"] = json!(true);
    privacy["cloud_allowed"] = json!(false);
    privacy["auto_cloud_enabled"] = json!(false);
    settings["privacy"] = privacy;
    settings
}

pub async fn decide_semantic(
    user_text: &str,
    brain: &BrainRouter,
    run_id: Option<&str>,
    settings: &Value,
) -> Result<SemanticDecision, SemanticDecisionError> {
    let text = user_text.trim();
    if text.is_empty() {
        return Err(SemanticDecisionError::bare("semantic_decision_empty_input"));
    }

    let ctx = CallContext {
        run_id: run_id.map(|s| s.to_string()),
        settings: strict_local_settings(settings),
        ..Default::default()
    };

    let mut request = LlmRequest::new("semantic_decision");
    request.task_kind = Some("intent_classification".to_string());
    request.run_id = run_id.map(|s| s.to_string());
    request.messages = vec![
        ChatMessage::system(PROMPT.trim()),
        ChatMessage::user(format!("Сообщение пользователя:\n{text}")),
    ];
    request.context_items = vec![ContextItem::text(
        text,
        SourceType::UserPrompt,
        Sensitivity::Personal,
    )];
    request.temperature = 0.0;
    request.max_tokens = Some(600);
    request.json_schema = Some(schema());

    let response = brain.call(&request, &ctx).await.map_err(|e| {
        SemanticDecisionError::new("semantic_decision_llm_call_failed", e.to_string())
    })?;
    if response.status != LlmStatus::Ok {
        let detail = response
            .error_type
            .unwrap_or_else(|| response.status.as_str().to_string());
        return Err(SemanticDecisionError::new("semantic_decision_llm_failed", detail));
    }

    parse_response(&response.text, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_decision_parses() {
        let raw = json!({
            "intent": "CHAT",
            "confidence": 0.9,
            "memory_item": {
                "kind": "user_profile",
                "text": "Имя пользователя: Михаил.",
                "evidence": "меня Михаил зовут",
            },
            "plan_hint": ["CHAT_RESPONSE", "CHAT_RESPONSE"],
            "response_style_hint": null,
            "user_visible_note": null,
        })
        .to_string();
        let decision = parse_response(&raw, "кстати меня Михаил зовут").unwrap();
        assert_eq!(decision.intent, INTENT_CHAT);
        assert_eq!(decision.plan_hint, vec!["CHAT_RESPONSE"]);
        let item = decision.memory_item.unwrap();
        assert_eq!(item.kind, "user_profile");
    }

    #[test]
    fn memory_item_array_is_rejected() {
        let raw = json!({
            "intent": "CHAT",
            "confidence": 0.9,
            "memory_item": [],
            "plan_hint": [],
            "response_style_hint": null,
            "user_visible_note": null,
        })
        .to_string();
        let err = parse_response(&raw, "привет").unwrap_err();
        assert_eq!(err.code, "semantic_decision_memory_item_must_be_object");
    }

    #[test]
    fn evidence_must_be_substring() {
        let raw = json!({
            "intent": "CHAT",
            "confidence": 0.9,
            "memory_item": {
                "kind": "user_profile",
                "text": "Имя пользователя: Пётр.",
                "evidence": "меня Пётр зовут",
            },
            "plan_hint": [],
            "response_style_hint": null,
            "user_visible_note": null,
        })
        .to_string();
        let err = parse_response(&raw, "кстати меня Михаил зовут").unwrap_err();
        assert_eq!(err.code, "semantic_decision_evidence_not_substring");
    }

    #[test]
    fn unknown_plan_hint_is_rejected() {
        let raw = json!({
            "intent": "ACT",
            "confidence": 0.5,
            "memory_item": null,
            "plan_hint": ["TIME_TRAVEL"],
            "response_style_hint": null,
            "user_visible_note": null,
        })
        .to_string();
        let err = parse_response(&raw, "сделай").unwrap_err();
        assert_eq!(err.code, "semantic_decision_plan_hint_unknown");
    }

    #[test]
    fn invalid_json_and_confidence_are_typed() {
        assert_eq!(
            parse_response("не json", "x").unwrap_err().code,
            "semantic_decision_invalid_json"
        );
        let raw = json!({
            "intent": "CHAT",
            "confidence": 1.5,
            "memory_item": null,
            "plan_hint": [],
            "response_style_hint": null,
            "user_visible_note": null,
        })
        .to_string();
        assert_eq!(
            parse_response(&raw, "x").unwrap_err().code,
            "semantic_decision_invalid_confidence"
        );
    }

    #[test]
    fn strict_local_settings_force_privacy() {
        let settings = json!({"privacy": {"cloud_allowed": true}});
        let forced = strict_local_settings(&settings);
        assert_eq!(forced["privacy"]["strict_local"], json!(true));
        assert_eq!(forced["privacy"]["cloud_allowed"], json!(false));
        assert_eq!(forced["privacy"]["auto_cloud_enabled"], json!(false));
    }
}
