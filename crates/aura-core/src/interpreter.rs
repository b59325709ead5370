//! Memory interpreter: a local-only call that extracts durable user facts
//! and preferences from one message plus recent history. Failures are
//! typed and recorded by the caller, never fatal for the run.

use serde_json::{json, Map, Value};

use aura_brain::{
    BrainRouter, CallContext, ChatMessage, ContextItem, LlmRequest, LlmStatus, Sensitivity,
    SourceType,
};
use aura_store::ChatTurn;

use crate::semantic::strict_local_settings;

pub const MIN_STORE_CONFIDENCE: f64 = 0.55;

const PROMPT: &str = include_str!("prompts/memory_interpreter.txt");

#[derive(Debug, thiserror::Error)]
#[error("{code}: {detail}")]
pub struct MemoryInterpretationError {
    pub code: String,
    pub detail: String,
}

impl MemoryInterpretationError {
    fn new(code: &str, detail: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            detail: detail.into(),
        }
    }

    fn bare(code: &str) -> Self {
        Self::new(code, code)
    }
}

fn schema() -> Value {
    let fact_item = json!({
        "type": "object",
        "properties": {
            "key": {"type": "string"},
            "value": {"type": "string"},
            "confidence": {"type": "number"},
            "evidence": {"type": "string"},
        },
        "required": ["key", "value", "confidence", "evidence"],
        "additionalProperties": false,
    });
    let pref_item = json!({
        "type": "object",
        "properties": {
            "key": {"type": "string"},
            "value": {"type": "string"},
            "confidence": {"type": "number"},
            "evidence": {"type": ["string", "null"]},
        },
        "required": ["key", "value", "confidence"],
        "additionalProperties": false,
    });
    json!({
        "type": "object",
        "properties": {
            "should_store": {"type": "boolean"},
            "confidence": {"type": "number"},
            "facts": {"type": "array", "items": fact_item.clone()},
            "preferences": {"type": "array", "items": pref_item},
            "title": {"type": "string"},
            "summary": {"type": "string"},
            "possible_facts": {"type": "array", "items": fact_item},
        },
        "required": ["should_store", "confidence", "facts", "preferences", "title", "summary"],
        "additionalProperties": false,
    })
}

fn clean_text(
    value: Option<&Value>,
    field: &str,
    required: bool,
) -> Result<String, MemoryInterpretationError> {
    match value {
        None | Some(Value::Null) => {
            if required {
                Err(MemoryInterpretationError::new(
                    "memory_interpreter_invalid_field",
                    format!("{field} is required"),
                ))
            } else {
                Ok(String::new())
            }
        }
        Some(Value::String(s)) => {
            let cleaned = s.split_whitespace().collect::<Vec<_>>().join(" ");
            if required && cleaned.is_empty() {
                return Err(MemoryInterpretationError::new(
                    "memory_interpreter_invalid_field",
                    format!("{field} is empty"),
                ));
            }
            Ok(cleaned)
        }
        Some(_) => Err(MemoryInterpretationError::new(
            "memory_interpreter_invalid_field",
            format!("{field} must be string"),
        )),
    }
}

fn clean_confidence(value: Option<&Value>, field: &str) -> Result<f64, MemoryInterpretationError> {
    let num = value.and_then(|v| v.as_f64()).ok_or_else(|| {
        MemoryInterpretationError::new(
            "memory_interpreter_invalid_confidence",
            format!("{field} must be number"),
        )
    })?;
    if !(0.0..=1.0).contains(&num) {
        return Err(MemoryInterpretationError::new(
            "memory_interpreter_invalid_confidence",
            format!("{field} must be in [0, 1]"),
        ));
    }
    Ok(num)
}

fn parse_fact_item(
    item: &Value,
    user_text: &str,
    field: &str,
) -> Result<Value, MemoryInterpretationError> {
    if !item.is_object() {
        return Err(MemoryInterpretationError::new(
            "memory_interpreter_invalid_fact",
            format!("{field} entries must be objects"),
        ));
    }
    let key = clean_text(item.get("key"), &format!("{field}.key"), true)?;
    let value = clean_text(item.get("value"), &format!("{field}.value"), true)?;
    let confidence = clean_confidence(item.get("confidence"), &format!("{field}.confidence"))?;
    let evidence = clean_text(item.get("evidence"), &format!("{field}.evidence"), true)?;
    if !user_text.contains(&evidence) {
        return Err(MemoryInterpretationError::new(
            "memory_interpreter_invalid_evidence",
            format!("{field}.evidence must be substring of user message"),
        ));
    }
    Ok(json!({"key": key, "value": value, "confidence": confidence, "evidence": evidence}))
}

fn parse_pref_item(item: &Value, user_text: &str) -> Result<Value, MemoryInterpretationError> {
    if !item.is_object() {
        return Err(MemoryInterpretationError::new(
            "memory_interpreter_invalid_preference",
            "preferences entries must be objects",
        ));
    }
    let key = clean_text(item.get("key"), "preferences.key", true)?;
    let value = clean_text(item.get("value"), "preferences.value", true)?;
    let confidence = clean_confidence(item.get("confidence"), "preferences.confidence")?;
    let mut result = Map::new();
    result.insert("key".to_string(), json!(key));
    result.insert("value".to_string(), json!(value));
    result.insert("confidence".to_string(), json!(confidence));
    if let Some(raw) = item.get("evidence").filter(|v| !v.is_null()) {
        let evidence = clean_text(Some(raw), "preferences.evidence", true)?;
        if !user_text.contains(&evidence) {
            return Err(MemoryInterpretationError::new(
                "memory_interpreter_invalid_evidence",
                "preferences.evidence must be substring of user message",
            ));
        }
        result.insert("evidence".to_string(), json!(evidence));
    }
    Ok(Value::Object(result))
}

fn safe_history(history: &[ChatTurn]) -> Vec<Value> {
    history
        .iter()
        .rev()
        .take(10)
        .rev()
        .filter(|turn| matches!(turn.role.as_str(), "user" | "assistant"))
        .filter(|turn| !turn.content.trim().is_empty())
        .map(|turn| json!({"role": turn.role.clone(), "content": turn.content.trim()}))
        .collect()
}

pub fn parse_response(text: &str, user_text: &str) -> Result<Value, MemoryInterpretationError> {
    let raw_text = text.trim();
    if raw_text.is_empty() {
        return Err(MemoryInterpretationError::bare("memory_interpreter_empty_response"));
    }
    let payload: Value = serde_json::from_str(raw_text).map_err(|e| {
        MemoryInterpretationError::new("memory_interpreter_invalid_json", e.to_string())
    })?;
    if !payload.is_object() {
        return Err(MemoryInterpretationError::new(
            "memory_interpreter_invalid_payload",
            "response must be JSON object",
        ));
    }

    let mut should_store = payload
        .get("should_store")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| {
            MemoryInterpretationError::new(
                "memory_interpreter_invalid_should_store",
                "should_store must be boolean",
            )
        })?;
    let confidence = clean_confidence(payload.get("confidence"), "confidence")?;

    let facts_raw = payload.get("facts").and_then(|v| v.as_array()).ok_or_else(|| {
        MemoryInterpretationError::new("memory_interpreter_invalid_facts", "facts must be array")
    })?;
    let facts = facts_raw
        .iter()
        .map(|item| parse_fact_item(item, user_text, "facts"))
        .collect::<Result<Vec<_>, _>>()?;

    let prefs_raw = payload
        .get("preferences")
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            MemoryInterpretationError::new(
                "memory_interpreter_invalid_preferences",
                "preferences must be array",
            )
        })?;
    let preferences = prefs_raw
        .iter()
        .map(|item| parse_pref_item(item, user_text))
        .collect::<Result<Vec<_>, _>>()?;

    let title = clean_text(payload.get("title"), "title", true)?;
    let summary = clean_text(payload.get("summary"), "summary", true)?;

    let possible_facts = match payload.get("possible_facts") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| parse_fact_item(item, user_text, "possible_facts"))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(MemoryInterpretationError::new(
                "memory_interpreter_invalid_possible_facts",
                "possible_facts must be array",
            ))
        }
    };

    // Low-confidence interpretations never store on their own.
    if should_store && confidence < MIN_STORE_CONFIDENCE {
        should_store = false;
    }

    Ok(json!({
        "should_store": should_store,
        "confidence": confidence,
        "facts": facts,
        "preferences": preferences,
        "title": title,
        "summary": summary,
        "possible_facts": possible_facts,
    }))
}

fn empty_interpretation() -> Value {
    json!({
        "should_store": false,
        "confidence": 0.0,
        "facts": [],
        "preferences": [],
        "title": "Профиль пользователя",
        "summary": "",
        "possible_facts": [],
    })
}

pub async fn interpret_user_message_for_memory(
    user_text: &str,
    history: &[ChatTurn],
    known_profile: &Value,
    brain: &BrainRouter,
    run_id: Option<&str>,
    settings: &Value,
) -> Result<Value, MemoryInterpretationError> {
    let text = user_text.trim();
    if text.is_empty() {
        return Ok(empty_interpretation());
    }

    let body = json!({
        "user_text": text,
        "history": safe_history(history),
        "known_profile": if known_profile.is_object() { known_profile.clone() } else { json!({}) },
    });

    let ctx = CallContext {
        run_id: run_id.map(|s| s.to_string()),
        settings: strict_local_settings(settings),
        ..Default::default()
    };

    let mut request = LlmRequest::new("memory_interpreter");
    request.task_kind = Some("memory_interpretation".to_string());
    request.run_id = run_id.map(|s| s.to_string());
    request.messages = vec![
        ChatMessage::system(PROMPT.trim()),
        ChatMessage::user(body.to_string()),
    ];
    request.context_items = vec![ContextItem::text(
        text,
        SourceType::UserPrompt,
        Sensitivity::Personal,
    )];
    request.temperature = 0.1;
    request.max_tokens = Some(700);
    request.json_schema = Some(schema());

    let response = brain.call(&request, &ctx).await.map_err(|e| {
        MemoryInterpretationError::new("memory_interpreter_llm_call_failed", e.to_string())
    })?;
    if response.status != LlmStatus::Ok {
        let detail = response
            .error_type
            .unwrap_or_else(|| response.status.as_str().to_string());
        return Err(MemoryInterpretationError::new("memory_interpreter_llm_failed", detail));
    }

    parse_response(&response.text, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(confidence: f64) -> String {
        json!({
            "should_store": true,
            "confidence": confidence,
            "facts": [
                {"key": "user.name", "value": "Михаил", "confidence": 0.95, "evidence": "меня зовут Михаил"}
            ],
            "preferences": [],
            "title": "Профиль пользователя",
            "summary": "Пользователь представился как Михаил.",
            "possible_facts": [],
        })
        .to_string()
    }

    #[test]
    fn low_confidence_demotes_should_store() {
        let parsed = parse_response(&payload(0.5), "меня зовут Михаил").unwrap();
        assert_eq!(parsed["should_store"], json!(false));

        let parsed = parse_response(&payload(0.9), "меня зовут Михаил").unwrap();
        assert_eq!(parsed["should_store"], json!(true));
    }

    #[test]
    fn fact_evidence_must_be_substring() {
        let err = parse_response(&payload(0.9), "другое сообщение").unwrap_err();
        assert_eq!(err.code, "memory_interpreter_invalid_evidence");
    }

    #[test]
    fn invalid_shapes_are_typed() {
        assert_eq!(
            parse_response("", "x").unwrap_err().code,
            "memory_interpreter_empty_response"
        );
        assert_eq!(
            parse_response("мусор", "x").unwrap_err().code,
            "memory_interpreter_invalid_json"
        );
        let missing = json!({"should_store": "да"}).to_string();
        assert_eq!(
            parse_response(&missing, "x").unwrap_err().code,
            "memory_interpreter_invalid_should_store"
        );
    }
}
