//! Fixed user-visible phrasebook. The Russian wording is part of the API
//! contract and must not drift.

use once_cell::sync::Lazy;
use regex::Regex;

pub const ASK_CLARIFY_DEFAULT: &str = "Уточни, пожалуйста, запрос.";
pub const ASK_CLARIFY_ACTION: &str = "Уточни, пожалуйста, что именно нужно сделать.";
pub const SEMANTIC_RESILIENCE_NOTE: &str =
    "Семантическая классификация недоступна, отвечаю напрямую.";

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

const RUDE_WORDS: &[&str] = &["дурак", "идиот", "дебил", "кретин", "туп", "кринж"];

pub fn contains_rude_words(text: &str) -> bool {
    let normalized = WHITESPACE.replace_all(&text.to_lowercase(), " ").into_owned();
    RUDE_WORDS.iter().any(|word| normalized.contains(word))
}

/// Prefixes a reply with the user's name unless it already leads with it.
pub fn with_name(text: &str, name: Option<&str>) -> String {
    let Some(name) = name.filter(|n| !n.is_empty()) else {
        return text.to_string();
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return text.to_string();
    }
    if trimmed.to_lowercase().starts_with(&name.to_lowercase()) {
        return text.to_string();
    }
    let mut chars = trimmed.chars();
    let lowered = match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => trimmed.to_string(),
    };
    format!("{name}, {lowered}")
}

/// Stable degradation text for a failed chat model call, keyed on the
/// provider error type.
pub fn chat_resilience_text(error_type: Option<&str>) -> String {
    match error_type {
        Some("budget_exceeded") => {
            "Лимит обращений к модели исчерпан для этого запуска. Попробуй ещё раз чуть позже."
                .to_string()
        }
        Some("missing_api_key") => {
            "Облачная модель недоступна: не задан OPENAI_API_KEY.".to_string()
        }
        Some(error)
            if error.contains("llm_call_failed")
                || matches!(
                    error,
                    "model_not_found" | "http_error" | "connection_error" | "invalid_json"
                ) =>
        {
            "Локальная модель сейчас недоступна. Проверь Ollama и выбранную модель, затем повтори запрос."
                .to_string()
        }
        _ => "Не удалось получить ответ модели. Повтори запрос.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resilience_phrasebook_is_stable() {
        assert!(chat_resilience_text(Some("budget_exceeded")).contains("Лимит"));
        assert!(chat_resilience_text(Some("missing_api_key")).contains("OPENAI_API_KEY"));
        assert!(chat_resilience_text(Some("connection_error")).contains("Ollama"));
        assert!(chat_resilience_text(Some("semantic_decision_llm_call_failed")).contains("Ollama"));
        assert!(chat_resilience_text(None).contains("Повтори запрос"));
    }

    #[test]
    fn with_name_avoids_double_address() {
        assert_eq!(with_name("Привет!", Some("Михаил")), "Михаил, привет!");
        assert_eq!(with_name("Михаил, привет!", Some("Михаил")), "Михаил, привет!");
        assert_eq!(with_name("Привет!", None), "Привет!");
    }
}
