//! Builds the profile-aware system prompt and message list for chat
//! responses out of stored user memories and reconstructed history.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use aura_brain::ChatMessage;
use aura_store::ChatTurn;
use aura_types::UserMemory;

static NAME_IN_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)имя пользователя:\s*([A-Za-zА-Яа-яЁё-]{2,})").expect("name regex")
});

#[derive(Debug, Clone, Default)]
pub struct UserProfileContext {
    pub profile_block: Option<String>,
    pub user_name: Option<String>,
    pub style_hints: Vec<String>,
}

fn summary_or_content(memory: &UserMemory) -> String {
    if let Some(summary) = memory.meta.get("summary").and_then(|v| v.as_str()) {
        if !summary.trim().is_empty() {
            return summary.trim().to_string();
        }
    }
    if !memory.content.trim().is_empty() {
        return memory.content.trim().to_string();
    }
    memory.title.trim().to_string()
}

fn extract_name_from_memories(memories: &[UserMemory]) -> Option<String> {
    for memory in memories {
        if let Some(facts) = memory.meta.get("facts").and_then(|v| v.as_array()) {
            for fact in facts {
                if fact.get("key").and_then(|v| v.as_str()) == Some("user.name") {
                    if let Some(value) = fact.get("value").and_then(|v| v.as_str()) {
                        let value = value.trim();
                        if !value.is_empty() {
                            return Some(value.to_string());
                        }
                    }
                }
            }
        }
        let text = summary_or_content(memory);
        if let Some(captures) = NAME_IN_TEXT.captures(&text) {
            let value = captures.get(1).map(|m| m.as_str().trim().to_string());
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                return Some(value);
            }
        }
    }
    None
}

fn style_hint_for(key: &str, value: &str) -> Option<String> {
    match key {
        "style.brevity" if matches!(value.to_lowercase().as_str(), "short" | "brief" | "compact") => {
            Some("Отвечай коротко и по делу.".to_string())
        }
        "style.tone" => Some(format!("Тон ответа: {value}.")),
        "user.addressing.preference" => Some(format!("Формат обращения к пользователю: {value}.")),
        "response.format" => Some(format!("Формат ответа: {value}.")),
        _ => None,
    }
}

fn style_hints_from_memories(memories: &[UserMemory], limit: usize) -> Vec<String> {
    let mut hints = Vec::new();
    for memory in memories {
        let Some(preferences) = memory.meta.get("preferences").and_then(|v| v.as_array()) else {
            continue;
        };
        for pref in preferences {
            let key = pref.get("key").and_then(|v| v.as_str()).unwrap_or("");
            let value = pref.get("value").and_then(|v| v.as_str()).unwrap_or("").trim();
            if value.is_empty() {
                continue;
            }
            if let Some(hint) = style_hint_for(&key.trim().to_lowercase(), value) {
                if !hints.contains(&hint) {
                    hints.push(hint);
                    if hints.len() >= limit {
                        return hints;
                    }
                }
            }
        }
    }
    hints
}

/// Extracts the same style hints out of a fresh memory interpretation.
pub fn style_hint_from_interpretation(interpretation: Option<&Value>) -> Option<String> {
    let preferences = interpretation?.get("preferences")?.as_array()?;
    let mut hints: Vec<String> = Vec::new();
    for pref in preferences {
        let key = pref.get("key").and_then(|v| v.as_str()).unwrap_or("");
        let value = pref.get("value").and_then(|v| v.as_str()).unwrap_or("").trim();
        if value.is_empty() {
            continue;
        }
        if let Some(hint) = style_hint_for(&key.trim().to_lowercase(), value) {
            if !hints.contains(&hint) {
                hints.push(hint);
            }
        }
    }
    if hints.is_empty() {
        None
    } else {
        Some(hints.into_iter().take(3).collect::<Vec<_>>().join(" "))
    }
}

pub fn name_from_interpretation(interpretation: Option<&Value>) -> Option<String> {
    let facts = interpretation?.get("facts")?.as_array()?;
    facts
        .iter()
        .find(|fact| fact.get("key").and_then(|v| v.as_str()) == Some("user.name"))
        .and_then(|fact| fact.get("value").and_then(|v| v.as_str()))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

pub fn build_profile_block(
    memories: &[UserMemory],
    max_items: usize,
    max_chars: usize,
) -> Option<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut total = 0usize;
    for memory in memories.iter().take(max_items) {
        let content = summary_or_content(memory);
        if content.is_empty() {
            continue;
        }
        let mut content = content.split_whitespace().collect::<Vec<_>>().join(" ");
        if content.chars().count() > 220 {
            content = content.chars().take(217).collect::<String>() + "...";
        }
        let line = format!("- {content}");
        if total + line.chars().count() + 1 > max_chars {
            break;
        }
        total += line.chars().count() + 1;
        lines.push(line);
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

pub fn build_user_profile_context(memories: &[UserMemory]) -> UserProfileContext {
    UserProfileContext {
        profile_block: build_profile_block(memories, 12, 1200),
        user_name: extract_name_from_memories(memories),
        style_hints: style_hints_from_memories(memories, 4),
    }
}

pub fn build_memory_dump_response(memories: &[UserMemory]) -> String {
    match build_profile_block(memories, 20, 1500) {
        Some(block) => format!("Вот что я помню о тебе:\n{block}"),
        None => "Пока ничего не помню о тебе. Можешь рассказать, как тебя называть или как тебе удобнее отвечать."
            .to_string(),
    }
}

pub fn build_chat_system_prompt(
    memories: &[UserMemory],
    response_style_hint: Option<&str>,
) -> String {
    let profile = build_user_profile_context(memories);

    let mut base = String::from(
        "Ты ассистент Aura. \
         Всегда отвечай на русском, спокойно и уважительно. \
         Избегай канцелярита и длинных формальных оборотов. \
         Если пользователь спрашивает, как его зовут или что ты помнишь о нём, \
         отвечай строго по блоку профиля ниже. \
         Если профиль пуст, честно скажи, что пока не знаешь.",
    );
    if let Some(name) = &profile.user_name {
        base = format!("{base} Имя пользователя: {name}. Можно обращаться по имени, но не в каждом предложении.");
    }
    if let Some(hint) = response_style_hint.filter(|h| !h.is_empty()) {
        base = format!("{base} Текущая стилевая подсказка: {hint}");
    }
    if !profile.style_hints.is_empty() {
        let hints = profile.style_hints.iter().take(3).cloned().collect::<Vec<_>>();
        base = format!("{base} Стиль из профиля: {}", hints.join(" "));
    }
    match profile.profile_block {
        Some(block) => format!("{base}\n\nПрофиль пользователя:\n{block}"),
        None => format!("{base}\n\nПрофиль пользователя: пусто."),
    }
}

pub fn build_chat_messages(
    system_text: &str,
    history: &[ChatTurn],
    user_text: &str,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_text)];
    for turn in history {
        if matches!(turn.role.as_str(), "user" | "assistant") && !turn.content.is_empty() {
            messages.push(ChatMessage::new(&turn.role, turn.content.clone()));
        }
    }
    messages.push(ChatMessage::user(user_text));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use aura_types::now_iso;
    use serde_json::json;

    fn memory(content: &str, meta: Value) -> UserMemory {
        UserMemory {
            id: "m1".to_string(),
            created_at: now_iso(),
            updated_at: now_iso(),
            title: "Профиль пользователя".to_string(),
            content: content.to_string(),
            tags: vec![],
            source: "auto".to_string(),
            is_deleted: false,
            pinned: false,
            last_used_at: None,
            meta,
        }
    }

    #[test]
    fn name_is_found_in_meta_facts() {
        let memories = vec![memory(
            "Пользователь представился как Михаил.",
            json!({"facts": [{"key": "user.name", "value": "Михаил"}]}),
        )];
        let profile = build_user_profile_context(&memories);
        assert_eq!(profile.user_name.as_deref(), Some("Михаил"));
    }

    #[test]
    fn name_falls_back_to_text_pattern() {
        let memories = vec![memory("Имя пользователя: Анна.", json!({}))];
        let profile = build_user_profile_context(&memories);
        assert_eq!(profile.user_name.as_deref(), Some("Анна"));
    }

    #[test]
    fn style_hints_are_deduped_and_capped() {
        let meta = json!({"preferences": [
            {"key": "style.brevity", "value": "short"},
            {"key": "style.brevity", "value": "short"},
            {"key": "style.tone", "value": "дружелюбный"},
        ]});
        let memories = vec![memory("x", meta)];
        let profile = build_user_profile_context(&memories);
        assert_eq!(
            profile.style_hints,
            vec!["Отвечай коротко и по делу.", "Тон ответа: дружелюбный."]
        );
    }

    #[test]
    fn system_prompt_includes_profile_block() {
        let memories = vec![memory("Пользователь любит чай.", json!({}))];
        let prompt = build_chat_system_prompt(&memories, Some("Отвечай кратко."));
        assert!(prompt.contains("Профиль пользователя:\n- Пользователь любит чай."));
        assert!(prompt.contains("Текущая стилевая подсказка: Отвечай кратко."));
    }

    #[test]
    fn chat_messages_wrap_history() {
        let history = vec![
            ChatTurn {
                role: "user".to_string(),
                content: "привет".to_string(),
                ts: None,
                run_id: None,
            },
            ChatTurn {
                role: "assistant".to_string(),
                content: "здравствуй".to_string(),
                ts: None,
                run_id: None,
            },
        ];
        let messages = build_chat_messages("система", &history, "как дела?");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[3].content, "как дела?");
    }
}
