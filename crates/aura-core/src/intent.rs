use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use aura_brain::BrainRouter;

use crate::phrases;
use crate::semantic::{
    decide_semantic, SemanticDecision, SemanticDecisionError, INTENT_ACT, INTENT_ASK, INTENT_CHAT,
};

pub const TARGET_COMPUTER: &str = "COMPUTER";
pub const TARGET_TEXT_ONLY: &str = "TEXT_ONLY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Chat,
    Act,
    AskClarify,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Chat => INTENT_CHAT,
            Intent::Act => INTENT_ACT,
            Intent::AskClarify => INTENT_ASK,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            INTENT_CHAT => Some(Intent::Chat),
            INTENT_ACT => Some(Intent::Act),
            INTENT_ASK => Some(Intent::AskClarify),
            _ => None,
        }
    }
}

/// Keyword families that mark an action as dangerous enough to suggest
/// the confirm-gated run mode.
const DANGER_PATTERNS: &[(&str, &[&str])] = &[
    (
        "send_message",
        &["отправ", "сообщени", "email", "почт", "sms", "whatsapp", "telegram", "discord", "message"],
    ),
    (
        "delete_file",
        &["удали", "удалить", "delete", "rm ", "стер", "очисти", "trash", "корзин"],
    ),
    (
        "payment",
        &["оплат", "платеж", "перевод", "куп", "заказ", "payment", "card", "банк"],
    ),
    (
        "publish",
        &["опублику", "выложи", "publish", "deploy", "release", "tweet", "post", "push"],
    ),
    (
        "account_settings",
        &["аккаунт", "profile", "настройк", "settings", "security", "логин"],
    ),
    (
        "password",
        &["парол", "password", "passphrase", "2fa", "код подтверждения"],
    ),
];

const COMPUTER_PLAN_KINDS: &[&str] = &[
    "BROWSER_RESEARCH_UI",
    "COMPUTER_ACTIONS",
    "DOCUMENT_WRITE",
    "FILE_ORGANIZE",
    "CODE_ASSIST",
    "SMOKE_RUN",
];

#[derive(Debug, Clone, Serialize)]
pub struct ActHint {
    pub target: String,
    pub danger_flags: Vec<String>,
    pub suggested_run_mode: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentDecision {
    pub intent: Intent,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub questions: Vec<String>,
    pub needs_clarification: bool,
    pub act_hint: Option<ActHint>,
    pub plan_hint: Vec<String>,
    pub memory_item: Option<Value>,
    pub response_style_hint: Option<String>,
    pub user_visible_note: Option<String>,
    pub decision_path: String,
}

impl Serialize for Intent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl IntentDecision {
    /// The degradation decision when the classifier is unavailable: plain
    /// CHAT so the user still gets an answer instead of an API error.
    pub fn semantic_resilience(error_code: &str) -> Self {
        Self {
            intent: Intent::Chat,
            confidence: 0.0,
            reasons: vec!["semantic_resilience".to_string(), error_code.to_string()],
            questions: Vec::new(),
            needs_clarification: false,
            act_hint: None,
            plan_hint: vec!["CHAT_RESPONSE".to_string()],
            memory_item: None,
            response_style_hint: None,
            user_visible_note: Some(phrases::SEMANTIC_RESILIENCE_NOTE.to_string()),
            decision_path: "semantic_resilience".to_string(),
        }
    }
}

pub struct IntentRouter {
    brain: Arc<BrainRouter>,
    qa_mode: bool,
}

impl IntentRouter {
    pub fn new(brain: Arc<BrainRouter>, qa_mode: bool) -> Self {
        Self { brain, qa_mode }
    }

    pub async fn decide(
        &self,
        text: &str,
        run_id: Option<&str>,
        settings: &Value,
    ) -> Result<IntentDecision, SemanticDecisionError> {
        let raw_text = text.trim();
        if raw_text.is_empty() {
            return Ok(IntentDecision {
                intent: Intent::AskClarify,
                confidence: 1.0,
                reasons: vec!["empty_input".to_string()],
                questions: vec![phrases::ASK_CLARIFY_DEFAULT.to_string()],
                needs_clarification: true,
                act_hint: None,
                plan_hint: Vec::new(),
                memory_item: None,
                response_style_hint: None,
                user_visible_note: None,
                decision_path: "semantic".to_string(),
            });
        }

        if self.qa_mode {
            return Ok(IntentDecision {
                intent: Intent::Act,
                confidence: 1.0,
                reasons: vec!["qa_mode".to_string()],
                questions: Vec::new(),
                needs_clarification: false,
                act_hint: Some(ActHint {
                    target: TARGET_COMPUTER.to_string(),
                    danger_flags: Vec::new(),
                    suggested_run_mode: "autopilot_safe".to_string(),
                }),
                plan_hint: vec!["COMPUTER_ACTIONS".to_string()],
                memory_item: None,
                response_style_hint: None,
                user_visible_note: None,
                decision_path: "qa_mode".to_string(),
            });
        }

        let semantic = decide_semantic(raw_text, &self.brain, run_id, settings).await?;
        Ok(self.from_semantic(raw_text, semantic))
    }

    fn from_semantic(&self, raw_text: &str, semantic: SemanticDecision) -> IntentDecision {
        let intent = Intent::parse(&semantic.intent).unwrap_or(Intent::Chat);

        let mut questions = Vec::new();
        let mut needs_clarification = false;
        if intent == Intent::AskClarify {
            needs_clarification = true;
            questions = vec![semantic
                .user_visible_note
                .clone()
                .unwrap_or_else(|| phrases::ASK_CLARIFY_ACTION.to_string())];
        }

        let act_hint = if intent == Intent::Act {
            let danger_flags = detect_danger_flags(raw_text);
            let target = if semantic
                .plan_hint
                .iter()
                .any(|hint| COMPUTER_PLAN_KINDS.contains(&hint.as_str()))
            {
                TARGET_COMPUTER
            } else {
                TARGET_TEXT_ONLY
            };
            let suggested_run_mode = if target == TARGET_TEXT_ONLY || !danger_flags.is_empty() {
                "execute_confirm"
            } else {
                "autopilot_safe"
            };
            Some(ActHint {
                target: target.to_string(),
                danger_flags,
                suggested_run_mode: suggested_run_mode.to_string(),
            })
        } else {
            None
        };

        let memory_item = semantic.memory_item.as_ref().map(|item| {
            serde_json::json!({
                "kind": item.kind.clone(),
                "text": item.text.clone(),
                "evidence": item.evidence.clone(),
            })
        });

        let mut reasons = vec!["semantic_decision".to_string()];
        if !semantic.plan_hint.is_empty() {
            reasons.push("plan_hint".to_string());
        }
        if memory_item.is_some() {
            reasons.push("memory_item".to_string());
        }

        IntentDecision {
            intent,
            confidence: semantic.confidence,
            reasons,
            questions,
            needs_clarification,
            act_hint,
            plan_hint: semantic.plan_hint,
            memory_item,
            response_style_hint: semantic.response_style_hint,
            user_visible_note: semantic.user_visible_note,
            decision_path: "semantic".to_string(),
        }
    }
}

pub fn detect_danger_flags(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut flags: Vec<String> = DANGER_PATTERNS
        .iter()
        .filter(|(_, patterns)| patterns.iter().any(|token| lowered.contains(token)))
        .map(|(flag, _)| flag.to_string())
        .collect();
    flags.sort();
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn danger_flags_are_detected_and_sorted() {
        let flags = detect_danger_flags("Удали файл и отправь сообщение");
        assert_eq!(flags, vec!["delete_file", "send_message"]);
        assert!(detect_danger_flags("расскажи анекдот").is_empty());
    }

    #[test]
    fn resilience_decision_is_chat_with_note() {
        let decision = IntentDecision::semantic_resilience("semantic_decision_llm_failed");
        assert_eq!(decision.intent, Intent::Chat);
        assert_eq!(decision.plan_hint, vec!["CHAT_RESPONSE"]);
        assert_eq!(decision.decision_path, "semantic_resilience");
        assert_eq!(
            decision.user_visible_note.as_deref(),
            Some("Семантическая классификация недоступна, отвечаю напрямую.")
        );
        assert!(decision
            .reasons
            .contains(&"semantic_decision_llm_failed".to_string()));
    }
}
