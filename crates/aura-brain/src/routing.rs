use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FINANCIAL_APPROVAL_SCOPE: &str = "cloud_financial_file";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    UserPrompt,
    WebPageText,
    TelegramText,
    FileContent,
    AppUiText,
    ScreenshotText,
    SystemNote,
    InternalSummary,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::UserPrompt => "user_prompt",
            SourceType::WebPageText => "web_page_text",
            SourceType::TelegramText => "telegram_text",
            SourceType::FileContent => "file_content",
            SourceType::AppUiText => "app_ui_text",
            SourceType::ScreenshotText => "screenshot_text",
            SourceType::SystemNote => "system_note",
            SourceType::InternalSummary => "internal_summary",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Public,
    Personal,
    Financial,
    Confidential,
}

/// A typed unit of LLM input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub content: Value,
    pub source_type: SourceType,
    pub sensitivity: Sensitivity,
    #[serde(default)]
    pub provenance: Option<String>,
}

impl ContextItem {
    pub fn text(
        content: impl Into<String>,
        source_type: SourceType,
        sensitivity: Sensitivity,
    ) -> Self {
        Self {
            content: Value::String(content.into()),
            source_type,
            sensitivity,
            provenance: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Route {
    #[serde(rename = "LOCAL")]
    Local,
    #[serde(rename = "CLOUD")]
    Cloud,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Local => "LOCAL",
            Route::Cloud => "CLOUD",
        }
    }
}

/// Privacy policy derived from project settings and environment overrides.
#[derive(Debug, Clone)]
pub struct PolicyFlags {
    pub auto_cloud_enabled: bool,
    pub cloud_allowed: bool,
    pub strict_local: bool,
    pub max_cloud_chars: usize,
    pub max_cloud_item_chars: usize,
}

impl Default for PolicyFlags {
    fn default() -> Self {
        Self {
            auto_cloud_enabled: true,
            cloud_allowed: true,
            strict_local: false,
            max_cloud_chars: 8000,
            max_cloud_item_chars: 2000,
        }
    }
}

impl PolicyFlags {
    /// Reads the `privacy` (or legacy `routing`) block of project settings.
    pub fn from_settings(settings: &Value) -> Self {
        let cfg = settings
            .get("privacy")
            .or_else(|| settings.get("routing"))
            .cloned()
            .unwrap_or(Value::Null);
        let defaults = Self::default();
        Self {
            auto_cloud_enabled: cfg
                .get("auto_cloud_enabled")
                .and_then(|v| v.as_bool())
                .unwrap_or(defaults.auto_cloud_enabled),
            cloud_allowed: cfg
                .get("cloud_allowed")
                .and_then(|v| v.as_bool())
                .unwrap_or(defaults.cloud_allowed),
            strict_local: cfg
                .get("strict_local")
                .and_then(|v| v.as_bool())
                .unwrap_or(defaults.strict_local),
            max_cloud_chars: cfg
                .get("max_cloud_chars")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize)
                .unwrap_or(defaults.max_cloud_chars),
            max_cloud_item_chars: cfg
                .get("max_cloud_item_chars")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize)
                .unwrap_or(defaults.max_cloud_item_chars),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub route: Route,
    pub reason: String,
    pub required_approval: Option<String>,
    pub redaction_plan: Value,
}

impl RoutingDecision {
    fn local(reason: &str) -> Self {
        Self {
            route: Route::Local,
            reason: reason.to_string(),
            required_approval: None,
            redaction_plan: serde_json::json!({}),
        }
    }

    fn cloud(reason: &str) -> Self {
        Self {
            route: Route::Cloud,
            reason: reason.to_string(),
            required_approval: None,
            redaction_plan: serde_json::json!({}),
        }
    }
}

static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"(?i)(api[_-]?key|token|secret|password|passphrase)\s*[:=]\s*([^\s"']+)"#)
            .expect("secret pattern"),
        Regex::new(r"(?i)bearer\s+[A-Za-z0-9\-\._~\+/]+=*").expect("bearer pattern"),
        Regex::new(r"sk-[A-Za-z0-9]{10,}").expect("sk pattern"),
    ]
});

/// Replaces anything that looks like a credential with `[REDACTED]`,
/// returning the cleaned text and the number of replacements.
pub fn redact_secrets(text: &str) -> (String, usize) {
    let mut value = text.to_string();
    let mut total = 0;
    for pattern in SECRET_PATTERNS.iter() {
        total += pattern.find_iter(&value).count();
        value = pattern.replace_all(&value, "[REDACTED]").into_owned();
    }
    (value, total)
}

pub fn estimate_length(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Object(map) => map.values().map(estimate_length).sum(),
        Value::Array(items) => items.iter().map(estimate_length).sum(),
        other => other.to_string().chars().count(),
    }
}

fn truncate_string(value: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    value.chars().take(max_chars).collect()
}

fn truncate_content(value: &Value, max_chars: usize) -> Value {
    if max_chars == 0 {
        return Value::String(String::new());
    }
    match value {
        Value::String(s) => Value::String(truncate_string(s, max_chars)),
        Value::Object(map) => {
            if let Some(Value::String(snippet)) = map.get("snippet") {
                let mut truncated = map.clone();
                truncated.insert(
                    "snippet".to_string(),
                    Value::String(truncate_string(snippet, max_chars)),
                );
                Value::Object(truncated)
            } else {
                value.clone()
            }
        }
        Value::Array(items) if items.iter().all(|i| i.is_string()) => {
            let joined = items
                .iter()
                .filter_map(|i| i.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let truncated = truncate_string(&joined, max_chars);
            if truncated.is_empty() {
                Value::Array(vec![])
            } else {
                Value::Array(
                    truncated
                        .split('\n')
                        .map(|s| Value::String(s.to_string()))
                        .collect(),
                )
            }
        }
        other => other.clone(),
    }
}

/// Redacts and truncates a single content value. Returns the sanitized
/// value, the redaction count, and whether anything was truncated.
fn sanitize_value(value: &Value, max_chars: usize) -> (Value, usize, bool) {
    match value {
        Value::String(s) => {
            let (redacted, count) = redact_secrets(s);
            let truncated = redacted.chars().count() > max_chars;
            (
                Value::String(truncate_string(&redacted, max_chars)),
                count,
                truncated,
            )
        }
        Value::Object(map) => {
            let mut redacted_total = 0;
            let mut truncated_any = false;
            let mut sanitized = serde_json::Map::new();
            for (key, item) in map {
                if let Value::String(s) = item {
                    let (redacted, count) = redact_secrets(s);
                    redacted_total += count;
                    truncated_any = truncated_any || redacted.chars().count() > max_chars;
                    sanitized.insert(
                        key.clone(),
                        Value::String(truncate_string(&redacted, max_chars)),
                    );
                } else {
                    sanitized.insert(key.clone(), item.clone());
                }
            }
            (Value::Object(sanitized), redacted_total, truncated_any)
        }
        Value::Array(items) => {
            let mut redacted_total = 0;
            let mut truncated_any = false;
            let mut sanitized = Vec::new();
            for item in items {
                if let Value::String(s) = item {
                    let (redacted, count) = redact_secrets(s);
                    redacted_total += count;
                    truncated_any = truncated_any || redacted.chars().count() > max_chars;
                    sanitized.push(Value::String(truncate_string(&redacted, max_chars)));
                } else {
                    sanitized.push(item.clone());
                }
            }
            (Value::Array(sanitized), redacted_total, truncated_any)
        }
        other => (other.clone(), 0, false),
    }
}

#[derive(Debug, Clone)]
pub struct SanitizationResult {
    pub items: Vec<ContextItem>,
    pub removed_counts_by_source: BTreeMap<String, usize>,
    pub redacted_count: usize,
    pub total_chars: usize,
    pub truncated: bool,
}

/// Prepares context items for the cloud: drops telegram/screenshot items,
/// drops unapproved financial files, redacts secrets, truncates per item
/// and stops once the total budget is spent.
pub fn sanitize_context_items(
    items: &[ContextItem],
    allow_financial_file: bool,
    flags: &PolicyFlags,
) -> SanitizationResult {
    let mut removed_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut sanitized_items = Vec::new();
    let mut redacted_total = 0;
    let mut total_chars = 0usize;
    let mut truncated_any = false;

    for item in items {
        let dropped = matches!(
            item.source_type,
            SourceType::TelegramText | SourceType::ScreenshotText
        ) || (item.source_type == SourceType::FileContent
            && item.sensitivity == Sensitivity::Financial
            && !allow_financial_file);
        if dropped {
            *removed_counts
                .entry(item.source_type.as_str().to_string())
                .or_insert(0) += 1;
            continue;
        }

        let (mut content, redacted, truncated) =
            sanitize_value(&item.content, flags.max_cloud_item_chars);
        redacted_total += redacted;
        truncated_any = truncated_any || truncated;

        let mut item_len = estimate_length(&content);
        if total_chars + item_len > flags.max_cloud_chars {
            let remaining = flags.max_cloud_chars.saturating_sub(total_chars);
            content = truncate_content(&content, remaining);
            item_len = estimate_length(&content);
            truncated_any = true;
        }

        if item_len == 0 {
            *removed_counts
                .entry(item.source_type.as_str().to_string())
                .or_insert(0) += 1;
            continue;
        }

        total_chars += item_len;
        sanitized_items.push(ContextItem {
            content,
            source_type: item.source_type,
            sensitivity: item.sensitivity,
            provenance: item.provenance.clone(),
        });

        if total_chars >= flags.max_cloud_chars {
            break;
        }
    }

    SanitizationResult {
        items: sanitized_items,
        removed_counts_by_source: removed_counts,
        redacted_count: redacted_total,
        total_chars,
        truncated: truncated_any,
    }
}

pub fn summarize_items_by_source(items: &[ContextItem]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for item in items {
        *counts
            .entry(item.source_type.as_str().to_string())
            .or_insert(0) += 1;
    }
    counts
}

pub fn items_length(items: &[ContextItem]) -> usize {
    items.iter().map(|item| estimate_length(&item.content)).sum()
}

/// Initial route decision, first match wins.
pub fn decide_route(
    items: &[ContextItem],
    flags: &PolicyFlags,
    approved_scopes: &HashSet<String>,
) -> RoutingDecision {
    if flags.strict_local {
        return RoutingDecision::local("strict_local");
    }

    if items
        .iter()
        .any(|i| i.source_type == SourceType::TelegramText)
    {
        let mut decision = RoutingDecision::local("telegram_text_present");
        decision.redaction_plan = serde_json::json!({"drop": ["telegram_text"]});
        return decision;
    }

    if items
        .iter()
        .any(|i| i.source_type == SourceType::ScreenshotText)
    {
        let mut decision = RoutingDecision::local("screenshot_text_present");
        decision.redaction_plan = serde_json::json!({"drop": ["screenshot_text"]});
        return decision;
    }

    let has_financial_file = items.iter().any(|i| {
        i.source_type == SourceType::FileContent && i.sensitivity == Sensitivity::Financial
    });
    if has_financial_file && !approved_scopes.contains(FINANCIAL_APPROVAL_SCOPE) {
        let mut decision = RoutingDecision::local("financial_file_requires_approval");
        decision.required_approval = Some(FINANCIAL_APPROVAL_SCOPE.to_string());
        decision.redaction_plan = serde_json::json!({"drop": ["file_content"]});
        return decision;
    }
    if has_financial_file && flags.auto_cloud_enabled && flags.cloud_allowed {
        return RoutingDecision::cloud("financial_file_approved");
    }

    if items
        .iter()
        .any(|i| i.source_type == SourceType::WebPageText)
        && flags.auto_cloud_enabled
        && flags.cloud_allowed
    {
        return RoutingDecision::cloud("web_page_text");
    }

    let has_heavy_public_text = items.iter().any(|i| {
        matches!(
            i.source_type,
            SourceType::UserPrompt | SourceType::SystemNote | SourceType::InternalSummary
        ) && i.sensitivity == Sensitivity::Public
            && estimate_length(&i.content) >= 1200
    });
    if has_heavy_public_text && flags.auto_cloud_enabled && flags.cloud_allowed {
        return RoutingDecision::cloud("heavy_public_text");
    }

    RoutingDecision::local("default_local")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(source_type: SourceType, sensitivity: Sensitivity, content: &str) -> ContextItem {
        ContextItem::text(content, source_type, sensitivity)
    }

    #[test]
    fn telegram_context_forces_local() {
        let items = vec![
            item(SourceType::TelegramText, Sensitivity::Personal, "привет"),
            item(SourceType::WebPageText, Sensitivity::Public, "страница"),
        ];
        let decision = decide_route(&items, &PolicyFlags::default(), &HashSet::new());
        assert_eq!(decision.route, Route::Local);
        assert_eq!(decision.reason, "telegram_text_present");
    }

    #[test]
    fn screenshot_context_forces_local() {
        let items = vec![item(
            SourceType::ScreenshotText,
            Sensitivity::Personal,
            "текст со скриншота",
        )];
        let decision = decide_route(&items, &PolicyFlags::default(), &HashSet::new());
        assert_eq!(decision.route, Route::Local);
        assert_eq!(decision.reason, "screenshot_text_present");
    }

    #[test]
    fn unapproved_financial_file_stays_local() {
        let items = vec![item(
            SourceType::FileContent,
            Sensitivity::Financial,
            "выписка по счёту",
        )];
        let decision = decide_route(&items, &PolicyFlags::default(), &HashSet::new());
        assert_eq!(decision.route, Route::Local);
        assert_eq!(
            decision.required_approval.as_deref(),
            Some(FINANCIAL_APPROVAL_SCOPE)
        );
    }

    #[test]
    fn approved_financial_file_goes_cloud() {
        let items = vec![item(
            SourceType::FileContent,
            Sensitivity::Financial,
            "выписка по счёту",
        )];
        let mut scopes = HashSet::new();
        scopes.insert(FINANCIAL_APPROVAL_SCOPE.to_string());
        let decision = decide_route(&items, &PolicyFlags::default(), &scopes);
        assert_eq!(decision.route, Route::Cloud);
        assert_eq!(decision.reason, "financial_file_approved");
    }

    #[test]
    fn heavy_public_text_goes_cloud() {
        let long = "а".repeat(1200);
        let items = vec![item(SourceType::UserPrompt, Sensitivity::Public, &long)];
        let decision = decide_route(&items, &PolicyFlags::default(), &HashSet::new());
        assert_eq!(decision.route, Route::Cloud);
        assert_eq!(decision.reason, "heavy_public_text");

        let short = "а".repeat(1199);
        let items = vec![item(SourceType::UserPrompt, Sensitivity::Public, &short)];
        let decision = decide_route(&items, &PolicyFlags::default(), &HashSet::new());
        assert_eq!(decision.route, Route::Local);
    }

    #[test]
    fn strict_local_wins_over_everything() {
        let flags = PolicyFlags {
            strict_local: true,
            ..PolicyFlags::default()
        };
        let items = vec![item(SourceType::WebPageText, Sensitivity::Public, "веб")];
        let decision = decide_route(&items, &flags, &HashSet::new());
        assert_eq!(decision.route, Route::Local);
        assert_eq!(decision.reason, "strict_local");
    }

    #[test]
    fn sanitize_removes_telegram_and_redacts() {
        let items = vec![
            item(SourceType::TelegramText, Sensitivity::Personal, "секрет"),
            item(
                SourceType::UserPrompt,
                Sensitivity::Personal,
                "мой api_key=abc123def и всё",
            ),
        ];
        let result = sanitize_context_items(&items, false, &PolicyFlags::default());
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.removed_counts_by_source.get("telegram_text"), Some(&1));
        assert_eq!(result.redacted_count, 1);
        let text = result.items[0].content.as_str().unwrap();
        assert!(text.contains("[REDACTED]"));
        assert!(!text.contains("abc123def"));
    }

    #[test]
    fn sanitize_budget_boundary_is_exact() {
        let flags = PolicyFlags {
            max_cloud_chars: 10,
            max_cloud_item_chars: 100,
            ..PolicyFlags::default()
        };
        // Exactly at the budget: nothing truncated.
        let items = vec![item(SourceType::UserPrompt, Sensitivity::Public, "аааааааааа")];
        let result = sanitize_context_items(&items, false, &flags);
        assert_eq!(result.total_chars, 10);
        assert!(!result.truncated);

        // One char over: truncated down to the budget.
        let items = vec![item(SourceType::UserPrompt, Sensitivity::Public, "ааааааааааб")];
        let result = sanitize_context_items(&items, false, &flags);
        assert_eq!(result.total_chars, 10);
        assert!(result.truncated);
    }

    #[test]
    fn sanitize_empty_result_counts_removals() {
        let items = vec![item(SourceType::TelegramText, Sensitivity::Personal, "x")];
        let result = sanitize_context_items(&items, false, &PolicyFlags::default());
        assert!(result.items.is_empty());
        assert_eq!(result.total_chars, 0);
    }

    #[test]
    fn bearer_and_sk_tokens_are_redacted() {
        let (text, count) =
            redact_secrets("Authorization: Bearer abc.DEF-123 and sk-0123456789abcdef");
        assert_eq!(count, 2);
        assert!(!text.contains("sk-0123456789abcdef"));
    }
}
