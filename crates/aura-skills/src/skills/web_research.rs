use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use aura_brain::{ContextItem, LlmRequest, Sensitivity, SourceType};
use aura_types::{now_iso, FactCandidate, SkillResult, SkillScope, SourceCandidate};

use crate::context::SkillContext;
use crate::registry::{Skill, SkillManifest};

const MODE_CANDIDATES: &str = "candidates";
const MODE_DEEP: &str = "deep";
const DEFAULT_MAX_PAGES_FETCH: usize = 6;
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const SNIPPET_CHARS: usize = 400;

const HIGH_TRUST_DOMAINS: &[&str] = &[
    ".gov",
    ".edu",
    "wikipedia.org",
    "wikidata.org",
    "docs.",
    "developer.",
];

static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title regex"));
static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script.*?</script>|<style.*?</style>|<[^>]+>").expect("tag regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

fn domain_of(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}

fn quality_for_domain(domain: &str) -> &'static str {
    if HIGH_TRUST_DOMAINS
        .iter()
        .any(|marker| domain.contains(marker))
    {
        "high"
    } else {
        "normal"
    }
}

fn extract_title(html: &str) -> Option<String> {
    TITLE_RE.captures(html).map(|captures| {
        WHITESPACE
            .replace_all(captures[1].trim(), " ")
            .into_owned()
    })
}

fn extract_snippet(html: &str) -> String {
    let text = TAG_RE.replace_all(html, " ");
    let text = WHITESPACE.replace_all(text.trim(), " ");
    text.chars().take(SNIPPET_CHARS).collect()
}

fn facts_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "key": {"type": "string"},
                        "value": {"type": "string"},
                        "confidence": {"type": "number"},
                        "source_id": {"type": ["string", "null"]},
                    },
                    "required": ["key", "value"],
                },
            }
        },
        "required": ["facts"],
    })
}

/// Deep web research over an explicit URL list: fetch pages, extract
/// titles and snippets, pull atomic facts through the brain and flag
/// conflicting values per fact key. The search provider itself is an
/// external collaborator; without URLs the skill degrades to an empty
/// candidate set with an explicit assumption.
pub struct WebResearchSkill {
    manifest: SkillManifest,
    http: reqwest::Client,
}

impl WebResearchSkill {
    pub fn new() -> Self {
        let schema = json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "mode": {"type": "string", "enum": ["candidates", "deep"]},
                "urls": {"type": "array", "items": {"type": "string"}},
                "max_pages": {"type": "integer"},
            },
        });
        Self {
            manifest: SkillManifest::new("web_research", SkillScope::Safe, schema)
                .with_capabilities(&["web_fetch", "fact_extraction"]),
            http: reqwest::Client::new(),
        }
    }

    async fn fetch_source(&self, url: &str) -> Option<SourceCandidate> {
        let response = self
            .http
            .get(url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let html = response.text().await.ok()?;
        let domain = domain_of(url);
        Some(SourceCandidate {
            url: url.to_string(),
            title: extract_title(&html),
            quality: domain.as_deref().map(quality_for_domain).map(|q| q.to_string()),
            domain,
            snippet: Some(extract_snippet(&html)),
            retrieved_at: Some(now_iso()),
            pinned: true,
        })
    }

    async fn extract_facts(
        &self,
        query: &str,
        sources: &[SourceCandidate],
        ctx: &SkillContext,
    ) -> anyhow::Result<Vec<FactCandidate>> {
        let snippets: Vec<Value> = sources
            .iter()
            .filter(|source| source.snippet.is_some())
            .map(|source| {
                json!({
                    "url": source.url.clone(),
                    "title": source.title.clone(),
                    "snippet": source.snippet.clone(),
                })
            })
            .collect();
        if snippets.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = LlmRequest::new("web_research_facts");
        request.task_kind = Some("report".to_string());
        request.run_id = Some(ctx.run.id.clone());
        request.task_id = Some(ctx.task.id.clone());
        request.step_id = Some(ctx.plan_step.id.clone());
        request.messages = vec![
            aura_brain::ChatMessage::system(
                "Извлеки атомарные факты из сниппетов. Верни JSON с ключом facts[]. \
                 Каждый факт: {key, value, confidence, source_id}. Ничего не выдумывай.",
            ),
            aura_brain::ChatMessage::user(
                json!({"query": query, "snippets": snippets}).to_string(),
            ),
        ];
        request.context_items = sources
            .iter()
            .filter_map(|source| {
                source.snippet.as_ref().map(|snippet| {
                    ContextItem::text(
                        snippet.clone(),
                        SourceType::WebPageText,
                        Sensitivity::Public,
                    )
                })
            })
            .collect();
        request.temperature = 0.2;
        request.max_tokens = Some(700);
        request.json_schema = Some(facts_schema());

        let response = match ctx.brain.call(&request, &ctx.brain_ctx()).await {
            Ok(response) if response.status == aura_brain::LlmStatus::Ok => response,
            _ => return Ok(Vec::new()),
        };
        let Ok(data) = serde_json::from_str::<Value>(response.text.trim()) else {
            return Ok(Vec::new());
        };
        let facts = data
            .get("facts")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(facts
            .iter()
            .filter_map(|fact| {
                let key = fact.get("key").and_then(|v| v.as_str())?.trim().to_string();
                let value = fact.get("value").cloned()?;
                if key.is_empty() {
                    return None;
                }
                Some(FactCandidate {
                    key,
                    value,
                    confidence: fact
                        .get("confidence")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.5),
                    source_ids: fact
                        .get("source_id")
                        .and_then(|v| v.as_str())
                        .map(|s| vec![s.to_string()])
                        .unwrap_or_default(),
                    created_at: None,
                })
            })
            .collect())
    }
}

impl Default for WebResearchSkill {
    fn default() -> Self {
        Self::new()
    }
}

/// One conflict event per fact key with more than one distinct value.
fn detect_conflicts(facts: &[FactCandidate]) -> Vec<Value> {
    let mut by_key: BTreeMap<&str, Vec<&FactCandidate>> = BTreeMap::new();
    for fact in facts {
        by_key.entry(fact.key.as_str()).or_default().push(fact);
    }
    by_key
        .into_iter()
        .filter(|(_, group)| {
            let mut values: Vec<String> = group.iter().map(|f| f.value.to_string()).collect();
            values.sort();
            values.dedup();
            values.len() > 1
        })
        .map(|(key, group)| {
            json!({
                "type": "conflict",
                "fact_key": key,
                "group": group
                    .iter()
                    .map(|f| json!({"value": f.value.clone(), "source_ids": f.source_ids.clone()}))
                    .collect::<Vec<_>>(),
            })
        })
        .collect()
}

#[async_trait]
impl Skill for WebResearchSkill {
    fn manifest(&self) -> &SkillManifest {
        &self.manifest
    }

    async fn execute(&self, inputs: &Value, ctx: &SkillContext) -> anyhow::Result<SkillResult> {
        let query = inputs
            .get("query")
            .and_then(|v| v.as_str())
            .filter(|q| !q.trim().is_empty())
            .unwrap_or(&ctx.run.query_text)
            .to_string();
        let mode = inputs
            .get("mode")
            .and_then(|v| v.as_str())
            .unwrap_or(MODE_DEEP);
        let urls: Vec<String> = inputs
            .get("urls")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
                    .filter(|url| !url.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let max_pages = inputs
            .get("max_pages")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_PAGES_FETCH);

        if urls.is_empty() {
            let mut result = SkillResult::new("Источники не собраны: поисковый провайдер не настроен.");
            result.assumptions =
                vec!["Поисковый провайдер не настроен, передай список ссылок в inputs.urls.".to_string()];
            result.confidence = 0.1;
            return Ok(result);
        }

        let mut sources = Vec::new();
        for url in urls.iter().take(max_pages) {
            if let Some(source) = self.fetch_source(url).await {
                sources.push(source);
            } else {
                tracing::warn!(%url, "web research could not fetch source");
            }
        }

        if mode == MODE_CANDIDATES {
            let mut result =
                SkillResult::new(format!("Собраны кандидаты источников: {}.", sources.len()));
            result.confidence = if sources.is_empty() { 0.1 } else { 0.5 };
            result.sources = sources;
            return Ok(result);
        }

        let facts = self.extract_facts(&query, &sources, ctx).await?;
        let conflicts = detect_conflicts(&facts);

        let mut result = SkillResult::new(format!(
            "Глубокое исследование: источников {}, фактов {}.",
            sources.len(),
            facts.len()
        ));
        result.confidence = if facts.is_empty() { 0.3 } else { 0.7 };
        result.events = conflicts;
        result.events.push(json!({
            "message": "исследование завершено",
            "progress": {"current": sources.len(), "total": sources.len(), "unit": "источник"},
        }));
        result.sources = sources;
        result.facts = facts;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_and_snippet_extraction() {
        let html = "<html><head><title> Пример \n страницы </title></head>\
                    <body><script>var x;</script><p>Первый абзац.</p></body></html>";
        assert_eq!(extract_title(html).as_deref(), Some("Пример страницы"));
        let snippet = extract_snippet(html);
        assert!(snippet.contains("Первый абзац."));
        assert!(!snippet.contains("var x"));
    }

    #[test]
    fn domain_quality_tiers() {
        assert_eq!(quality_for_domain("ru.wikipedia.org"), "high");
        assert_eq!(quality_for_domain("docs.example.com"), "high");
        assert_eq!(quality_for_domain("blog.example.com"), "normal");
    }

    #[test]
    fn conflicting_fact_values_are_detected() {
        let facts = vec![
            FactCandidate {
                key: "население".to_string(),
                value: json!("1 млн"),
                confidence: 0.6,
                source_ids: vec!["s1".to_string()],
                created_at: None,
            },
            FactCandidate {
                key: "население".to_string(),
                value: json!("2 млн"),
                confidence: 0.6,
                source_ids: vec!["s2".to_string()],
                created_at: None,
            },
            FactCandidate {
                key: "столица".to_string(),
                value: json!("Москва"),
                confidence: 0.9,
                source_ids: vec![],
                created_at: None,
            },
        ];
        let conflicts = detect_conflicts(&facts);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0]["fact_key"], json!("население"));
    }
}
