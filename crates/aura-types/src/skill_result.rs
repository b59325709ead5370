use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A source a skill wants persisted for its run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceCandidate {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub retrieved_at: Option<String>,
    #[serde(default)]
    pub pinned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactCandidate {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub source_ids: Vec<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactCandidate {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub title: String,
    pub content_uri: String,
    #[serde(default)]
    pub meta: Value,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Every skill returns this shape so the run engine can persist results
/// uniformly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillResult {
    pub what_i_did: String,
    #[serde(default)]
    pub sources: Vec<SourceCandidate>,
    #[serde(default)]
    pub facts: Vec<FactCandidate>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub next_actions: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactCandidate>,
    #[serde(default)]
    pub events: Vec<Value>,
}

impl SkillResult {
    pub fn new(what_i_did: impl Into<String>) -> Self {
        Self {
            what_i_did: what_i_did.into(),
            ..Default::default()
        }
    }
}
