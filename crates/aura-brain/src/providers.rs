use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::routing::redact_secrets;
use crate::secrets::Secrets;
use crate::types::ChatMessage;

const MAX_ARTIFACT_PAYLOAD_CHARS: usize = 5000;

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
    pub provider: &'static str,
    pub status_code: Option<u16>,
    pub error_type: String,
    pub artifact_path: Option<String>,
    pub retry_count: u32,
}

impl ProviderError {
    pub fn new(provider: &'static str, error_type: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            provider,
            status_code: None,
            error_type: error_type.to_string(),
            artifact_path: None,
            retry_count: 0,
        }
    }

    fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    fn with_artifact(mut self, artifact_path: Option<String>) -> Self {
        self.artifact_path = artifact_path;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderResult {
    pub text: String,
    pub usage: Option<Value>,
    pub raw: Option<Value>,
    pub model_id: Option<String>,
}

/// Everything a provider needs for one chat call. The router has already
/// selected the concrete `model`.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub json_schema: Option<Value>,
    pub tools: Option<Value>,
    pub run_id: Option<String>,
    pub step_id: Option<String>,
    pub purpose: Option<String>,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, call: &ProviderCall) -> Result<ProviderResult, ProviderError>;
}

fn messages_to_prompt(messages: &[ChatMessage]) -> String {
    let mut parts: Vec<String> = Vec::new();
    for message in messages {
        let content = message.content.trim();
        if content.is_empty() {
            continue;
        }
        let label = match message.role.trim().to_lowercase().as_str() {
            "system" => "System",
            "assistant" => "Assistant",
            _ => "User",
        };
        parts.push(format!("{label}:\n{content}"));
    }
    parts.push("Assistant:".to_string());
    parts.join("\n\n")
}

fn messages_json(messages: &[ChatMessage]) -> Value {
    Value::Array(
        messages
            .iter()
            .map(|m| json!({"role": m.role.clone(), "content": m.content.clone()}))
            .collect(),
    )
}

/// Unwraps `{schema: {...}}` wrappers; Ollama wants the bare schema in
/// `format`.
fn normalize_json_schema(schema: &Option<Value>) -> Option<Value> {
    let schema = schema.as_ref()?;
    if let Some(inner) = schema.get("schema").filter(|s| s.is_object()) {
        return Some(inner.clone());
    }
    if schema.get("type").is_some() {
        return Some(schema.clone());
    }
    None
}

fn sanitize_artifact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            let (redacted, _) = redact_secrets(s);
            Value::String(redacted.chars().take(MAX_ARTIFACT_PAYLOAD_CHARS).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_artifact_value(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_artifact_value).collect()),
        other => other.clone(),
    }
}

fn extract_error_text(status: u16, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|data| {
            data.get("error")
                .map(|e| e.as_str().map(|s| s.to_string()).unwrap_or_else(|| e.to_string()))
        })
        .unwrap_or_else(|| {
            if body.is_empty() {
                format!("HTTP {status}")
            } else {
                body.to_string()
            }
        })
}

fn missing_model_hint(error_text: &str) -> Option<&'static str> {
    let lowered = error_text.to_lowercase();
    if lowered.contains("model") && lowered.contains("not found") {
        Some("Модель не найдена. Установи её через ollama pull.")
    } else {
        None
    }
}

/// Local model server speaking the Ollama API.
pub struct LocalOllamaProvider {
    base_url: String,
    timeout: Duration,
    artifact_dir: PathBuf,
    http: reqwest::Client,
}

impl LocalOllamaProvider {
    pub fn new(base_url: &str, timeout_s: u64, artifact_dir: &Path) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(timeout_s),
            artifact_dir: artifact_dir.join("local_llm_failures"),
            http: reqwest::Client::new(),
        }
    }

    /// Persists a redacted copy of the failing request/response; the
    /// relative path travels on the error for diagnostics.
    fn write_failure_artifact(
        &self,
        payload: &Value,
        response_status: Option<u16>,
        response_text: &str,
        call: &ProviderCall,
        variant: &str,
    ) -> Option<String> {
        if std::fs::create_dir_all(&self.artifact_dir).is_err() {
            return None;
        }
        let ts = Utc::now().format("%Y%m%d_%H%M%S");
        let run = call.run_id.as_deref().unwrap_or("unknown");
        let step = call.step_id.as_deref().unwrap_or("unknown");
        let filename = format!("{ts}_{run}_{step}_{variant}.json");
        let path = self.artifact_dir.join(&filename);

        let (redacted_response, _) = redact_secrets(response_text);
        let artifact = json!({
            "ts": Utc::now().to_rfc3339(),
            "run_id": call.run_id.clone(),
            "step_id": call.step_id.clone(),
            "purpose": call.purpose.clone(),
            "model": call.model.clone(),
            "variant": variant,
            "request_payload": sanitize_artifact_value(payload),
            "response_status": response_status,
            "response_text": redacted_response.chars().take(MAX_ARTIFACT_PAYLOAD_CHARS).collect::<String>(),
        });
        let rendered = serde_json::to_string_pretty(&artifact).ok()?;
        if std::fs::write(&path, rendered).is_err() {
            return None;
        }
        Some(format!("artifacts/local_llm_failures/{filename}"))
    }

    fn chat_payload(&self, call: &ProviderCall, simplified: bool) -> Value {
        let mut payload = json!({
            "model": call.model.clone(),
            "messages": messages_json(&call.messages),
            "stream": false,
        });
        if simplified {
            return payload;
        }
        payload["options"] = json!({"temperature": call.temperature});
        if let Some(max_tokens) = call.max_tokens {
            payload["options"]["num_predict"] = json!(max_tokens);
        }
        if let Some(schema) = normalize_json_schema(&call.json_schema) {
            payload["format"] = schema;
        }
        if let Some(tools) = &call.tools {
            payload["tools"] = tools.clone();
        }
        payload
    }

    fn parse_chat_response(data: Value, model: &str) -> ProviderResult {
        let text = data
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();
        let usage = json!({
            "prompt_eval_count": data.get("prompt_eval_count"),
            "eval_count": data.get("eval_count"),
            "total_duration": data.get("total_duration"),
        });
        ProviderResult {
            text,
            usage: Some(usage),
            raw: Some(data),
            model_id: Some(model.to_string()),
        }
    }

    async fn post(
        &self,
        endpoint: &str,
        payload: &Value,
    ) -> Result<(u16, String), reqwest::Error> {
        let resp = self
            .http
            .post(format!("{}{endpoint}", self.base_url))
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Ok((status, body))
    }

    /// Flat-prompt fallback through `/api/generate`, only reachable when
    /// the request carries no schema and no tools.
    async fn generate(&self, call: &ProviderCall) -> Result<ProviderResult, ProviderError> {
        let prompt = messages_to_prompt(&call.messages);
        let mut payload = json!({
            "model": call.model.clone(),
            "prompt": prompt,
            "stream": false,
            "options": {"temperature": call.temperature},
        });
        if let Some(max_tokens) = call.max_tokens {
            payload["options"]["num_predict"] = json!(max_tokens);
        }

        let (status, body) = self.post("/api/generate", &payload).await.map_err(|e| {
            ProviderError::new("local", "connection_error", format!("Local LLM request failed: {e}"))
        })?;

        if status >= 400 {
            let error_text = extract_error_text(status, &body);
            let hint = missing_model_hint(&error_text);
            let artifact =
                self.write_failure_artifact(&payload, Some(status), &body, call, "generate_fallback");
            let mut message = format!("Local LLM HTTP {status}: {error_text}");
            if let Some(hint) = hint {
                message = format!("{message} {hint}");
            }
            return Err(ProviderError::new(
                "local",
                if hint.is_some() { "model_not_found" } else { "http_error" },
                message,
            )
            .with_status(status)
            .with_artifact(artifact));
        }

        let data: Value = serde_json::from_str(&body).map_err(|_| {
            ProviderError::new("local", "invalid_json", "Local LLM returned invalid JSON")
                .with_status(status)
        })?;
        let text = data
            .get("response")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let usage = json!({
            "prompt_eval_count": data.get("prompt_eval_count"),
            "eval_count": data.get("eval_count"),
            "total_duration": data.get("total_duration"),
        });
        Ok(ProviderResult {
            text,
            usage: Some(usage),
            raw: Some(data),
            model_id: Some(call.model.clone()),
        })
    }

    fn http_error(
        &self,
        payload: &Value,
        status: u16,
        body: &str,
        call: &ProviderCall,
        variant: &str,
    ) -> ProviderError {
        let error_text = extract_error_text(status, body);
        let hint = missing_model_hint(&error_text);
        let artifact = self.write_failure_artifact(payload, Some(status), body, call, variant);
        let mut message = format!("Local LLM HTTP {status}: {error_text}");
        if let Some(hint) = hint {
            message = format!("{message} {hint}");
        }
        ProviderError::new(
            "local",
            if hint.is_some() { "model_not_found" } else { "http_error" },
            message,
        )
        .with_status(status)
        .with_artifact(artifact)
    }
}

#[async_trait]
impl ChatProvider for LocalOllamaProvider {
    async fn chat(&self, call: &ProviderCall) -> Result<ProviderResult, ProviderError> {
        let allow_generate_fallback =
            normalize_json_schema(&call.json_schema).is_none() && call.tools.is_none();
        let payload = self.chat_payload(call, false);

        let (status, body) = match self.post("/api/chat", &payload).await {
            Ok(result) => result,
            Err(e) => {
                if allow_generate_fallback {
                    return self.generate(call).await;
                }
                return Err(ProviderError::new(
                    "local",
                    "connection_error",
                    format!("Local LLM request failed: {e}"),
                ));
            }
        };

        if status >= 500 {
            // One retry with a simplified payload: no schema, no tools,
            // no sampling options.
            let artifact =
                self.write_failure_artifact(&payload, Some(status), &body, call, "primary");
            let simplified = self.chat_payload(call, true);
            let (retry_status, retry_body) = match self.post("/api/chat", &simplified).await {
                Ok(result) => result,
                Err(e) => {
                    if allow_generate_fallback {
                        return self.generate(call).await;
                    }
                    return Err(ProviderError::new(
                        "local",
                        "connection_error",
                        format!("Local LLM request failed: {e}"),
                    )
                    .with_artifact(artifact));
                }
            };
            if retry_status >= 400 {
                if retry_status >= 500 && allow_generate_fallback {
                    return self.generate(call).await;
                }
                return Err(self.http_error(&simplified, retry_status, &retry_body, call, "simplified"));
            }
            let data: Value = match serde_json::from_str(&retry_body) {
                Ok(data) => data,
                Err(_) => {
                    if allow_generate_fallback {
                        return self.generate(call).await;
                    }
                    return Err(ProviderError::new(
                        "local",
                        "invalid_json",
                        "Local LLM returned invalid JSON",
                    )
                    .with_status(retry_status)
                    .with_artifact(artifact));
                }
            };
            return Ok(Self::parse_chat_response(data, &call.model));
        }

        if status >= 400 {
            return Err(self.http_error(&payload, status, &body, call, "primary"));
        }

        let data: Value = match serde_json::from_str(&body) {
            Ok(data) => data,
            Err(_) => {
                if allow_generate_fallback {
                    return self.generate(call).await;
                }
                return Err(ProviderError::new(
                    "local",
                    "invalid_json",
                    "Local LLM returned invalid JSON",
                )
                .with_status(status));
            }
        };
        Ok(Self::parse_chat_response(data, &call.model))
    }
}

/// OpenAI-compatible cloud endpoint. Requires an API key resolvable
/// through [`Secrets`]; retries live in the router.
pub struct CloudOpenAiProvider {
    base_url: String,
    timeout: Duration,
    secrets: Arc<Secrets>,
    http: reqwest::Client,
}

impl CloudOpenAiProvider {
    pub fn new(base_url: &str, timeout_s: u64, secrets: Arc<Secrets>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(timeout_s),
            secrets,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChatProvider for CloudOpenAiProvider {
    async fn chat(&self, call: &ProviderCall) -> Result<ProviderResult, ProviderError> {
        let Some(api_key) = self.secrets.get("OPENAI_API_KEY") else {
            return Err(ProviderError::new(
                "cloud",
                "missing_api_key",
                "OPENAI_API_KEY is missing",
            ));
        };

        let mut payload = json!({
            "model": call.model.clone(),
            "messages": messages_json(&call.messages),
            "temperature": call.temperature,
        });
        if let Some(max_tokens) = call.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(schema) = &call.json_schema {
            payload["response_format"] = json!({"type": "json_schema", "json_schema": schema});
        }
        if let Some(tools) = &call.tools {
            payload["tools"] = tools.clone();
        }

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.timeout)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                ProviderError::new(
                    "cloud",
                    "connection_error",
                    format!("Cloud LLM request failed: {e}"),
                )
            })?;

        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        if status >= 400 {
            return Err(
                ProviderError::new("cloud", "http_error", format!("Cloud LLM HTTP {status}"))
                    .with_status(status),
            );
        }

        let data: Value = serde_json::from_str(&body).map_err(|_| {
            ProviderError::new("cloud", "invalid_json", "Cloud LLM returned invalid JSON")
                .with_status(status)
        })?;
        let text = data
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let usage = data.get("usage").cloned();
        Ok(ProviderResult {
            text,
            usage,
            raw: Some(data),
            model_id: Some(call.model.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_reconstruction_labels_roles() {
        let messages = vec![
            ChatMessage::system("будь кратким"),
            ChatMessage::user("привет"),
            ChatMessage::assistant("здравствуй"),
        ];
        let prompt = messages_to_prompt(&messages);
        assert!(prompt.starts_with("System:\nбудь кратким"));
        assert!(prompt.contains("User:\nпривет"));
        assert!(prompt.ends_with("Assistant:"));
    }

    #[test]
    fn schema_wrapper_is_unwrapped() {
        let wrapped = Some(json!({"schema": {"type": "object"}}));
        assert_eq!(normalize_json_schema(&wrapped), Some(json!({"type": "object"})));
        let bare = Some(json!({"type": "object"}));
        assert_eq!(normalize_json_schema(&bare), Some(json!({"type": "object"})));
        assert_eq!(normalize_json_schema(&Some(json!({"name": "x"}))), None);
    }

    #[test]
    fn model_not_found_hint_matches() {
        assert!(missing_model_hint("model 'x' not found").is_some());
        assert!(missing_model_hint("server exploded").is_none());
    }
}
