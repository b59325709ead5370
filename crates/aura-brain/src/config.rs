use std::path::PathBuf;

use crate::secrets::Secrets;

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct BrainConfig {
    pub local_base_url: String,
    pub local_chat_model: String,
    pub local_code_model: String,
    pub local_timeout_s: u64,
    pub cloud_base_url: String,
    pub cloud_model: String,
    pub cloud_timeout_s: u64,
    pub cloud_enabled: bool,
    pub auto_cloud_enabled: bool,
    pub cloud_enabled_override: bool,
    pub auto_cloud_override: bool,
    pub max_concurrency: u32,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub budget_per_run: Option<u32>,
    pub budget_per_step: Option<u32>,
    pub qa_mode: bool,
    /// Redacted failure artifacts land under
    /// `<artifact_dir>/local_llm_failures/`.
    pub artifact_dir: PathBuf,
}

impl BrainConfig {
    pub fn from_env(secrets: &Secrets) -> Self {
        let api_key = secrets.get("OPENAI_API_KEY");
        let mut cloud_enabled = env_bool("AURA_CLOUD_ENABLED", false);
        if api_key.is_none() {
            cloud_enabled = false;
        }
        let base_dir =
            PathBuf::from(env_string("AURA_BASE_DIR", "."));

        Self {
            local_base_url: env_string("AURA_LLM_LOCAL_BASE_URL", "http://127.0.0.1:11434"),
            local_chat_model: env_string("AURA_LLM_LOCAL_CHAT_MODEL", "saiga-nemo-12b"),
            local_code_model: env_string(
                "AURA_LLM_LOCAL_CODE_MODEL",
                "deepseek-coder-v2:16b-lite-instruct-q8_0",
            ),
            local_timeout_s: env_u32("AURA_LLM_LOCAL_TIMEOUT_S", 30).max(1) as u64,
            cloud_base_url: env_string("AURA_LLM_CLOUD_BASE_URL", "https://api.openai.com/v1"),
            cloud_model: env_string("AURA_LLM_CLOUD_MODEL", "gpt-4.1"),
            cloud_timeout_s: env_u32("AURA_LLM_CLOUD_TIMEOUT_S", 30).max(1) as u64,
            cloud_enabled,
            auto_cloud_enabled: env_bool("AURA_AUTO_CLOUD_ENABLED", false),
            cloud_enabled_override: std::env::var("AURA_CLOUD_ENABLED").is_ok(),
            auto_cloud_override: std::env::var("AURA_AUTO_CLOUD_ENABLED").is_ok(),
            max_concurrency: env_u32("AURA_LLM_MAX_CONCURRENCY", 1).max(1),
            max_retries: env_u32("AURA_LLM_MAX_RETRIES", 3),
            backoff_base_ms: env_u32("AURA_LLM_BACKOFF_BASE_MS", 350).max(1) as u64,
            budget_per_run: env_opt_u32("AURA_LLM_BUDGET_PER_RUN"),
            budget_per_step: env_opt_u32("AURA_LLM_BUDGET_PER_STEP"),
            qa_mode: env_bool("AURA_QA_MODE", false),
            artifact_dir: base_dir.join("artifacts"),
        }
    }
}
