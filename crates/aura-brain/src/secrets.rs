use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

/// Read-through secret resolution: runtime cache, then environment, then
/// the local secrets file. The passphrase-protected vault is an external
/// collaborator reached through `vault_path`; this cache never writes it.
#[derive(Default)]
pub struct Secrets {
    runtime: RwLock<HashMap<String, String>>,
    passphrase: RwLock<Option<String>>,
}

impl Secrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_runtime(&self, key: &str, value: &str) {
        self.runtime
            .write()
            .expect("secrets lock")
            .insert(key.to_string(), value.to_string());
    }

    pub fn set_passphrase(&self, value: Option<String>) {
        *self.passphrase.write().expect("secrets lock") = value;
    }

    pub fn passphrase_set(&self) -> bool {
        self.passphrase.read().expect("secrets lock").is_some()
    }

    pub fn vault_path() -> PathBuf {
        PathBuf::from(
            std::env::var("AURA_VAULT_PATH").unwrap_or_else(|_| ".aura/vault.bin".to_string()),
        )
    }

    fn local_secrets_path() -> PathBuf {
        PathBuf::from(
            std::env::var("AURA_LOCAL_SECRETS_PATH")
                .unwrap_or_else(|_| "config/local.secrets.json".to_string()),
        )
    }

    pub fn get_local(&self, key: &str) -> Option<String> {
        let path = Self::local_secrets_path();
        let raw = std::fs::read_to_string(path).ok()?;
        let data: serde_json::Value = serde_json::from_str(&raw).ok()?;
        data.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn set_local(&self, key: &str, value: &str) -> std::io::Result<()> {
        let path = Self::local_secrets_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut payload: serde_json::Map<String, serde_json::Value> = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        payload.insert(key.to_string(), serde_json::Value::String(value.to_string()));
        std::fs::write(path, serde_json::to_string_pretty(&payload)?)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.runtime.read().expect("secrets lock").get(key) {
            return Some(value.clone());
        }
        if let Ok(value) = std::env::var(key) {
            if !value.is_empty() {
                return Some(value);
            }
        }
        self.get_local(key)
    }
}
