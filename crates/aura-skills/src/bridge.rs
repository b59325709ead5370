use async_trait::async_trait;
use serde_json::{json, Value};

/// Narrow contract to the desktop-side input bridge (mouse, keyboard,
/// shell, screen). The real bridge lives outside this repo; the no-op
/// implementation keeps the engine runnable without a desktop.
#[async_trait]
pub trait DesktopBridge: Send + Sync {
    async fn execute_action(&self, action: &Value) -> anyhow::Result<Value>;
    async fn shell_execute(&self, command: &str) -> anyhow::Result<Value>;
    async fn capture_observation(&self) -> anyhow::Result<String>;
}

pub struct NoopBridge;

#[async_trait]
impl DesktopBridge for NoopBridge {
    async fn execute_action(&self, action: &Value) -> anyhow::Result<Value> {
        tracing::info!(action = %action, "desktop bridge is not connected, action skipped");
        Ok(json!({"status": "skipped", "reason": "bridge_not_connected"}))
    }

    async fn shell_execute(&self, command: &str) -> anyhow::Result<Value> {
        tracing::info!(command, "desktop bridge is not connected, shell command skipped");
        Ok(json!({"status": "skipped", "reason": "bridge_not_connected"}))
    }

    async fn capture_observation(&self) -> anyhow::Result<String> {
        Ok("Экран недоступен: мост рабочего стола не подключён.".to_string())
    }
}
