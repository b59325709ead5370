use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use aura_core::reminders::delivery_timezone;
use aura_store::{EventBus, Store};
use aura_types::{now_iso, Reminder};

const TELEGRAM_ATTEMPTS: u32 = 3;
const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(8);

fn telegram_config() -> Option<(String, String)> {
    let token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
    let chat_id = std::env::var("TELEGRAM_CHAT_ID").unwrap_or_default();
    let token = token.trim();
    let chat_id = chat_id.trim();
    if token.is_empty() || chat_id.is_empty() {
        None
    } else {
        Some((token.to_string(), chat_id.to_string()))
    }
}

fn reminders_enabled() -> bool {
    let raw = std::env::var("AURA_REMINDERS_ENABLED").unwrap_or_else(|_| "true".to_string());
    !matches!(raw.trim().to_lowercase().as_str(), "0" | "false" | "no" | "off")
}

fn event_run_id(reminder: &Reminder) -> String {
    match reminder.run_id.as_deref().map(str::trim) {
        Some(run_id) if !run_id.is_empty() => run_id.to_string(),
        _ => format!("reminder:{}", reminder.id),
    }
}

fn format_due_for_message(due_at: &str) -> String {
    let raw = due_at.trim();
    if raw.is_empty() {
        return "не указано".to_string();
    }
    let Ok(parsed) = DateTime::parse_from_rfc3339(&raw.replace('Z', "+00:00")) else {
        return raw.to_string();
    };
    let tz = delivery_timezone();
    let local = parsed.with_timezone(&tz);
    let today = Utc::now().with_timezone(&tz).date_naive();
    let day_note = if local.date_naive() == today {
        " (сегодня)".to_string()
    } else {
        format!(" ({})", local.format("%d.%m"))
    };
    format!("{}{day_note}", local.format("%H:%M"))
}

fn format_reminder_message(reminder: &Reminder) -> String {
    let text = reminder.text.trim();
    let text = if text.is_empty() { "без текста" } else { text };
    format!(
        "Напоминание: {text}. Время: {}.",
        format_due_for_message(&reminder.due_at)
    )
}

/// Single polling worker that claims due reminders and dispatches them
/// through the configured delivery strategy.
pub struct ReminderScheduler {
    store: Arc<Store>,
    bus: EventBus,
    http: reqwest::Client,
    poll_interval: Duration,
    batch_size: usize,
    shutdown: CancellationToken,
}

impl ReminderScheduler {
    pub fn new(store: Arc<Store>) -> Self {
        let bus = EventBus::new(store.clone());
        Self {
            store,
            bus,
            http: reqwest::Client::new(),
            poll_interval: Duration::from_secs(5),
            batch_size: 20,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(scheduler.poll_interval) => {
                        if let Err(error) = scheduler.run_once().await {
                            tracing::warn!(%error, "reminder scheduler tick failed");
                        }
                    }
                }
            }
        });
    }

    pub async fn run_once(&self) -> anyhow::Result<()> {
        if !reminders_enabled() {
            return Ok(());
        }
        let reminders = self
            .store
            .claim_due_reminders(&now_iso(), self.batch_size)
            .await?;
        for reminder in reminders {
            self.deliver(&reminder).await?;
        }
        Ok(())
    }

    async fn emit(&self, run_id: &str, event_type: &str, message: &str, payload: serde_json::Value) {
        if let Err(error) = self.bus.emit(run_id, event_type, message, payload).await {
            tracing::warn!(%error, event_type, "failed to append reminder event");
        }
    }

    async fn deliver(&self, reminder: &Reminder) -> anyhow::Result<()> {
        let event_run = event_run_id(reminder);
        let message_text = format_reminder_message(reminder);
        self.emit(
            &event_run,
            "reminder_due",
            "Напоминание подошло",
            json!({"id": reminder.id.clone(), "run_id": reminder.run_id.clone()}),
        )
        .await;

        if reminder.delivery == "telegram" {
            let Some((token, chat_id)) = telegram_config() else {
                self.store
                    .mark_reminder_failed(&reminder.id, "telegram_not_configured", "local")
                    .await?;
                self.emit(
                    &event_run,
                    "reminder_failed",
                    "Telegram не настроен",
                    json!({
                        "id": reminder.id.clone(),
                        "error": "telegram_not_configured",
                        "run_id": reminder.run_id.clone(),
                    }),
                )
                .await;
                println!("[reminder] {message_text}");
                return Ok(());
            };

            let mut last_error = "telegram_send_failed".to_string();
            for attempt in 0..TELEGRAM_ATTEMPTS {
                match self.send_telegram(&token, &chat_id, &message_text).await {
                    Ok(()) => {
                        self.store.mark_reminder_sent(&reminder.id, "telegram").await?;
                        self.emit(
                            &event_run,
                            "reminder_sent",
                            "Напоминание отправлено",
                            json!({
                                "id": reminder.id.clone(),
                                "delivery": "telegram",
                                "run_id": reminder.run_id.clone(),
                            }),
                        )
                        .await;
                        return Ok(());
                    }
                    Err(error) => {
                        last_error = error;
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    }
                }
            }

            self.store
                .mark_reminder_failed(&reminder.id, &last_error, "telegram")
                .await?;
            self.emit(
                &event_run,
                "reminder_failed",
                "Не удалось отправить в Telegram",
                json!({"id": reminder.id.clone(), "error": last_error, "run_id": reminder.run_id.clone()}),
            )
            .await;
            return Ok(());
        }

        // Local delivery.
        println!("[reminder] {message_text}");
        self.store.mark_reminder_sent(&reminder.id, "local").await?;
        self.emit(
            &event_run,
            "reminder_sent",
            "Напоминание доставлено локально",
            json!({"id": reminder.id.clone(), "delivery": "local", "run_id": reminder.run_id.clone()}),
        )
        .await;
        Ok(())
    }

    async fn send_telegram(&self, token: &str, chat_id: &str, text: &str) -> Result<(), String> {
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let response = self
            .http
            .post(&url)
            .timeout(TELEGRAM_TIMEOUT)
            .json(&json!({"chat_id": chat_id, "text": text}))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        if (200..300).contains(&status) && body.get("ok") == Some(&serde_json::Value::Bool(true)) {
            Ok(())
        } else {
            Err(format!("telegram_http_{status}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_once_claims_and_delivers_locally() {
        std::env::remove_var("TELEGRAM_BOT_TOKEN");
        std::env::remove_var("TELEGRAM_CHAT_ID");
        std::env::remove_var("AURA_REMINDERS_ENABLED");
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .create_reminder("2000-01-01T00:00:00Z", "попить воды", "local", None, None)
            .await
            .unwrap();

        let scheduler = ReminderScheduler::new(store.clone());
        scheduler.run_once().await.unwrap();

        let reminders = store.list_reminders(None, 10).await.unwrap();
        assert_eq!(reminders.len(), 1);
        assert_eq!(reminders[0].status, aura_types::ReminderStatus::Sent);
        assert_eq!(reminders[0].attempts, 1);

        let events = store
            .list_events(&format!("reminder:{}", reminders[0].id), 10)
            .await
            .unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["reminder_due", "reminder_sent"]);
    }

    #[test]
    fn message_formatting_includes_due_time() {
        let reminder = Reminder {
            id: "r1".to_string(),
            created_at: now_iso(),
            due_at: "2030-01-02T10:30:00Z".to_string(),
            text: "попить воды".to_string(),
            status: aura_types::ReminderStatus::Pending,
            delivery: "local".to_string(),
            last_error: None,
            run_id: None,
            source: None,
            sent_at: None,
            updated_at: now_iso(),
            attempts: 0,
        };
        let message = format_reminder_message(&reminder);
        assert!(message.starts_with("Напоминание: попить воды."));
        assert!(message.contains("10:30"));
    }
}
