//! Russian time-phrase parser for reminders: relative ("через N минут"),
//! day-anchored ("завтра в 10:30") and bare-clock ("в 16:00") forms.

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;

static TRIGGER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(напомни|напомнить|напоминание)\b").expect("trigger regex")
});
static IN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"через\s+(\d+)\s*(минут|минуты|минута|час|часа|часов)").expect("relative regex")
});
static DAY_AT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(завтра|сегодня)\s+в\s+(\d{1,2}):(\d{2})").expect("day regex"));
static AT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bв\s+(\d{1,2}):(\d{2})").expect("at regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static LEADING_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\s:–—-]+").expect("punct regex"));
static LEADING_FILLER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(а|про|о)\s+").expect("filler regex"));

#[derive(Debug, Clone, Default)]
pub struct ParsedReminder {
    pub due_at: Option<String>,
    pub text: Option<String>,
    pub question: Option<String>,
}

impl ParsedReminder {
    fn question(text: &str) -> Self {
        Self {
            due_at: None,
            text: None,
            question: Some(text.to_string()),
        }
    }
}

pub fn delivery_timezone() -> Tz {
    let raw = std::env::var("AURA_TIMEZONE").unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return chrono_tz::UTC;
    }
    if matches!(raw.to_lowercase().as_str(), "russia" | "msk" | "moscow") {
        return chrono_tz::Europe::Moscow;
    }
    raw.parse().unwrap_or(chrono_tz::UTC)
}

fn strip_reminder_phrase(text: &str) -> String {
    let cleaned = TRIGGER_RE.replace_all(text, "");
    WHITESPACE.replace_all(cleaned.trim(), " ").into_owned()
}

fn clean_reminder_text(text: &str) -> String {
    let cleaned = LEADING_PUNCT.replace(text, "");
    LEADING_FILLER.replace(cleaned.trim(), "").trim().to_string()
}

fn remove_phrase(text: &str, phrase: &str) -> String {
    let pattern = format!("(?i){}", regex::escape(phrase));
    match Regex::new(&pattern) {
        Ok(re) => re.replace(text, "").trim().to_string(),
        Err(_) => text.to_string(),
    }
}

fn to_utc_iso(dt: DateTime<Tz>) -> String {
    dt.with_timezone(&Utc)
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn reminder_text_without(text: &str, matched: &str) -> Option<String> {
    let stripped = strip_reminder_phrase(text);
    let without_time = remove_phrase(&stripped, matched);
    let cleaned = clean_reminder_text(&without_time);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn clock_due(
    now: DateTime<Tz>,
    day_offset: i64,
    hour: u32,
    minute: u32,
) -> Option<DateTime<Tz>> {
    if hour >= 24 || minute >= 60 {
        return None;
    }
    let tz = now.timezone();
    let date = now.date_naive() + Duration::days(day_offset);
    let mut due = tz
        .with_ymd_and_hms(
            chrono::Datelike::year(&date),
            chrono::Datelike::month(&date),
            chrono::Datelike::day(&date),
            hour,
            minute,
            0,
        )
        .earliest()?;
    if due < now {
        due += Duration::days(1);
    }
    Some(due)
}

/// Parses a reminder phrase. `now` defaults to the current time in the
/// configured timezone; passing it explicitly keeps tests deterministic.
pub fn parse_reminder_text(text: &str, now: Option<DateTime<Utc>>) -> ParsedReminder {
    let tz = delivery_timezone();
    let now_tz = now.unwrap_or_else(Utc::now).with_timezone(&tz);
    let normalized = WHITESPACE
        .replace_all(text.trim(), " ")
        .to_lowercase();

    if normalized.is_empty() {
        return ParsedReminder::question("Когда напомнить?");
    }

    if let Some(captures) = IN_RE.captures(&normalized) {
        let value: i64 = captures[1].parse().unwrap_or(0);
        let delta = if captures[2].starts_with("мин") {
            Duration::minutes(value)
        } else {
            Duration::hours(value)
        };
        let due = now_tz + delta;
        return match reminder_text_without(text, &captures[0]) {
            Some(reminder_text) => ParsedReminder {
                due_at: Some(to_utc_iso(due)),
                text: Some(reminder_text),
                question: None,
            },
            None => ParsedReminder::question("Что именно нужно напомнить?"),
        };
    }

    if let Some(captures) = DAY_AT_RE.captures(&normalized) {
        let day_offset = if &captures[1] == "завтра" { 1 } else { 0 };
        let hour: u32 = captures[2].parse().unwrap_or(24);
        let minute: u32 = captures[3].parse().unwrap_or(60);
        let Some(due) = clock_due(now_tz, day_offset, hour, minute) else {
            return ParsedReminder::question("Когда напомнить?");
        };
        return match reminder_text_without(text, &captures[0]) {
            Some(reminder_text) => ParsedReminder {
                due_at: Some(to_utc_iso(due)),
                text: Some(reminder_text),
                question: None,
            },
            None => ParsedReminder::question("Что именно нужно напомнить?"),
        };
    }

    if let Some(captures) = AT_RE.captures(&normalized) {
        let hour: u32 = captures[1].parse().unwrap_or(24);
        let minute: u32 = captures[2].parse().unwrap_or(60);
        let Some(due) = clock_due(now_tz, 0, hour, minute) else {
            return ParsedReminder::question("Когда напомнить?");
        };
        return match reminder_text_without(text, &captures[0]) {
            Some(reminder_text) => ParsedReminder {
                due_at: Some(to_utc_iso(due)),
                text: Some(reminder_text),
                question: None,
            },
            None => ParsedReminder::question("Что именно нужно напомнить?"),
        };
    }

    ParsedReminder::question("Когда напомнить?")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn relative_phrase_parses() {
        let parsed = parse_reminder_text("через 2 часа напомни сделать чай", Some(fixed_now()));
        assert!(parsed.question.is_none());
        assert_eq!(parsed.text.as_deref(), Some("сделать чай"));
        assert!(parsed.due_at.is_some());
    }

    #[test]
    fn minutes_phrase_parses() {
        let parsed = parse_reminder_text("напомни через 30 минут выпить воды", Some(fixed_now()));
        assert_eq!(parsed.text.as_deref(), Some("выпить воды"));
        let due = parsed.due_at.unwrap();
        assert!(due.starts_with("2025-01-01T12:30"));
    }

    #[test]
    fn tomorrow_at_clock_parses() {
        let parsed =
            parse_reminder_text("завтра в 10:30 напомни про встречу", Some(fixed_now()));
        assert!(parsed.question.is_none());
        assert!(parsed.text.unwrap().contains("встречу"));
        assert!(parsed.due_at.unwrap().starts_with("2025-01-02T10:30"));
    }

    #[test]
    fn bare_clock_rolls_to_next_day_when_past() {
        let parsed = parse_reminder_text("напомни в 09:00 про зарядку", Some(fixed_now()));
        assert!(parsed.due_at.unwrap().starts_with("2025-01-02T09:00"));
    }

    #[test]
    fn trigger_without_time_asks_when() {
        let parsed = parse_reminder_text("напомни купить молоко", Some(fixed_now()));
        assert!(parsed.due_at.is_none());
        assert_eq!(parsed.question.as_deref(), Some("Когда напомнить?"));
    }

    #[test]
    fn time_without_text_asks_what() {
        let parsed = parse_reminder_text("напомни через 10 минут", Some(fixed_now()));
        assert_eq!(parsed.question.as_deref(), Some("Что именно нужно напомнить?"));
    }
}
