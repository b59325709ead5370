mod entities;
mod skill_result;
mod status;

pub use entities::*;
pub use skill_result::*;
pub use status::*;

use chrono::{SecondsFormat, Utc};

/// UTC timestamp in RFC 3339 with a trailing `Z`, millisecond precision.
/// Lexicographic order equals chronological order, which the store relies
/// on for `due_at` comparisons.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
