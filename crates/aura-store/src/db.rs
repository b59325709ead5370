use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use aura_types::now_iso;

pub const DB_FILENAME: &str = "aura.db";

/// Migrations are embedded and applied once, tracked by filename in the
/// `schema_migrations` table so re-running init is a no-op.
const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_init.sql",
    include_str!("migrations/0001_init.sql"),
)];

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid_event_type: {0}")]
    InvalidEventType(String),
    #[error("content_too_long:{0}")]
    ContentTooLong(usize),
    #[error("{0}")]
    Invalid(String),
}

pub fn open(data_dir: &Path) -> StoreResult<Connection> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| StoreError::Invalid(format!("cannot create data dir: {e}")))?;
    let conn = Connection::open(data_dir.join(DB_FILENAME))?;
    configure(&conn)?;
    apply_migrations(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> StoreResult<Connection> {
    let conn = Connection::open_in_memory()?;
    apply_migrations(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> StoreResult<()> {
    conn.busy_timeout(Duration::from_secs(10))?;
    // PRAGMA journal_mode returns a row, so query_row and ignore it.
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.execute("PRAGMA synchronous = NORMAL", [])?;
    Ok(())
}

fn apply_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           name TEXT NOT NULL UNIQUE,
           applied_at TEXT NOT NULL
         )",
        [],
    )?;

    for (name, sql) in MIGRATIONS {
        let applied: bool = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE name = ?1",
                [name],
                |_| Ok(true),
            )
            .unwrap_or(false);
        if applied {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, ?2)",
            rusqlite::params![name, now_iso()],
        )?;
        tracing::info!(migration = %name, "applied schema migration");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        apply_migrations(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }
}
