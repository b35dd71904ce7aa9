//! SQLite connection management and schema

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;

use crate::infrastructure::ports::RepoError;

/// Open (creating if missing) the SQLite file at `db_path`.
pub async fn connect(db_path: &str) -> Result<SqlitePool, RepoError> {
    let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", db_path))
        .await
        .map_err(|e| RepoError::database("connect", e))?;
    tracing::debug!(path = %db_path, "Opened SQLite database");
    Ok(pool)
}

/// Create the session/player/roll tables if they do not exist yet.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<(), RepoError> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            start_time TEXT NOT NULL,
            end_time TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS players (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS rolls (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL REFERENCES sessions(id),
            player_id INTEGER NOT NULL REFERENCES players(id),
            total INTEGER NOT NULL,
            rolled_at TEXT NOT NULL,
            envelope_id TEXT NOT NULL UNIQUE
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_rolls_session ON rolls(session_id)",
        r#"
        CREATE TABLE IF NOT EXISTS dice_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            roll_id INTEGER NOT NULL REFERENCES rolls(id),
            position INTEGER NOT NULL,
            value INTEGER NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_dice_results_roll ON dice_results(roll_id, position)",
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| RepoError::database("ensure_schema", e))?;
    }

    tracing::info!("Database schema initialized");
    Ok(())
}

/// Fixed-width RFC 3339 so that stored timestamps compare correctly as text.
pub(crate) fn to_db_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_db_timestamp(s: &str) -> Result<DateTime<Utc>, RepoError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepoError::corrupt("timestamp", format!("{:?}: {}", s, e)))
}

/// Fresh database file with the schema applied, in a temporary directory.
/// Keep the `TempDir` alive for as long as the pool is used.
#[cfg(test)]
pub(crate) async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("test.db");
    let pool = connect(&path.to_string_lossy()).await.expect("connect");
    ensure_schema(&pool).await.expect("schema");
    (dir, pool)
}
