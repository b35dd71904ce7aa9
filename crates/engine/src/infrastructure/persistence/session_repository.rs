//! SQLite-backed session storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use dicelog_domain::{Session, SessionId};

use super::connection::{parse_db_timestamp, to_db_timestamp};
use crate::infrastructure::ports::{RepoError, SessionRepo};

pub struct SqliteSessionRepo {
    pool: SqlitePool,
}

impl SqliteSessionRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_session(row: &SqliteRow) -> Result<Session, RepoError> {
    let start_time: String = row.get("start_time");
    let end_time: Option<String> = row.get("end_time");
    Ok(Session {
        id: SessionId::new(row.get("id")),
        start_time: parse_db_timestamp(&start_time)?,
        end_time: end_time.as_deref().map(parse_db_timestamp).transpose()?,
    })
}

#[async_trait]
impl SessionRepo for SqliteSessionRepo {
    async fn start_session(&self, started_at: DateTime<Utc>) -> Result<Session, RepoError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sessions (start_time) VALUES (?)
            RETURNING id, start_time, end_time
            "#,
        )
        .bind(to_db_timestamp(started_at))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepoError::database("start_session", e))?;

        row_to_session(&row)
    }

    async fn latest_session(&self) -> Result<Option<Session>, RepoError> {
        let row = sqlx::query(
            "SELECT id, start_time, end_time FROM sessions ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepoError::database("latest_session", e))?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn end_latest_session(
        &self,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<Session>, RepoError> {
        let row = sqlx::query(
            r#"
            UPDATE sessions SET end_time = ?
            WHERE id = (SELECT MAX(id) FROM sessions)
            AND end_time IS NULL
            RETURNING id, start_time, end_time
            "#,
        )
        .bind(to_db_timestamp(ended_at))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepoError::database("end_latest_session", e))?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn end_open_session(
        &self,
        id: SessionId,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<Session>, RepoError> {
        let row = sqlx::query(
            r#"
            UPDATE sessions SET end_time = ?
            WHERE id = ? AND end_time IS NULL
            RETURNING id, start_time, end_time
            "#,
        )
        .bind(to_db_timestamp(ended_at))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepoError::database("end_open_session", e))?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, RepoError> {
        let row = sqlx::query("SELECT id, start_time, end_time FROM sessions WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepoError::database("get_session", e))?;

        row.as_ref().map(row_to_session).transpose()
    }
}
