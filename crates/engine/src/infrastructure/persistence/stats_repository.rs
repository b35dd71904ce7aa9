//! SQLite-backed roll statistics.
//!
//! Criticals follow the 3d6 convention: a total of 3-4 is a critical success,
//! 17-18 a critical failure.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use dicelog_domain::{
    CriticalCounts, PlayerAverage, SessionAverage, SessionId, StatsScope, CRITICAL_FAILURE_MAX,
    CRITICAL_FAILURE_MIN, CRITICAL_SUCCESS_MAX, CRITICAL_SUCCESS_MIN,
};

use crate::infrastructure::ports::{RepoError, StatsRepo};

pub struct SqliteStatsRepo {
    pool: SqlitePool,
}

impl SqliteStatsRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// WHERE clause restricting `rolls r` to a scope, plus its bind value.
fn scope_filter(scope: StatsScope) -> (&'static str, Option<i64>) {
    match scope {
        StatsScope::All => ("", None),
        StatsScope::LastSession => ("WHERE r.session_id = (SELECT MAX(id) FROM sessions)", None),
        StatsScope::Session(id) => ("WHERE r.session_id = ?", Some(id.get())),
    }
}

#[async_trait]
impl StatsRepo for SqliteStatsRepo {
    async fn average_by_session(
        &self,
        split_by_player: bool,
    ) -> Result<Vec<SessionAverage>, RepoError> {
        let sql = if split_by_player {
            r#"
            SELECT s.id AS session_id, p.name AS player, AVG(r.total) AS average_total
            FROM sessions s
            LEFT JOIN rolls r ON s.id = r.session_id
            LEFT JOIN players p ON r.player_id = p.id
            GROUP BY s.id, p.name
            ORDER BY s.id, p.name
            "#
        } else {
            r#"
            SELECT s.id AS session_id, NULL AS player, AVG(r.total) AS average_total
            FROM sessions s
            LEFT JOIN rolls r ON s.id = r.session_id
            GROUP BY s.id
            ORDER BY s.id
            "#
        };

        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepoError::database("average_by_session", e))?;

        Ok(rows
            .into_iter()
            .map(|row| SessionAverage {
                session_id: SessionId::new(row.get("session_id")),
                player: row.get("player"),
                average_total: row.get("average_total"),
            })
            .collect())
    }

    async fn average_by_player(&self, scope: StatsScope) -> Result<Vec<PlayerAverage>, RepoError> {
        let (filter, session_id) = scope_filter(scope);
        let sql = format!(
            r#"
            SELECT p.name AS player, AVG(r.total) AS average_total
            FROM rolls r
            JOIN players p ON r.player_id = p.id
            {}
            GROUP BY p.name
            ORDER BY average_total, p.name
            "#,
            filter
        );

        let mut query = sqlx::query(&sql);
        if let Some(id) = session_id {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepoError::database("average_by_player", e))?;

        Ok(rows
            .into_iter()
            .map(|row| PlayerAverage {
                player: row.get("player"),
                average_total: row.get("average_total"),
            })
            .collect())
    }

    async fn critical_rolls_by_player(
        &self,
        scope: StatsScope,
    ) -> Result<Vec<CriticalCounts>, RepoError> {
        let (filter, session_id) = scope_filter(scope);
        let sql = format!(
            r#"
            SELECT p.name AS player,
                   SUM(CASE WHEN r.total BETWEEN {} AND {} THEN 1 ELSE 0 END) AS critical_success,
                   SUM(CASE WHEN r.total BETWEEN {} AND {} THEN 1 ELSE 0 END) AS critical_failure
            FROM rolls r
            JOIN players p ON r.player_id = p.id
            {}
            GROUP BY p.name
            ORDER BY p.name
            "#,
            CRITICAL_SUCCESS_MIN,
            CRITICAL_SUCCESS_MAX,
            CRITICAL_FAILURE_MIN,
            CRITICAL_FAILURE_MAX,
            filter
        );

        let mut query = sqlx::query(&sql);
        if let Some(id) = session_id {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepoError::database("critical_rolls_by_player", e))?;

        Ok(rows
            .into_iter()
            .map(|row| CriticalCounts {
                player: row.get("player"),
                critical_success: row.get("critical_success"),
                critical_failure: row.get("critical_failure"),
            })
            .collect())
    }
}
