//! SQLite-backed player and roll storage.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool};
use uuid::Uuid;

use dicelog_domain::{
    DiceResults, EnvelopeId, Player, PlayerId, PlayerName, RecordOutcome, Roll, RollCommand, RollId,
    SessionId,
};

use super::connection::{parse_db_timestamp, to_db_timestamp};
use crate::infrastructure::ports::{RepoError, RollRepo};

pub struct SqliteRollRepo {
    pool: SqlitePool,
}

impl SqliteRollRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

async fn upsert_player<'e, E>(executor: E, name: &str) -> Result<i64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar(
        r#"
        INSERT INTO players (name) VALUES (?)
        ON CONFLICT(name) DO UPDATE SET name = excluded.name
        RETURNING id
        "#,
    )
    .bind(name)
    .fetch_one(executor)
    .await
}

/// Foreign key failures mean the roll points at a session that does not exist.
fn map_write_error(session_id: SessionId, e: sqlx::Error) -> RepoError {
    match e.as_database_error() {
        Some(db) if db.is_foreign_key_violation() => RepoError::UnknownSession(session_id),
        _ => RepoError::database("record_roll", e),
    }
}

#[async_trait]
impl RollRepo for SqliteRollRepo {
    async fn get_or_create_player(&self, name: &PlayerName) -> Result<Player, RepoError> {
        let id = upsert_player(&self.pool, name.as_str())
            .await
            .map_err(|e| RepoError::database("get_or_create_player", e))?;
        Ok(Player {
            id: PlayerId::new(id),
            name: name.clone(),
        })
    }

    async fn record_roll(
        &self,
        envelope_id: EnvelopeId,
        roll: &RollCommand,
        recorded_at: DateTime<Utc>,
    ) -> Result<RecordOutcome, RepoError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepoError::database("record_roll", e))?;

        let player_id = upsert_player(&mut *tx, roll.player.as_str())
            .await
            .map_err(|e| RepoError::database("record_roll", e))?;

        let roll_id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO rolls (session_id, player_id, total, rolled_at, envelope_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(envelope_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(roll.session_id.get())
        .bind(player_id)
        .bind(roll.total)
        .bind(to_db_timestamp(recorded_at))
        .bind(envelope_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_write_error(roll.session_id, e))?;

        let Some(roll_id) = roll_id else {
            tx.rollback()
                .await
                .map_err(|e| RepoError::database("record_roll", e))?;
            return Ok(RecordOutcome::Duplicate);
        };

        for (position, value) in roll.results.as_slice().iter().enumerate() {
            sqlx::query("INSERT INTO dice_results (roll_id, position, value) VALUES (?, ?, ?)")
                .bind(roll_id)
                .bind(position as i64)
                .bind(*value)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_write_error(roll.session_id, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| RepoError::database("record_roll", e))?;

        Ok(RecordOutcome::Recorded(RollId::new(roll_id)))
    }

    async fn list_session_rolls(&self, session_id: SessionId) -> Result<Vec<Roll>, RepoError> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.total, r.rolled_at, r.envelope_id, p.name
            FROM rolls r
            JOIN players p ON p.id = r.player_id
            WHERE r.session_id = ?
            ORDER BY r.id
            "#,
        )
        .bind(session_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepoError::database("list_session_rolls", e))?;

        let result_rows = sqlx::query(
            r#"
            SELECT d.roll_id, d.value
            FROM dice_results d
            JOIN rolls r ON r.id = d.roll_id
            WHERE r.session_id = ?
            ORDER BY d.roll_id, d.position
            "#,
        )
        .bind(session_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepoError::database("list_session_rolls", e))?;

        let mut results: HashMap<i64, Vec<i64>> = HashMap::new();
        for row in result_rows {
            results
                .entry(row.get("roll_id"))
                .or_default()
                .push(row.get("value"));
        }

        rows.into_iter()
            .map(|row| {
                let id: i64 = row.get("id");
                let name: String = row.get("name");
                let rolled_at: String = row.get("rolled_at");
                let envelope_id: String = row.get("envelope_id");
                let envelope_id = Uuid::parse_str(&envelope_id)
                    .map_err(|e| RepoError::corrupt("envelope id", e))?;

                Ok(Roll {
                    id: RollId::new(id),
                    session_id,
                    player: PlayerName::new(name).map_err(|e| RepoError::corrupt("player name", e))?,
                    envelope_id: EnvelopeId::from_uuid(envelope_id),
                    results: DiceResults::new(results.remove(&id).unwrap_or_default())
                        .map_err(|e| RepoError::corrupt("dice results", e))?,
                    total: row.get("total"),
                    rolled_at: parse_db_timestamp(&rolled_at)?,
                })
            })
            .collect()
    }
}
