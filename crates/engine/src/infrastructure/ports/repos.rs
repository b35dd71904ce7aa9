//! Repository port traits for database access.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dicelog_domain::{
    CriticalCounts, EnvelopeId, Player, PlayerAverage, PlayerName, RecordOutcome, Roll,
    RollCommand, Session, SessionAverage, SessionId, StatsScope,
};

use super::error::RepoError;

// =============================================================================
// Sessions
// =============================================================================

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionRepo: Send + Sync {
    /// Insert a new open session. Ids increase monotonically.
    async fn start_session(&self, started_at: DateTime<Utc>) -> Result<Session, RepoError>;

    /// Most recently started session, open or not.
    async fn latest_session(&self) -> Result<Option<Session>, RepoError>;

    /// Close the most recently started session if it is still open.
    ///
    /// Returns the closed session, or `None` when there is no session or the
    /// latest one is already closed.
    async fn end_latest_session(
        &self,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<Session>, RepoError>;

    /// Close session `id` if it is still open.
    ///
    /// Returns the closed session, or `None` when it does not exist or was
    /// already closed.
    async fn end_open_session(
        &self,
        id: SessionId,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<Session>, RepoError>;

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, RepoError>;
}

// =============================================================================
// Rolls
// =============================================================================

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RollRepo: Send + Sync {
    async fn get_or_create_player(&self, name: &PlayerName) -> Result<Player, RepoError>;

    /// Record a roll and its individual results in one transaction.
    ///
    /// `envelope_id` is the idempotency key: a second call with the same id
    /// writes nothing and returns `RecordOutcome::Duplicate`.
    async fn record_roll(
        &self,
        envelope_id: EnvelopeId,
        roll: &RollCommand,
        recorded_at: DateTime<Utc>,
    ) -> Result<RecordOutcome, RepoError>;

    /// Rolls of a session in the order they were recorded.
    async fn list_session_rolls(&self, session_id: SessionId) -> Result<Vec<Roll>, RepoError>;
}

// =============================================================================
// Statistics (read side)
// =============================================================================

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatsRepo: Send + Sync {
    /// Average total per session, ordered by session id. Sessions without
    /// rolls are included with no average.
    async fn average_by_session(
        &self,
        split_by_player: bool,
    ) -> Result<Vec<SessionAverage>, RepoError>;

    /// Average total per player, lowest average first.
    async fn average_by_player(&self, scope: StatsScope) -> Result<Vec<PlayerAverage>, RepoError>;

    async fn critical_rolls_by_player(
        &self,
        scope: StatsScope,
    ) -> Result<Vec<CriticalCounts>, RepoError>;
}
