//! Response bodies returned by the engine's HTTP surface

use serde::{Deserialize, Serialize};

// Aggregate rows are serialized as-is
pub use dicelog_domain::{CriticalCounts, PlayerAverage, SessionAverage};
use dicelog_domain::Roll;

/// `{"status": "success"}` / `{"status": "queued"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn success() -> Self {
        Self {
            status: "success".to_string(),
        }
    }

    pub fn queued() -> Self {
        Self {
            status: "queued".to_string(),
        }
    }
}

/// Body of a successful `POST /start_session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartedResponse {
    pub status: String,
    pub session_id: i64,
}

impl SessionStartedResponse {
    pub fn new(session_id: i64) -> Self {
        Self {
            status: "success".to_string(),
            session_id,
        }
    }
}

/// `{"error": "..."}` returned for every rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentSessionResponse {
    pub session_id: Option<i64>,
}

/// One recorded roll as listed by `GET /api/sessions/{id}/rolls`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollDto {
    pub id: i64,
    pub player: String,
    pub results: Vec<i64>,
    pub total: i64,
    /// RFC 3339 timestamp
    pub rolled_at: String,
}

impl From<Roll> for RollDto {
    fn from(roll: Roll) -> Self {
        Self {
            id: roll.id.get(),
            player: roll.player.into(),
            results: roll.results.into(),
            total: roll.total,
            rolled_at: roll.rolled_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRollsResponse {
    pub session_id: i64,
    pub start_time: String,
    pub end_time: Option<String>,
    pub rolls: Vec<RollDto>,
}

/// Depth and dead-letter count of one command queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue: String,
    pub depth: usize,
    pub dead_letters: usize,
}

/// One dead-lettered command, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterDto {
    pub id: String,
    pub payload: String,
    pub attempts: u32,
    pub error: Option<String>,
    /// RFC 3339 timestamp of the last settlement
    pub failed_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeueResponse {
    pub requeued: usize,
}
