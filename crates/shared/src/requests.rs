//! Request bodies sent by the game client

use serde::{Deserialize, Serialize};

/// Body of `POST /roll`.
///
/// All three fields are required. Extra fields sent by newer clients are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollRequest {
    pub player: String,
    pub results: Vec<i64>,
    pub total: i64,
}

/// Query string of the per-player stats endpoints (`?session=all|last|<id>`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsScopeQuery {
    #[serde(default)]
    pub session: Option<String>,
}

/// Query string of `GET /api/stats/sessions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStatsQuery {
    #[serde(default)]
    pub by_player: bool,
}

/// Query string of `GET /api/queues/{queue}/dead_letters`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}
