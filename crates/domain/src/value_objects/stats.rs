//! Read-side aggregate rows over recorded rolls.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DomainError;
use crate::ids::SessionId;

/// Totals at or below this bound (and >= `CRITICAL_SUCCESS_MIN`) are critical successes (3d6).
pub const CRITICAL_SUCCESS_MIN: i64 = 3;
pub const CRITICAL_SUCCESS_MAX: i64 = 4;
/// Totals in `CRITICAL_FAILURE_MIN..=CRITICAL_FAILURE_MAX` are critical failures (3d6).
pub const CRITICAL_FAILURE_MIN: i64 = 17;
pub const CRITICAL_FAILURE_MAX: i64 = 18;

/// Which sessions a statistic is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatsScope {
    #[default]
    All,
    /// The most recently started session.
    LastSession,
    Session(SessionId),
}

impl FromStr for StatsScope {
    type Err = DomainError;

    /// Accepts `all`, `last` or a numeric session id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(Self::All),
            "last" => Ok(Self::LastSession),
            other => other
                .parse::<i64>()
                .map(|id| Self::Session(SessionId::new(id)))
                .map_err(|_| DomainError::parse(format!("Unknown session scope: {}", s))),
        }
    }
}

impl fmt::Display for StatsScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::LastSession => write!(f, "last"),
            Self::Session(id) => write!(f, "{}", id),
        }
    }
}

/// Average roll total for one session, optionally split per player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAverage {
    pub session_id: SessionId,
    /// Present only when the statistic is split by player.
    pub player: Option<String>,
    /// `None` for sessions without any rolls.
    pub average_total: Option<f64>,
}

/// Average roll total for one player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerAverage {
    pub player: String,
    pub average_total: f64,
}

/// Count of critical successes and failures for one player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalCounts {
    pub player: String,
    pub critical_success: i64,
    pub critical_failure: i64,
}
