//! Roll entity - One recorded dice roll
//!
//! `total` is stored exactly as the client reported it; it is not
//! recomputed from `results`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EnvelopeId, RollId, SessionId};
use crate::value_objects::{DiceResults, PlayerName};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roll {
    pub id: RollId,
    pub session_id: SessionId,
    pub player: PlayerName,
    /// Envelope that produced this row
    pub envelope_id: EnvelopeId,
    pub results: DiceResults,
    pub total: i64,
    pub rolled_at: DateTime<Utc>,
}

/// Result of applying a roll command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded(RollId),
    /// The envelope was already applied by an earlier delivery.
    Duplicate,
}
