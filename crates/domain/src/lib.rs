//! Domain model for dice roll logging: sessions, players, rolls and the
//! commands that mutate them.

pub mod entities;
pub mod error;
pub mod ids;
pub mod value_objects;

pub use entities::{Player, RecordOutcome, Roll, Session};
pub use error::DomainError;
pub use ids::{EnvelopeId, PlayerId, RollId, SessionId};
pub use value_objects::{
    Command, CommandKind, CriticalCounts, DiceResults, EndSessionCommand, PlayerAverage,
    PlayerName, RollCommand, SessionAverage, StatsScope, CRITICAL_FAILURE_MAX,
    CRITICAL_FAILURE_MIN, CRITICAL_SUCCESS_MAX, CRITICAL_SUCCESS_MIN,
};
