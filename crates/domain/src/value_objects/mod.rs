//! Value objects - Immutable objects defined by their attributes

mod dice;
mod names;
mod queue_data;
mod stats;

pub use dice::DiceResults;
pub use names::PlayerName;
pub use queue_data::{Command, CommandKind, EndSessionCommand, RollCommand};
pub use stats::{
    CriticalCounts, PlayerAverage, SessionAverage, StatsScope, CRITICAL_FAILURE_MAX,
    CRITICAL_FAILURE_MIN, CRITICAL_SUCCESS_MAX, CRITICAL_SUCCESS_MIN,
};
