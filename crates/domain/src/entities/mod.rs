//! Domain entities - Core business objects with identity

mod player;
mod roll;
mod session;

pub use player::Player;
pub use roll::{RecordOutcome, Roll};
pub use session::Session;
