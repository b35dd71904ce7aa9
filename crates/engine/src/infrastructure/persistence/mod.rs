//! SQLite persistence adapters
//!
//! The persistence gateway: sessions, players, rolls and the statistics
//! queries over them.

mod connection;
mod roll_repository;
mod session_repository;
mod stats_repository;

pub use connection::{connect, ensure_schema};
pub use roll_repository::SqliteRollRepo;
pub use session_repository::SqliteSessionRepo;
pub use stats_repository::SqliteStatsRepo;

pub(crate) use connection::{parse_db_timestamp, to_db_timestamp};

#[cfg(test)]
pub(crate) use connection::test_pool;
