//! Port traits for infrastructure boundaries.
//!
//! These are the only abstractions in the engine. Ports exist for:
//! - Database access (sessions, rolls, statistics)
//! - Durable command queues (could swap SQLite -> a real broker)
//! - Clock (for testing)

mod error;
mod queue;
mod repos;
mod testing;

pub use error::{QueueError, RepoError};
pub use queue::{
    DeliveryTag, Envelope, QueueItemStatus, QueueNotificationPort, QueuePort, WaitResult,
};
pub use repos::{RollRepo, SessionRepo, StatsRepo};
pub use testing::ClockPort;

#[cfg(test)]
pub use queue::MockQueuePort;
#[cfg(test)]
pub use repos::{MockRollRepo, MockSessionRepo, MockStatsRepo};
#[cfg(test)]
pub use testing::MockClockPort;
