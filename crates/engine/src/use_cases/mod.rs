//! Use cases - User story orchestration.
//!
//! Each module contains use cases for a specific domain area.

pub mod commands;
pub mod session;

pub use commands::{CommandDispatcher, CommandProducer, CommandQueues};
pub use session::SessionCoordinator;
