//! Session use cases.
//!
//! Tracks which session is current and serializes its transitions.

mod coordinator;

pub use coordinator::{EndSessionOutcome, SessionCoordinator, SessionCoordinatorError};
