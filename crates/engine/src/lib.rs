//! Dicelog Engine library.
//!
//! Ingests dice rolls from the game client, queues them durably and applies
//! them to SQLite through a single ordered worker per command type.
//!
//! ## Structure
//!
//! - `use_cases/` - Session coordination, command producer and dispatcher
//! - `infrastructure/` - Ports, SQLite persistence, durable queues, config
//! - `api/` - HTTP entry points
//! - `app` - Application composition

pub mod api;
pub mod app;
pub mod infrastructure;
pub mod use_cases;

pub use app::App;
