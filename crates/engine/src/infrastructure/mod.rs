//! Adapters behind the engine's ports: SQLite storage, command queues,
//! clock and environment configuration.

pub mod clock;
pub mod config;
pub mod persistence;
pub mod ports;
pub mod queues;
