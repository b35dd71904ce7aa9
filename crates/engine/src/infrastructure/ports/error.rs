//! Error types for port operations.

use dicelog_domain::SessionId;

/// Persistence gateway failures.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// The SQLite call itself failed; `operation` names the repository method.
    #[error("Database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },

    /// A stored row no longer decodes into its domain type.
    #[error("Corrupt {what} in storage: {message}")]
    Corrupt { what: &'static str, message: String },

    /// A roll was written against a session that was never stored.
    #[error("Session {0} does not exist")]
    UnknownSession(SessionId),
}

impl RepoError {
    pub fn database(operation: &'static str, message: impl ToString) -> Self {
        Self::Database {
            operation,
            message: message.to_string(),
        }
    }

    pub fn corrupt(what: &'static str, message: impl ToString) -> Self {
        Self::Corrupt {
            what,
            message: message.to_string(),
        }
    }
}

/// Durable queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Envelope not found: {0}")]
    NotFound(String),

    /// The delivery being settled is no longer the live one (already settled,
    /// recovered after a restart, or redelivered since).
    #[error("Stale delivery of envelope {envelope_id} (attempt {attempt})")]
    StaleDelivery { envelope_id: String, attempt: u32 },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Backend error: {0}")]
    Backend(String),
}
