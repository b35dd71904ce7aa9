//! Queue factory - Creates queue instances based on configuration
//!
//! The backend is picked at start-up from `QueueConfig::backend`. Both
//! backends implement `QueuePort`, so callers only ever hold
//! `Arc<dyn QueuePort>`.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use dicelog_domain::CommandKind;

use crate::infrastructure::config::QueueConfig;
use crate::infrastructure::ports::{ClockPort, QueuePort};
use crate::infrastructure::queues::{InMemoryQueue, InProcessNotifier, SqliteQueue};

/// Queue factory for creating queue instances
pub struct QueueFactory {
    config: QueueConfig,
    clock: Arc<dyn ClockPort>,
    sqlite_pool: Option<SqlitePool>,
    // One notifier per queue
    roll_notifier: InProcessNotifier,
    end_session_notifier: InProcessNotifier,
}

impl QueueFactory {
    /// Create a new queue factory
    pub async fn new(config: QueueConfig, clock: Arc<dyn ClockPort>) -> Result<Self> {
        let sqlite_pool = if config.backend == "sqlite" {
            // Ensure data directory exists
            if let Some(parent) = std::path::Path::new(&config.sqlite_path).parent() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create queue database directory")?;
            }

            let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.sqlite_path))
                .await
                .context("Failed to connect to SQLite queue database")?;
            tracing::info!("Connected to SQLite queue database: {}", config.sqlite_path);
            Some(pool)
        } else {
            None
        };

        Ok(Self {
            config,
            clock,
            sqlite_pool,
            roll_notifier: InProcessNotifier::new(CommandKind::Roll),
            end_session_notifier: InProcessNotifier::new(CommandKind::EndSession),
        })
    }

    /// Get the notifier shared by every handle on the `kind` queue
    pub fn notifier(&self, kind: CommandKind) -> InProcessNotifier {
        match kind {
            CommandKind::Roll => self.roll_notifier.clone(),
            CommandKind::EndSession => self.end_session_notifier.clone(),
        }
    }

    /// Create the durable queue for one command type
    pub async fn create(&self, kind: CommandKind) -> Result<Arc<dyn QueuePort>> {
        let notifier = self.notifier(kind);
        let max_attempts = self.config.max_attempts;

        match self.config.backend.as_str() {
            "memory" => {
                tracing::warn!(queue = %kind, "Using in-memory queue; commands will not survive a restart");
                Ok(Arc::new(InMemoryQueue::new(
                    kind,
                    max_attempts,
                    notifier,
                    self.clock.clone(),
                )))
            }
            "sqlite" => {
                let pool = self
                    .sqlite_pool
                    .as_ref()
                    .context("SQLite pool not initialized")?;
                let queue =
                    SqliteQueue::new(pool.clone(), kind, max_attempts, notifier, self.clock.clone())
                        .await
                        .with_context(|| format!("Failed to open {} queue", kind))?;
                Ok(Arc::new(queue))
            }
            backend => anyhow::bail!("Unsupported queue backend: {}", backend),
        }
    }

    /// Close the queue database, if any
    pub async fn close(&self) {
        if let Some(pool) = &self.sqlite_pool {
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::clock::SystemClock;

    fn config(backend: &str, sqlite_path: String) -> QueueConfig {
        QueueConfig {
            backend: backend.to_string(),
            sqlite_path,
            max_attempts: 3,
            retry_base_delay_ms: 0,
            retry_max_delay_ms: 0,
            retry_jitter: 0.0,
            recovery_poll_interval_seconds: 1,
        }
    }

    #[tokio::test]
    async fn sqlite_backend_creates_database_directory() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("queues.db");
        let factory = QueueFactory::new(
            config("sqlite", path.display().to_string()),
            Arc::new(SystemClock),
        )
        .await
        .expect("factory");

        let queue = factory.create(CommandKind::Roll).await.expect("queue");
        assert_eq!(queue.kind(), CommandKind::Roll);
        let envelope_id = queue.publish("{}").await.expect("publish");
        let envelope = queue.receive().await.expect("receive").expect("envelope");
        assert_eq!(envelope.id, envelope_id);
        assert_eq!(envelope.max_attempts, 3);
        assert!(path.exists());

        factory.close().await;
    }

    #[tokio::test]
    async fn memory_backend_needs_no_database() {
        let factory = QueueFactory::new(
            config("memory", "/nonexistent/queues.db".into()),
            Arc::new(SystemClock),
        )
        .await
        .expect("factory");
        let queue = factory.create(CommandKind::EndSession).await.expect("queue");
        assert_eq!(queue.depth().await.expect("depth"), 0);
    }

    #[tokio::test]
    async fn unknown_backend_is_rejected() {
        let factory = QueueFactory::new(config("rabbitmq", String::new()), Arc::new(SystemClock))
            .await
            .expect("factory");
        assert!(factory.create(CommandKind::Roll).await.is_err());
    }
}
