//! Application state and composition.

use std::sync::Arc;

use crate::infrastructure::{
    config::AppConfig,
    ports::{ClockPort, RollRepo, SessionRepo, StatsRepo},
};
use crate::use_cases::commands::RetryPolicy;
use crate::use_cases::{CommandDispatcher, CommandProducer, CommandQueues, SessionCoordinator};

/// Main application state.
///
/// Passed to HTTP handlers via Axum state and shared with the queue workers.
pub struct App {
    pub config: AppConfig,
    pub repositories: Repositories,
    pub queues: CommandQueues,
    pub coordinator: Arc<SessionCoordinator>,
    pub producer: Arc<CommandProducer>,
    pub dispatcher: Arc<CommandDispatcher>,
}

/// Persistence gateway ports.
pub struct Repositories {
    pub sessions: Arc<dyn SessionRepo>,
    pub rolls: Arc<dyn RollRepo>,
    pub stats: Arc<dyn StatsRepo>,
}

impl App {
    pub fn new(
        config: AppConfig,
        repositories: Repositories,
        queues: CommandQueues,
        clock: Arc<dyn ClockPort>,
    ) -> Self {
        let coordinator = Arc::new(SessionCoordinator::new(
            repositories.sessions.clone(),
            clock.clone(),
        ));
        let producer = Arc::new(CommandProducer::new(coordinator.clone(), queues.clone()));
        let dispatcher = Arc::new(CommandDispatcher::new(
            coordinator.clone(),
            repositories.rolls.clone(),
            clock,
            RetryPolicy::from_config(&config.queue),
        ));

        Self {
            config,
            repositories,
            queues,
            coordinator,
            producer,
            dispatcher,
        }
    }

    /// Bring in-memory state back in line with storage after a restart.
    ///
    /// Must run before any worker is started: it restores the current
    /// session and returns every unacknowledged delivery to its queue.
    pub async fn recover(&self) -> anyhow::Result<()> {
        self.coordinator.restore().await?;

        for queue in self.queues.all() {
            let recovered = queue.recover_unacked().await?;
            if recovered > 0 {
                tracing::warn!(
                    queue = %queue.kind(),
                    recovered,
                    "Redelivering commands left unacknowledged by the last run"
                );
            }
        }
        Ok(())
    }
}
