//! Session Coordinator
//!
//! Owns "the currently open session". Producers read it to stamp roll
//! commands; `start_session` and `end_session` are the only writers and are
//! serialized by a transition lock held across the durable write, so the
//! in-memory pointer always agrees with the order in which sessions were
//! stored.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use dicelog_domain::SessionId;

use crate::infrastructure::ports::{ClockPort, RepoError, SessionRepo};

/// What `end_session` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndSessionOutcome {
    Ended(SessionId),
    /// No session was ever started.
    NoSession,
    /// The latest session had already been ended.
    AlreadyEnded(SessionId),
    /// The command targeted a session that is no longer the latest one.
    /// The latest session is left alone; `closed_expected` tells whether the
    /// targeted session was still open and got closed.
    Superseded {
        expected: SessionId,
        latest: SessionId,
        closed_expected: bool,
    },
}

pub struct SessionCoordinator {
    sessions: Arc<dyn SessionRepo>,
    clock: Arc<dyn ClockPort>,
    current: RwLock<Option<SessionId>>,
    transition: Mutex<()>,
}

impl SessionCoordinator {
    pub fn new(sessions: Arc<dyn SessionRepo>, clock: Arc<dyn ClockPort>) -> Self {
        Self {
            sessions,
            clock,
            current: RwLock::new(None),
            transition: Mutex::new(()),
        }
    }

    /// Reload the current session from storage after a restart.
    ///
    /// Only the most recently started session can be current, and only while
    /// it is still open.
    pub async fn restore(&self) -> Result<Option<SessionId>, SessionCoordinatorError> {
        let _transition = self.transition.lock().await;

        let restored = self
            .sessions
            .latest_session()
            .await?
            .filter(|session| session.is_open())
            .map(|session| session.id);

        *self.current.write().await = restored;

        match restored {
            Some(id) => tracing::info!(session_id = %id, "Restored open session"),
            None => tracing::info!("No open session to restore"),
        }
        Ok(restored)
    }

    /// Store a new session and make it current.
    pub async fn start_session(&self) -> Result<SessionId, SessionCoordinatorError> {
        let _transition = self.transition.lock().await;

        let session = self.sessions.start_session(self.clock.now()).await?;
        let previous = self.current.write().await.replace(session.id);

        if let Some(previous) = previous {
            tracing::warn!(
                session_id = %session.id,
                previous_session_id = %previous,
                "Started session while another was still open"
            );
        } else {
            tracing::info!(session_id = %session.id, "Session started");
        }
        Ok(session.id)
    }

    /// End the most recently started session.
    ///
    /// With `expected` set, the latest session is only ended if it is that
    /// session. Otherwise only `expected` itself is closed, if still open.
    pub async fn end_session(
        &self,
        expected: Option<SessionId>,
    ) -> Result<EndSessionOutcome, SessionCoordinatorError> {
        let _transition = self.transition.lock().await;

        let Some(latest) = self.sessions.latest_session().await? else {
            tracing::info!("End session requested but no session exists");
            return Ok(EndSessionOutcome::NoSession);
        };

        if let Some(expected) = expected.filter(|expected| *expected != latest.id) {
            let closed_expected = self
                .sessions
                .end_open_session(expected, self.clock.now())
                .await?
                .is_some();
            tracing::warn!(
                session_id = %expected,
                latest_session_id = %latest.id,
                closed_expected,
                "End targeted a session that is no longer the latest, latest left open"
            );
            return Ok(EndSessionOutcome::Superseded {
                expected,
                latest: latest.id,
                closed_expected,
            });
        }

        if !latest.is_open() {
            tracing::info!(session_id = %latest.id, "Session already ended");
            return Ok(EndSessionOutcome::AlreadyEnded(latest.id));
        }

        let outcome = match self.sessions.end_latest_session(self.clock.now()).await? {
            Some(ended) => EndSessionOutcome::Ended(ended.id),
            None => EndSessionOutcome::AlreadyEnded(latest.id),
        };

        if let EndSessionOutcome::Ended(id) = outcome {
            let mut current = self.current.write().await;
            if *current == Some(id) {
                *current = None;
            }
            tracing::info!(session_id = %id, "Session ended");
        }
        Ok(outcome)
    }

    pub async fn current_session_id(&self) -> Option<SessionId> {
        *self.current.read().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionCoordinatorError {
    #[error("Persistence error: {0}")]
    Repo(#[from] RepoError),
}
