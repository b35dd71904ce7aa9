//! Command Producer
//!
//! Runs inline on the request path. A roll is only published while a session
//! is current; the envelope is stamped with that session id so that the
//! dispatcher never has to guess which session a roll belongs to.

use std::sync::Arc;

use percent_encoding::percent_decode_str;

use dicelog_domain::{
    Command, CommandKind, DiceResults, EndSessionCommand, EnvelopeId, PlayerName, RollCommand,
};
use dicelog_shared::RollRequest;

use crate::infrastructure::ports::QueueError;
use crate::use_cases::session::SessionCoordinator;

use super::CommandQueues;

/// Why a roll body could not be turned into a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("Invalid JSON")]
    InvalidJson,
    #[error("Missing required fields")]
    MissingFields,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("No active session")]
    NoActiveSession,
    #[error(transparent)]
    MalformedPayload(#[from] PayloadError),
    #[error("Queue unavailable: {0}")]
    BrokerUnavailable(#[source] QueueError),
    #[error("Failed to encode command: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct CommandProducer {
    coordinator: Arc<SessionCoordinator>,
    queues: CommandQueues,
}

impl CommandProducer {
    pub fn new(coordinator: Arc<SessionCoordinator>, queues: CommandQueues) -> Self {
        Self {
            coordinator,
            queues,
        }
    }

    /// Validate and publish a command of type `kind`.
    ///
    /// Returns once the envelope is durably queued; the command itself is
    /// applied later by the dispatcher.
    pub async fn submit(&self, kind: CommandKind, raw: &str) -> Result<EnvelopeId, SubmitError> {
        match kind {
            CommandKind::Roll => self.submit_roll(raw).await,
            CommandKind::EndSession => self.submit_end_session().await,
        }
    }

    pub async fn submit_roll(&self, raw: &str) -> Result<EnvelopeId, SubmitError> {
        let Some(session_id) = self.coordinator.current_session_id().await else {
            tracing::warn!("Rejected roll: no active session");
            return Err(SubmitError::NoActiveSession);
        };

        let request = parse_roll_body(raw).inspect_err(|e| {
            tracing::warn!(session_id = %session_id, error = %e, "Rejected roll");
        })?;

        let player = PlayerName::new(request.player).map_err(|_| PayloadError::MissingFields)?;
        let results = DiceResults::new(request.results).map_err(|_| PayloadError::MissingFields)?;
        match results.checked_sum() {
            Some(sum) if sum != request.total => tracing::debug!(
                player = %player,
                total = request.total,
                sum,
                "Reported total differs from the sum of results"
            ),
            Some(_) => {}
            None => tracing::debug!(
                player = %player,
                total = request.total,
                "Sum of results overflows"
            ),
        }

        let command = RollCommand {
            session_id,
            player,
            results,
            total: request.total,
        };
        self.publish(Command::Roll(command)).await
    }

    pub async fn submit_end_session(&self) -> Result<EnvelopeId, SubmitError> {
        let command = EndSessionCommand {
            session_id: self.coordinator.current_session_id().await,
        };
        self.publish(Command::EndSession(command)).await
    }

    async fn publish(&self, command: Command) -> Result<EnvelopeId, SubmitError> {
        let kind = command.kind();
        let payload = command.encode_payload()?;

        let envelope_id = self
            .queues
            .get(kind)
            .publish(&payload)
            .await
            .map_err(|e| {
                tracing::error!(queue = %kind, error = %e, "Failed to publish command");
                SubmitError::BrokerUnavailable(e)
            })?;

        tracing::debug!(queue = %kind, envelope_id = %envelope_id, "Command queued");
        Ok(envelope_id)
    }
}

/// Parse a roll body that is either plain JSON or percent-encoded JSON.
fn parse_roll_body(raw: &str) -> Result<RollRequest, PayloadError> {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => {
            let decoded = percent_decode_str(raw)
                .decode_utf8()
                .map_err(|_| PayloadError::InvalidJson)?;
            serde_json::from_str(&decoded).map_err(|_| PayloadError::InvalidJson)?
        }
    };

    serde_json::from_value(value).map_err(|_| PayloadError::MissingFields)
}
