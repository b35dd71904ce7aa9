//! Durable command queue port.
//!
//! One `QueuePort` instance per `CommandKind`. Delivery is at-least-once:
//! an envelope stays in the queue until it is acked, and an envelope that was
//! delivered but never settled (crash, shutdown) is handed out again after
//! `recover_unacked`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use dicelog_domain::{CommandKind, EnvelopeId};

use super::error::QueueError;

/// Status of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    /// Delivered to the worker, not yet settled
    Processing,
    /// Nacked, redeliverable once `scheduled_at` has passed
    Delayed,
    /// Retry bound exceeded or undecodable; never redelivered automatically
    DeadLetter,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::Processing => "processing",
            QueueItemStatus::Delayed => "delayed",
            QueueItemStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Result<Self, QueueError> {
        match s {
            "pending" => Ok(QueueItemStatus::Pending),
            "processing" => Ok(QueueItemStatus::Processing),
            "delayed" => Ok(QueueItemStatus::Delayed),
            "dead_letter" => Ok(QueueItemStatus::DeadLetter),
            other => Err(QueueError::Backend(format!("Unknown queue status: {}", other))),
        }
    }
}

/// A command in flight between producer and dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub kind: CommandKind,
    pub payload_json: String,
    pub status: QueueItemStatus,
    /// Number of deliveries so far, including the current one
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Envelope {
    pub fn delivery_tag(&self) -> DeliveryTag {
        DeliveryTag {
            envelope_id: self.id,
            attempt: self.attempts,
        }
    }

    /// True once this delivery is the last one the retry bound allows.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Identifies one delivery of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub envelope_id: EnvelopeId,
    pub attempt: u32,
}

/// Result of waiting for work notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Worker was notified of new work
    Notified,
    /// Timeout expired (periodic recovery check)
    Timeout,
}

/// Port for queue work notifications
#[async_trait]
pub trait QueueNotificationPort: Send + Sync + Clone {
    /// Signal that new work is available on this queue
    async fn notify_work_available(&self);

    /// Wait for new work notification or timeout
    async fn wait_for_work(&self, timeout: Duration) -> WaitResult;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueuePort: Send + Sync {
    /// Command type carried by this queue.
    fn kind(&self) -> CommandKind;

    /// Durably store a new envelope. Returns once the write has committed.
    async fn publish(&self, payload_json: &str) -> Result<EnvelopeId, QueueError>;

    /// Claim the oldest ready envelope and mark it processing.
    async fn receive(&self) -> Result<Option<Envelope>, QueueError>;

    /// Settle a delivery as applied; the envelope is removed.
    async fn ack(&self, tag: &DeliveryTag) -> Result<(), QueueError>;

    /// Settle a delivery as failed; redeliverable from `retry_at`.
    async fn nack(
        &self,
        tag: &DeliveryTag,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Settle a delivery as permanently failed.
    async fn dead_letter(&self, tag: &DeliveryTag, error: &str) -> Result<(), QueueError>;

    /// Return a delivery that could not be settled to pending, so the head
    /// of the queue is delivered again. `attempts` is kept.
    async fn release(&self, tag: &DeliveryTag) -> Result<(), QueueError>;

    /// Return every processing envelope to pending. Called at start-up before
    /// any worker runs, and by the queue's own worker when a release failed.
    async fn recover_unacked(&self) -> Result<usize, QueueError>;

    /// Envelopes waiting for delivery (pending or delayed).
    async fn depth(&self) -> Result<usize, QueueError>;

    async fn dead_letter_count(&self) -> Result<usize, QueueError>;

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<Envelope>, QueueError>;

    /// Move every dead-lettered envelope back to pending with attempts reset.
    async fn requeue_dead_letters(&self) -> Result<usize, QueueError>;

    /// Wait until new work is published or `timeout` elapses.
    async fn wait_for_work(&self, timeout: Duration) -> WaitResult;
}
