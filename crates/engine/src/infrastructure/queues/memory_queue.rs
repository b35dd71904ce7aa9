//! In-memory queue implementation for development and testing
//!
//! Same delivery semantics as `SqliteQueue` (head-of-line FIFO, delivery
//! tags, dead letters) over a `Vec`. Nothing survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use dicelog_domain::{CommandKind, EnvelopeId};

use crate::infrastructure::ports::{
    ClockPort, DeliveryTag, Envelope, QueueError, QueueItemStatus, QueueNotificationPort,
    QueuePort, WaitResult,
};

/// In-memory queue implementation
pub struct InMemoryQueue<N: QueueNotificationPort> {
    /// Kept in publish order
    items: Arc<RwLock<Vec<Envelope>>>,
    kind: CommandKind,
    max_attempts: u32,
    notifier: N,
    clock: Arc<dyn ClockPort>,
}

impl<N: QueueNotificationPort> InMemoryQueue<N> {
    pub fn new(
        kind: CommandKind,
        max_attempts: u32,
        notifier: N,
        clock: Arc<dyn ClockPort>,
    ) -> Self {
        Self {
            items: Arc::new(RwLock::new(Vec::new())),
            kind,
            max_attempts,
            notifier,
            clock,
        }
    }

    /// Get the notifier for this queue
    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Find the in-flight delivery named by `tag`.
    fn settle_target<'a>(
        items: &'a mut [Envelope],
        tag: &DeliveryTag,
    ) -> Result<&'a mut Envelope, QueueError> {
        let item = items
            .iter_mut()
            .find(|item| item.id == tag.envelope_id)
            .ok_or_else(|| QueueError::NotFound(tag.envelope_id.to_string()))?;

        if item.status != QueueItemStatus::Processing || item.attempts != tag.attempt {
            return Err(QueueError::StaleDelivery {
                envelope_id: tag.envelope_id.to_string(),
                attempt: tag.attempt,
            });
        }
        Ok(item)
    }

    async fn count_where(&self, pred: impl Fn(QueueItemStatus) -> bool) -> usize {
        let items = self.items.read().await;
        items.iter().filter(|item| pred(item.status)).count()
    }
}

#[async_trait]
impl<N: QueueNotificationPort + 'static> QueuePort for InMemoryQueue<N> {
    fn kind(&self) -> CommandKind {
        self.kind
    }

    async fn publish(&self, payload_json: &str) -> Result<EnvelopeId, QueueError> {
        let now = self.clock.now();
        let envelope = Envelope {
            id: EnvelopeId::new(),
            kind: self.kind,
            payload_json: payload_json.to_string(),
            status: QueueItemStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            error_message: None,
        };
        let id = envelope.id;

        let mut items = self.items.write().await;
        items.push(envelope);
        drop(items); // Release the lock before notifying

        self.notifier.notify_work_available().await;

        Ok(id)
    }

    async fn receive(&self) -> Result<Option<Envelope>, QueueError> {
        let now = self.clock.now();
        let mut items = self.items.write().await;

        let Some(head) = items
            .iter_mut()
            .find(|item| item.status != QueueItemStatus::DeadLetter)
        else {
            return Ok(None);
        };

        let ready = match head.status {
            QueueItemStatus::Pending => true,
            QueueItemStatus::Delayed => !matches!(head.scheduled_at, Some(at) if at > now),
            QueueItemStatus::Processing | QueueItemStatus::DeadLetter => false,
        };
        if !ready {
            return Ok(None);
        }

        head.status = QueueItemStatus::Processing;
        head.attempts += 1;
        head.updated_at = now;
        Ok(Some(head.clone()))
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
        let mut items = self.items.write().await;
        Self::settle_target(&mut items, tag)?;
        items.retain(|item| item.id != tag.envelope_id);
        drop(items);

        self.notifier.notify_work_available().await;
        Ok(())
    }

    async fn nack(
        &self,
        tag: &DeliveryTag,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut items = self.items.write().await;
        let item = Self::settle_target(&mut items, tag)?;
        item.status = QueueItemStatus::Delayed;
        item.scheduled_at = Some(retry_at);
        item.error_message = Some(error.to_string());
        item.updated_at = now;
        Ok(())
    }

    async fn dead_letter(&self, tag: &DeliveryTag, error: &str) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut items = self.items.write().await;
        let item = Self::settle_target(&mut items, tag)?;
        item.status = QueueItemStatus::DeadLetter;
        item.scheduled_at = None;
        item.error_message = Some(error.to_string());
        item.updated_at = now;
        drop(items);

        self.notifier.notify_work_available().await;
        Ok(())
    }

    async fn release(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut items = self.items.write().await;
        let item = Self::settle_target(&mut items, tag)?;
        item.status = QueueItemStatus::Pending;
        item.updated_at = now;
        drop(items);

        self.notifier.notify_work_available().await;
        Ok(())
    }

    async fn recover_unacked(&self) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let mut items = self.items.write().await;
        let mut recovered = 0;
        for item in items
            .iter_mut()
            .filter(|item| item.status == QueueItemStatus::Processing)
        {
            item.status = QueueItemStatus::Pending;
            item.updated_at = now;
            recovered += 1;
        }
        drop(items);

        if recovered > 0 {
            self.notifier.notify_work_available().await;
        }
        Ok(recovered)
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        Ok(self
            .count_where(|status| {
                matches!(status, QueueItemStatus::Pending | QueueItemStatus::Delayed)
            })
            .await)
    }

    async fn dead_letter_count(&self) -> Result<usize, QueueError> {
        Ok(self
            .count_where(|status| status == QueueItemStatus::DeadLetter)
            .await)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<Envelope>, QueueError> {
        let items = self.items.read().await;
        Ok(items
            .iter()
            .filter(|item| item.status == QueueItemStatus::DeadLetter)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn requeue_dead_letters(&self) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let mut items = self.items.write().await;
        let mut requeued = 0;
        for item in items
            .iter_mut()
            .filter(|item| item.status == QueueItemStatus::DeadLetter)
        {
            item.status = QueueItemStatus::Pending;
            item.attempts = 0;
            item.scheduled_at = None;
            item.updated_at = now;
            requeued += 1;
        }
        drop(items);

        if requeued > 0 {
            self.notifier.notify_work_available().await;
        }
        Ok(requeued)
    }

    async fn wait_for_work(&self, timeout: Duration) -> WaitResult {
        self.notifier.wait_for_work(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::queues::InProcessNotifier;
    use chrono::TimeZone;

    fn queue(max_attempts: u32) -> (Arc<ManualClock>, InMemoryQueue<InProcessNotifier>) {
        let start = Utc
            .with_ymd_and_hms(2024, 3, 1, 20, 0, 0)
            .single()
            .expect("valid date");
        let clock = Arc::new(ManualClock::new(start));
        let queue = InMemoryQueue::new(
            CommandKind::EndSession,
            max_attempts,
            InProcessNotifier::new(CommandKind::EndSession),
            clock.clone(),
        );
        (clock, queue)
    }

    #[tokio::test]
    async fn publish_wakes_a_waiting_worker() {
        let (_, queue) = queue(5);
        queue.publish("{}").await.expect("publish");
        assert_eq!(
            queue.wait_for_work(Duration::from_secs(5)).await,
            WaitResult::Notified
        );
    }

    #[tokio::test]
    async fn delayed_head_holds_back_the_queue() {
        let (clock, queue) = queue(5);
        let a = queue.publish(r#""a""#).await.expect("publish");
        let b = queue.publish(r#""b""#).await.expect("publish");

        let first = queue.receive().await.expect("receive").expect("envelope");
        assert_eq!(first.id, a);
        let retry_at = clock.now() + chrono::Duration::milliseconds(500);
        queue
            .nack(&first.delivery_tag(), "boom", retry_at)
            .await
            .expect("nack");
        assert!(queue.receive().await.expect("receive").is_none());

        clock.advance(chrono::Duration::milliseconds(500));
        let retried = queue.receive().await.expect("receive").expect("envelope");
        assert_eq!(retried.id, a);
        assert_eq!(retried.attempts, 2);
        queue.ack(&retried.delivery_tag()).await.expect("ack");

        let second = queue.receive().await.expect("receive").expect("envelope");
        assert_eq!(second.id, b);
    }

    #[tokio::test]
    async fn last_allowed_delivery_is_flagged_exhausted() {
        let (_, queue) = queue(2);
        queue.publish("{}").await.expect("publish");

        let first = queue.receive().await.expect("receive").expect("envelope");
        assert!(!first.attempts_exhausted());
        queue
            .nack(&first.delivery_tag(), "boom", first.updated_at)
            .await
            .expect("nack");

        let second = queue.receive().await.expect("receive").expect("envelope");
        assert!(second.attempts_exhausted());
        queue
            .dead_letter(&second.delivery_tag(), "boom")
            .await
            .expect("dead letter");

        assert!(queue.receive().await.expect("receive").is_none());
        assert_eq!(queue.depth().await.expect("depth"), 0);
        assert_eq!(queue.dead_letter_count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn settling_twice_is_rejected() {
        let (_, queue) = queue(5);
        queue.publish("{}").await.expect("publish");
        let envelope = queue.receive().await.expect("receive").expect("envelope");

        queue
            .nack(&envelope.delivery_tag(), "boom", envelope.updated_at)
            .await
            .expect("nack");
        let err = queue
            .ack(&envelope.delivery_tag())
            .await
            .expect_err("already settled");
        assert!(matches!(err, QueueError::StaleDelivery { .. }));
    }

    #[tokio::test]
    async fn released_delivery_goes_back_to_the_head() {
        let (_, queue) = queue(5);
        queue.publish(r#"{"n":1}"#).await.expect("publish");
        queue.publish(r#"{"n":2}"#).await.expect("publish");
        let first = queue.receive().await.expect("receive").expect("envelope");
        assert!(queue.receive().await.expect("receive").is_none());

        queue.release(&first.delivery_tag()).await.expect("release");

        let again = queue.receive().await.expect("receive").expect("envelope");
        assert_eq!(again.id, first.id);
        assert_eq!(again.attempts, 2);
        let err = queue
            .release(&first.delivery_tag())
            .await
            .expect_err("old attempt");
        assert!(matches!(err, QueueError::StaleDelivery { .. }));
    }
}
