//! Command Dispatcher
//!
//! One worker per queue pulls a single envelope at a time, applies it and
//! settles it before asking for the next one. Failures are retried with
//! exponential backoff up to the envelope's attempt bound, after which the
//! envelope is dead-lettered.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dicelog_domain::{Command, EnvelopeId, RecordOutcome};

use crate::infrastructure::config::QueueConfig;
use crate::infrastructure::ports::{
    ClockPort, Envelope, QueueError, QueuePort, RepoError, RollRepo,
};
use crate::use_cases::session::{SessionCoordinator, SessionCoordinatorError};

use super::CommandQueues;

/// Backoff between redeliveries of a failed envelope
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay in milliseconds before the first redelivery
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (caps exponential growth)
    pub max_delay_ms: u64,
    /// Jitter factor (0.0-1.0) for randomizing delays
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
            jitter_factor: config.retry_jitter,
        }
    }

    /// Delay before redelivering after failed attempt number `attempt` (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms;
        // Exponential: base * 2^(attempt-1)
        let exponential = base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let capped = exponential.min(self.max_delay_ms);

        // Add jitter: ±jitter_factor around the delay
        let jitter_range = (capped as f64 * self.jitter_factor) as i64;
        let millis = if jitter_range > 0 {
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (capped as i64 + jitter).max(0) as u64
        } else {
            capped
        };
        Duration::from_millis(millis)
    }
}

/// Failure while applying a command. Never reaches the original caller.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Persistence error: {0}")]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Session(#[from] SessionCoordinatorError),
}

/// How one delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Acked,
    /// Nacked; redeliverable from `retry_at`.
    Retrying { retry_at: DateTime<Utc> },
    DeadLettered,
}

pub struct CommandDispatcher {
    coordinator: Arc<SessionCoordinator>,
    rolls: Arc<dyn RollRepo>,
    clock: Arc<dyn ClockPort>,
    retry: RetryPolicy,
}

impl CommandDispatcher {
    pub fn new(
        coordinator: Arc<SessionCoordinator>,
        rolls: Arc<dyn RollRepo>,
        clock: Arc<dyn ClockPort>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            coordinator,
            rolls,
            clock,
            retry,
        }
    }

    /// Apply one command. `envelope_id` makes the roll write idempotent.
    pub async fn handle(&self, command: Command, envelope_id: EnvelopeId) -> Result<(), HandlerError> {
        match command {
            Command::Roll(roll) => {
                match self
                    .rolls
                    .record_roll(envelope_id, &roll, self.clock.now())
                    .await?
                {
                    RecordOutcome::Recorded(roll_id) => tracing::info!(
                        roll_id = %roll_id,
                        session_id = %roll.session_id,
                        player = %roll.player,
                        total = roll.total,
                        "Roll recorded"
                    ),
                    RecordOutcome::Duplicate => tracing::info!(
                        envelope_id = %envelope_id,
                        "Roll already recorded by an earlier delivery"
                    ),
                }
            }
            Command::EndSession(end) => {
                let outcome = self.coordinator.end_session(end.session_id).await?;
                tracing::debug!(?outcome, "End session applied");
            }
        }
        Ok(())
    }

    /// Receive, apply and settle the next envelope of `queue`.
    ///
    /// Returns `None` when nothing is ready for delivery.
    pub async fn process_next(&self, queue: &dyn QueuePort) -> Result<Option<Settled>, QueueError> {
        let Some(envelope) = queue.receive().await? else {
            return Ok(None);
        };

        match self.apply_and_settle(queue, &envelope).await {
            Ok(settled) => Ok(Some(settled)),
            Err(e) => {
                // An unsettled delivery holds the head of the queue
                let tag = envelope.delivery_tag();
                if let Err(release_error) = queue.release(&tag).await {
                    tracing::error!(
                        queue = %queue.kind(),
                        envelope_id = %envelope.id,
                        error = %release_error,
                        "Could not release unsettled delivery"
                    );
                }
                Err(e)
            }
        }
    }

    async fn apply_and_settle(
        &self,
        queue: &dyn QueuePort,
        envelope: &Envelope,
    ) -> Result<Settled, QueueError> {
        let tag = envelope.delivery_tag();
        let kind = queue.kind();

        let command = match Command::decode(kind, &envelope.payload_json) {
            Ok(command) => command,
            Err(e) => {
                tracing::error!(
                    queue = %kind,
                    envelope_id = %envelope.id,
                    error = %e,
                    "Undecodable payload, dead-lettering"
                );
                queue
                    .dead_letter(&tag, &format!("Undecodable payload: {}", e))
                    .await?;
                return Ok(Settled::DeadLettered);
            }
        };

        match self.handle(command, envelope.id).await {
            Ok(()) => {
                queue.ack(&tag).await?;
                tracing::debug!(queue = %kind, envelope_id = %envelope.id, "Acked");
                Ok(Settled::Acked)
            }
            Err(e) if envelope.attempts_exhausted() => {
                tracing::error!(
                    queue = %kind,
                    envelope_id = %envelope.id,
                    attempts = envelope.attempts,
                    error = %e,
                    "Command failed on its last allowed attempt, dead-lettering"
                );
                queue.dead_letter(&tag, &e.to_string()).await?;
                Ok(Settled::DeadLettered)
            }
            Err(e) => {
                let delay = self.retry.calculate_delay(envelope.attempts);
                let retry_at = self.clock.now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                tracing::warn!(
                    queue = %kind,
                    envelope_id = %envelope.id,
                    attempt = envelope.attempts,
                    max_attempts = envelope.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Command failed, will retry"
                );
                queue.nack(&tag, &e.to_string(), retry_at).await?;
                Ok(Settled::Retrying { retry_at })
            }
        }
    }

    /// Drain `queue` until `cancel` fires.
    ///
    /// Cancellation is only observed between envelopes; a command that has
    /// been received is always applied and settled first.
    pub async fn run_worker(
        self: Arc<Self>,
        queue: Arc<dyn QueuePort>,
        recovery_interval: Duration,
        cancel: CancellationToken,
    ) {
        let kind = queue.kind();
        tracing::info!(queue = %kind, "Starting command worker");
        let mut next_retry: Option<DateTime<Utc>> = None;
        let mut needs_recovery = false;

        loop {
            // Check for cancellation
            if cancel.is_cancelled() {
                break;
            }

            // This worker is the queue's only consumer, so anything still
            // processing here is a delivery it failed to settle or release.
            if needs_recovery {
                match queue.recover_unacked().await {
                    Ok(recovered) => {
                        needs_recovery = false;
                        if recovered > 0 {
                            tracing::warn!(queue = %kind, recovered, "Recovered unsettled deliveries");
                        }
                    }
                    Err(e) => {
                        tracing::error!(queue = %kind, error = %e, "Recovery failed");
                    }
                }
            }

            let wait = match self.process_next(queue.as_ref()).await {
                Ok(Some(Settled::Retrying { retry_at })) => {
                    next_retry = Some(retry_at);
                    self.idle_wait(next_retry, recovery_interval)
                }
                Ok(Some(_)) => {
                    next_retry = None;
                    continue;
                }
                // Queue empty or head not yet due
                Ok(None) => self.idle_wait(next_retry, recovery_interval),
                Err(e) => {
                    tracing::error!(queue = %kind, error = %e, "Error processing command");
                    needs_recovery = true;
                    Duration::from_secs(1)
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = queue.wait_for_work(wait) => {}
            }
        }

        tracing::info!(queue = %kind, "Command worker shutting down");
    }

    fn idle_wait(&self, next_retry: Option<DateTime<Utc>>, recovery_interval: Duration) -> Duration {
        match next_retry {
            Some(retry_at) => (retry_at - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(recovery_interval),
            None => recovery_interval,
        }
    }
}

/// Start one worker per queue.
pub fn spawn_workers(
    dispatcher: Arc<CommandDispatcher>,
    queues: &CommandQueues,
    recovery_interval: Duration,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    queues
        .all()
        .map(|queue| {
            let dispatcher = dispatcher.clone();
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                dispatcher.run_worker(queue, recovery_interval, cancel).await;
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use dicelog_domain::{
        CommandKind, Player, PlayerId, PlayerName, Roll, RollCommand, RollId, SessionId,
    };

    use crate::infrastructure::clock::FixedClock;
    use crate::infrastructure::persistence::{test_pool, SqliteRollRepo, SqliteSessionRepo};
    use crate::infrastructure::ports::{DeliveryTag, MockRollRepo, SessionRepo, WaitResult};
    use crate::infrastructure::queues::{InMemoryQueue, InProcessNotifier, SqliteQueue};
    use crate::use_cases::commands::CommandProducer;

    fn clock() -> Arc<dyn ClockPort> {
        Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0)
                .single()
                .expect("valid date"),
        ))
    }

    fn no_backoff() -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_factor: 0.0,
        }
    }

    fn memory_queues(clock: &Arc<dyn ClockPort>, max_attempts: u32) -> CommandQueues {
        let queue = |kind: CommandKind| -> Arc<dyn QueuePort> {
            Arc::new(InMemoryQueue::new(
                kind,
                max_attempts,
                InProcessNotifier::new(kind),
                clock.clone(),
            ))
        };
        CommandQueues::new(queue(CommandKind::Roll), queue(CommandKind::EndSession))
    }

    fn failing_write() -> RepoError {
        RepoError::database("record_roll", "database is locked")
    }

    /// Session storage plus a coordinator with one open session.
    async fn open_session(
        pool: sqlx::SqlitePool,
        clock: &Arc<dyn ClockPort>,
    ) -> (Arc<SessionCoordinator>, SessionId) {
        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::new(SqliteSessionRepo::new(pool)),
            clock.clone(),
        ));
        let id = coordinator.start_session().await.expect("start");
        (coordinator, id)
    }

    #[tokio::test]
    async fn when_valid_roll_is_processed_then_exactly_one_roll_with_results_is_stored() {
        let (_dir, pool) = test_pool().await;
        let clock = clock();
        let (coordinator, session_id) = open_session(pool.clone(), &clock).await;

        let roll_queue: Arc<dyn QueuePort> = Arc::new(
            SqliteQueue::new(
                pool.clone(),
                CommandKind::Roll,
                5,
                InProcessNotifier::new(CommandKind::Roll),
                clock.clone(),
            )
            .await
            .expect("queue"),
        );
        let queues = CommandQueues::new(
            roll_queue.clone(),
            memory_queues(&clock, 5).get(CommandKind::EndSession).clone(),
        );
        let producer = CommandProducer::new(coordinator.clone(), queues);
        let rolls = Arc::new(SqliteRollRepo::new(pool));
        let dispatcher =
            CommandDispatcher::new(coordinator, rolls.clone(), clock.clone(), no_backoff());

        producer
            .submit(
                CommandKind::Roll,
                r#"{"player":"Alice","results":[3,4,5],"total":12}"#,
            )
            .await
            .expect("accepted");

        assert_eq!(
            dispatcher
                .process_next(roll_queue.as_ref())
                .await
                .expect("process"),
            Some(Settled::Acked)
        );
        assert_eq!(
            dispatcher
                .process_next(roll_queue.as_ref())
                .await
                .expect("process"),
            None
        );

        let stored = rolls.list_session_rolls(session_id).await.expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].session_id, session_id);
        assert_eq!(stored[0].player.as_str(), "Alice");
        assert_eq!(stored[0].total, 12);
        assert_eq!(stored[0].results.as_slice(), &[3, 4, 5]);
    }

    #[tokio::test]
    async fn when_bob_rolls_in_session_one_then_record_roll_is_called_once() {
        let (_dir, pool) = test_pool().await;
        let clock = clock();
        let (coordinator, session_id) = open_session(pool, &clock).await;
        assert_eq!(session_id, SessionId::new(1));

        let mut rolls = MockRollRepo::new();
        rolls
            .expect_record_roll()
            .withf(|_, roll, _| {
                roll.session_id == SessionId::new(1)
                    && roll.player.as_str() == "Bob"
                    && roll.results.as_slice() == [1, 2]
                    && roll.total == 3
            })
            .times(1)
            .returning(|_, _, _| Ok(RecordOutcome::Recorded(RollId::new(1))));

        let queues = memory_queues(&clock, 5);
        let producer = CommandProducer::new(coordinator.clone(), queues.clone());
        let dispatcher =
            CommandDispatcher::new(coordinator, Arc::new(rolls), clock.clone(), no_backoff());

        producer
            .submit(CommandKind::Roll, r#"{"player":"Bob","results":[1,2],"total":3}"#)
            .await
            .expect("accepted");

        let roll_queue = queues.get(CommandKind::Roll);
        while dispatcher
            .process_next(roll_queue.as_ref())
            .await
            .expect("process")
            .is_some()
        {}
    }

    #[tokio::test]
    async fn when_handler_fails_twice_then_third_delivery_applies_once() {
        let clock = clock();
        let mut session_repo = crate::infrastructure::ports::MockSessionRepo::new();
        session_repo.expect_latest_session().times(0);
        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::new(session_repo),
            clock.clone(),
        ));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_repo = seen.clone();
        let mut calls = 0;
        let mut rolls = MockRollRepo::new();
        rolls
            .expect_record_roll()
            .times(3)
            .returning(move |envelope_id, _, _| {
                seen_by_repo
                    .lock()
                    .expect("lock")
                    .push(envelope_id);
                calls += 1;
                if calls < 3 {
                    Err(failing_write())
                } else {
                    Ok(RecordOutcome::Recorded(RollId::new(1)))
                }
            });

        let queues = memory_queues(&clock, 5);
        let roll_queue = queues.get(CommandKind::Roll).clone();
        let command = Command::Roll(RollCommand {
            session_id: SessionId::new(1),
            player: PlayerName::new("Alice").expect("valid"),
            results: dicelog_domain::DiceResults::new(vec![3, 4, 5]).expect("valid"),
            total: 12,
        });
        let envelope_id = roll_queue
            .publish(&command.encode_payload().expect("encode"))
            .await
            .expect("publish");

        let dispatcher = CommandDispatcher::new(coordinator, Arc::new(rolls), clock, no_backoff());
        let mut settled = Vec::new();
        while let Some(outcome) = dispatcher
            .process_next(roll_queue.as_ref())
            .await
            .expect("process")
        {
            settled.push(outcome);
        }

        assert!(matches!(
            settled.as_slice(),
            [
                Settled::Retrying { .. },
                Settled::Retrying { .. },
                Settled::Acked
            ]
        ));
        assert_eq!(*seen.lock().expect("lock"), vec![envelope_id; 3]);
        assert_eq!(roll_queue.depth().await.expect("depth"), 0);
    }

    #[tokio::test]
    async fn when_handler_keeps_failing_then_envelope_is_dead_lettered_at_the_bound() {
        let clock = clock();
        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::new(crate::infrastructure::ports::MockSessionRepo::new()),
            clock.clone(),
        ));
        let mut rolls = MockRollRepo::new();
        rolls
            .expect_record_roll()
            .times(2)
            .returning(|_, _, _| Err(failing_write()));

        let queues = memory_queues(&clock, 2);
        let roll_queue = queues.get(CommandKind::Roll).clone();
        roll_queue
            .publish(r#"{"session_id":1,"player":"Alice","results":[6],"total":6}"#)
            .await
            .expect("publish");

        let dispatcher = CommandDispatcher::new(coordinator, Arc::new(rolls), clock, no_backoff());
        assert!(matches!(
            dispatcher.process_next(roll_queue.as_ref()).await,
            Ok(Some(Settled::Retrying { .. }))
        ));
        assert_eq!(
            dispatcher
                .process_next(roll_queue.as_ref())
                .await
                .expect("process"),
            Some(Settled::DeadLettered)
        );
        assert_eq!(
            dispatcher
                .process_next(roll_queue.as_ref())
                .await
                .expect("process"),
            None
        );

        let dead = roll_queue.list_dead_letters(10).await.expect("list");
        assert_eq!(dead.len(), 1);
        assert_eq!(
            dead[0].error_message.as_deref(),
            Some("Persistence error: Database error in record_roll: database is locked")
        );
    }

    #[tokio::test]
    async fn when_payload_cannot_be_decoded_then_it_is_dead_lettered_without_retry() {
        let clock = clock();
        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::new(crate::infrastructure::ports::MockSessionRepo::new()),
            clock.clone(),
        ));
        let mut rolls = MockRollRepo::new();
        rolls.expect_record_roll().times(0);

        let queues = memory_queues(&clock, 5);
        let roll_queue = queues.get(CommandKind::Roll).clone();
        roll_queue
            .publish(r#"{"player":"Alice"}"#)
            .await
            .expect("publish");

        let dispatcher = CommandDispatcher::new(coordinator, Arc::new(rolls), clock, no_backoff());
        assert_eq!(
            dispatcher
                .process_next(roll_queue.as_ref())
                .await
                .expect("process"),
            Some(Settled::DeadLettered)
        );
        assert_eq!(roll_queue.dead_letter_count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn when_roll_is_redelivered_after_apply_then_it_is_not_stored_twice() {
        let (_dir, pool) = test_pool().await;
        let clock = clock();
        let (coordinator, session_id) = open_session(pool.clone(), &clock).await;
        let rolls = Arc::new(SqliteRollRepo::new(pool));
        let dispatcher =
            CommandDispatcher::new(coordinator, rolls.clone(), clock.clone(), no_backoff());

        let command = Command::Roll(RollCommand {
            session_id,
            player: PlayerName::new("Alice").expect("valid"),
            results: dicelog_domain::DiceResults::new(vec![1, 1, 2]).expect("valid"),
            total: 4,
        });
        let envelope_id = EnvelopeId::new();
        dispatcher
            .handle(command.clone(), envelope_id)
            .await
            .expect("first apply");
        dispatcher
            .handle(command, envelope_id)
            .await
            .expect("second apply");

        let stored = rolls.list_session_rolls(session_id).await.expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].results.len(), 3);
    }

    #[tokio::test]
    async fn when_end_session_is_processed_then_session_is_closed() {
        let (_dir, pool) = test_pool().await;
        let clock = clock();
        let (coordinator, session_id) = open_session(pool.clone(), &clock).await;
        let sessions = SqliteSessionRepo::new(pool.clone());

        let queues = memory_queues(&clock, 5);
        let producer = CommandProducer::new(coordinator.clone(), queues.clone());
        let dispatcher = CommandDispatcher::new(
            coordinator.clone(),
            Arc::new(SqliteRollRepo::new(pool)),
            clock.clone(),
            no_backoff(),
        );

        producer.submit_end_session().await.expect("accepted");
        // Still current until the command is applied
        assert_eq!(coordinator.current_session_id().await, Some(session_id));

        let end_queue = queues.get(CommandKind::EndSession);
        assert_eq!(
            dispatcher
                .process_next(end_queue.as_ref())
                .await
                .expect("process"),
            Some(Settled::Acked)
        );

        assert_eq!(coordinator.current_session_id().await, None);
        let session = sessions
            .get_session(session_id)
            .await
            .expect("get")
            .expect("exists");
        assert!(!session.is_open());
    }

    /// Records applied player names; the first attempt for "A" fails.
    struct OrderedRolls {
        applied: Arc<Mutex<Vec<String>>>,
        failed_once: AtomicBool,
    }

    #[async_trait]
    impl RollRepo for OrderedRolls {
        async fn get_or_create_player(&self, name: &PlayerName) -> Result<Player, RepoError> {
            Ok(Player {
                id: PlayerId::new(1),
                name: name.clone(),
            })
        }

        async fn record_roll(
            &self,
            _envelope_id: EnvelopeId,
            roll: &RollCommand,
            _recorded_at: DateTime<Utc>,
        ) -> Result<RecordOutcome, RepoError> {
            let name = roll.player.as_str().to_string();
            if name == "A" && !self.failed_once.swap(true, Ordering::SeqCst) {
                self.applied.lock().expect("lock").push("A failed".into());
                return Err(failing_write());
            }
            self.applied.lock().expect("lock").push(name);
            Ok(RecordOutcome::Recorded(RollId::new(1)))
        }

        async fn list_session_rolls(&self, _session_id: SessionId) -> Result<Vec<Roll>, RepoError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn when_worker_runs_then_rolls_apply_in_publish_order_and_stop_on_cancel() {
        let clock = clock();
        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::new(crate::infrastructure::ports::MockSessionRepo::new()),
            clock.clone(),
        ));
        let applied = Arc::new(Mutex::new(Vec::new()));
        let rolls = Arc::new(OrderedRolls {
            applied: applied.clone(),
            failed_once: AtomicBool::new(false),
        });

        let queues = memory_queues(&clock, 5);
        let roll_queue = queues.get(CommandKind::Roll);
        for name in ["A", "B"] {
            let payload = format!(
                r#"{{"session_id":1,"player":"{}","results":[2],"total":2}}"#,
                name
            );
            roll_queue.publish(&payload).await.expect("publish");
        }

        let dispatcher = Arc::new(CommandDispatcher::new(
            coordinator,
            rolls,
            clock,
            no_backoff(),
        ));
        let cancel = CancellationToken::new();
        let workers = spawn_workers(dispatcher, &queues, Duration::from_secs(5), cancel.clone());
        assert_eq!(workers.len(), 2);

        tokio::time::timeout(Duration::from_secs(5), async {
            while applied.lock().expect("lock").len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("rolls applied");

        cancel.cancel();
        for worker in workers {
            tokio::time::timeout(Duration::from_secs(5), worker)
                .await
                .expect("worker stopped")
                .expect("worker did not panic");
        }

        assert_eq!(*applied.lock().expect("lock"), vec!["A failed", "A", "B"]);
    }

    /// Wraps a queue so that the next `ack`/`release` calls fail like a
    /// locked database.
    struct FlakySettleQueue {
        inner: Arc<dyn QueuePort>,
        ack_failures: AtomicUsize,
        release_failures: AtomicUsize,
    }

    impl FlakySettleQueue {
        fn new(inner: Arc<dyn QueuePort>, ack_failures: usize, release_failures: usize) -> Self {
            Self {
                inner,
                ack_failures: AtomicUsize::new(ack_failures),
                release_failures: AtomicUsize::new(release_failures),
            }
        }

        fn fail_once(counter: &AtomicUsize) -> Result<(), QueueError> {
            match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
                Ok(_) => Err(QueueError::Database("database is locked".into())),
                Err(_) => Ok(()),
            }
        }
    }

    #[async_trait]
    impl QueuePort for FlakySettleQueue {
        fn kind(&self) -> CommandKind {
            self.inner.kind()
        }
        async fn publish(&self, payload_json: &str) -> Result<EnvelopeId, QueueError> {
            self.inner.publish(payload_json).await
        }
        async fn receive(&self) -> Result<Option<Envelope>, QueueError> {
            self.inner.receive().await
        }
        async fn ack(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
            Self::fail_once(&self.ack_failures)?;
            self.inner.ack(tag).await
        }
        async fn nack(
            &self,
            tag: &DeliveryTag,
            error: &str,
            retry_at: DateTime<Utc>,
        ) -> Result<(), QueueError> {
            self.inner.nack(tag, error, retry_at).await
        }
        async fn dead_letter(&self, tag: &DeliveryTag, error: &str) -> Result<(), QueueError> {
            self.inner.dead_letter(tag, error).await
        }
        async fn release(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
            Self::fail_once(&self.release_failures)?;
            self.inner.release(tag).await
        }
        async fn recover_unacked(&self) -> Result<usize, QueueError> {
            self.inner.recover_unacked().await
        }
        async fn depth(&self) -> Result<usize, QueueError> {
            self.inner.depth().await
        }
        async fn dead_letter_count(&self) -> Result<usize, QueueError> {
            self.inner.dead_letter_count().await
        }
        async fn list_dead_letters(&self, limit: usize) -> Result<Vec<Envelope>, QueueError> {
            self.inner.list_dead_letters(limit).await
        }
        async fn requeue_dead_letters(&self) -> Result<usize, QueueError> {
            self.inner.requeue_dead_letters().await
        }
        async fn wait_for_work(&self, timeout: Duration) -> WaitResult {
            self.inner.wait_for_work(timeout).await
        }
    }

    fn recording_rolls() -> (Arc<Mutex<Vec<String>>>, Arc<OrderedRolls>) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let rolls = Arc::new(OrderedRolls {
            applied: applied.clone(),
            // Never fails
            failed_once: AtomicBool::new(true),
        });
        (applied, rolls)
    }

    async fn publish_rolls(queue: &dyn QueuePort, names: &[&str]) {
        for name in names {
            let payload = format!(
                r#"{{"session_id":1,"player":"{}","results":[2],"total":2}}"#,
                name
            );
            queue.publish(&payload).await.expect("publish");
        }
    }

    #[tokio::test]
    async fn when_ack_fails_then_delivery_is_released_and_queue_keeps_moving() {
        let clock = clock();
        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::new(crate::infrastructure::ports::MockSessionRepo::new()),
            clock.clone(),
        ));
        let (applied, rolls) = recording_rolls();
        let queue = FlakySettleQueue::new(
            memory_queues(&clock, 5).get(CommandKind::Roll).clone(),
            1,
            0,
        );
        publish_rolls(&queue, &["A", "B"]).await;
        let dispatcher = CommandDispatcher::new(coordinator, rolls, clock, no_backoff());

        assert!(matches!(
            dispatcher.process_next(&queue).await,
            Err(QueueError::Database(_))
        ));

        let redelivered = queue.receive().await.expect("receive").expect("head released");
        assert_eq!(redelivered.attempts, 2);
        queue
            .release(&redelivered.delivery_tag())
            .await
            .expect("release");

        assert_eq!(
            dispatcher.process_next(&queue).await.expect("process"),
            Some(Settled::Acked)
        );
        assert_eq!(
            dispatcher.process_next(&queue).await.expect("process"),
            Some(Settled::Acked)
        );
        assert_eq!(dispatcher.process_next(&queue).await.expect("process"), None);
        assert_eq!(queue.depth().await.expect("depth"), 0);
        assert_eq!(*applied.lock().expect("lock"), vec!["A", "A", "B"]);
    }

    #[tokio::test]
    async fn when_ack_and_release_both_fail_then_worker_recovers_the_delivery() {
        let clock = clock();
        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::new(crate::infrastructure::ports::MockSessionRepo::new()),
            clock.clone(),
        ));
        let (applied, rolls) = recording_rolls();
        let queues = memory_queues(&clock, 5);
        let flaky: Arc<dyn QueuePort> = Arc::new(FlakySettleQueue::new(
            queues.get(CommandKind::Roll).clone(),
            1,
            1,
        ));
        publish_rolls(flaky.as_ref(), &["A", "B"]).await;

        let dispatcher = Arc::new(CommandDispatcher::new(
            coordinator,
            rolls,
            clock,
            no_backoff(),
        ));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(dispatcher.run_worker(
            flaky.clone(),
            Duration::from_millis(50),
            cancel.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while flaky.depth().await.expect("depth") > 0
                || applied.lock().expect("lock").len() < 3
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue drained");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker stopped")
            .expect("worker did not panic");
        assert_eq!(*applied.lock().expect("lock"), vec!["A", "A", "B"]);
    }

    #[tokio::test]
    async fn when_roll_was_already_recorded_then_handler_still_succeeds() {
        let mut sessions = crate::infrastructure::ports::MockSessionRepo::new();
        sessions.expect_latest_session().times(0);
        sessions.expect_end_latest_session().times(0);
        let clock = clock();
        let coordinator = Arc::new(SessionCoordinator::new(Arc::new(sessions), clock.clone()));
        let mut rolls = MockRollRepo::new();
        rolls
            .expect_record_roll()
            .times(1)
            .returning(|_, _, _| Ok(RecordOutcome::Duplicate));

        let dispatcher = CommandDispatcher::new(coordinator, Arc::new(rolls), clock, no_backoff());
        let command = Command::decode(
            CommandKind::Roll,
            r#"{"session_id":7,"player":"Bob","results":[1],"total":1}"#,
        )
        .expect("decode");
        dispatcher
            .handle(command, EnvelopeId::new())
            .await
            .expect("handled");
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 350,
            jitter_factor: 0.0,
        };
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(350));
        assert_eq!(policy.calculate_delay(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_factor() {
        let policy = RetryPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
        };
        for _ in 0..100 {
            let delay = policy.calculate_delay(1).as_millis();
            assert!((800..=1200).contains(&delay), "delay {} out of range", delay);
        }
    }
}
