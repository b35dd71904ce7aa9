//! Worker wake-ups for a command queue.
//!
//! Publishers and workers share one process, so one `tokio::sync::Notify`
//! per queue carries every signal.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use dicelog_domain::CommandKind;

use crate::infrastructure::ports::{QueueNotificationPort, WaitResult};

/// Wakes the single worker of one command queue.
///
/// A signal sent while the worker is busy is stored as a permit and consumed
/// by its next `wait_for_work`.
#[derive(Clone)]
pub struct InProcessNotifier {
    notify: Arc<Notify>,
    kind: CommandKind,
}

impl InProcessNotifier {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            kind,
        }
    }
}

#[async_trait]
impl QueueNotificationPort for InProcessNotifier {
    async fn notify_work_available(&self) {
        tracing::trace!(queue = %self.kind, "Waking worker");
        self.notify.notify_one();
    }

    async fn wait_for_work(&self, timeout: Duration) -> WaitResult {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .map_or(WaitResult::Timeout, |()| WaitResult::Notified)
    }
}
