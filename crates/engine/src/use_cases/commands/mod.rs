//! Command use cases.
//!
//! The producer validates inbound events and publishes them onto the durable
//! queue of their command type; the dispatcher drains each queue with one
//! worker and applies the commands to storage.

use std::sync::Arc;

use dicelog_domain::CommandKind;

use crate::infrastructure::ports::QueuePort;

mod dispatcher;
mod producer;

pub use dispatcher::{spawn_workers, CommandDispatcher, HandlerError, RetryPolicy, Settled};
pub use producer::{CommandProducer, PayloadError, SubmitError};

/// The durable queue of every command type.
#[derive(Clone)]
pub struct CommandQueues {
    roll: Arc<dyn QueuePort>,
    end_session: Arc<dyn QueuePort>,
}

impl CommandQueues {
    pub fn new(roll: Arc<dyn QueuePort>, end_session: Arc<dyn QueuePort>) -> Self {
        Self { roll, end_session }
    }

    pub fn get(&self, kind: CommandKind) -> &Arc<dyn QueuePort> {
        match kind {
            CommandKind::Roll => &self.roll,
            CommandKind::EndSession => &self.end_session,
        }
    }

    /// Every queue, in `CommandKind::ALL` order.
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn QueuePort>> {
        CommandKind::ALL.into_iter().map(|kind| self.get(kind))
    }
}
