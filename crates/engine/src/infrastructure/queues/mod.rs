//! Durable command queues, one per `CommandKind`

mod factory;
mod in_process_notifier;
mod memory_queue;
mod sqlite_queue;

pub use factory::QueueFactory;
pub use in_process_notifier::InProcessNotifier;
pub use memory_queue::InMemoryQueue;
pub use sqlite_queue::SqliteQueue;
