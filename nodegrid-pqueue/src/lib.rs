//! Durable, at-least-once message queue: message/status model, pluggable
//! storage, per-queue lifecycle, and the `pqueue.*` scheduler module.

mod archive;
mod message;
mod queue;
mod queue_task;
mod store;

pub use archive::write_archive;
pub use message::{MessageStatus, PersistentMessage};
pub use queue::{Queue, QueueConfig};
pub use queue_task::{PQueueModule, PQueueTask, QueueManager};
pub use store::{InMemoryPersistentQueueStore, PersistentQueueStore, PgPersistentQueueStore, LOCK_SAVE_FREQ};
