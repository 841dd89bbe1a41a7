//! Restart-safe, transactional job runtime: definitions, instances,
//! transactions, durable storage, the `job.*` manager module, and the
//! worker-side `job_worker.*` sync-action framework (spec §4.8 "Job
//! Manager").

mod definition;
mod instance;
mod manager;
mod split_join;
mod store;
mod transaction;
mod worker_task;

pub use definition::{resolve_params, JobDefinition, JobParam, JobParamClass};
pub use instance::{JobInstance, JobStatus};
pub use manager::{JobManager, JobManagerModule, JobSweepTask, QueueRuntime};
pub use split_join::{ChunkProcessor, SplitJoinWorker};
pub use store::{InMemoryJobStore, JobLogEntry, JobStore, LogSeverity, PgJobStore};
pub use transaction::{JobResource, JobTransaction, ResType, SafeRootList};
pub use worker_task::{JobWorkerModule, JobWorkerState, JobWorkerTask, SyncAction, SyncStage};
