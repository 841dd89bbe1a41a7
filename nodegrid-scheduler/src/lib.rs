//! Cooperative scheduler, module/task contracts, request-handler
//! correlation, message packs, and the always-on core module.

mod context;
mod core_module;
mod handler;
mod module;
mod pack;
mod scheduler;
mod shared_state;
mod task;

pub use context::{RequestIdGenerator, StepContext};
pub use core_module::CoreModule;
pub use handler::{CommErrorPhase, HandlerTable, RequestHandler};
pub use module::{Module, ModuleOutcome};
pub use pack::{split_items, split_params, MessagePack};
pub use scheduler::Scheduler;
pub use shared_state::{SchedulerFlags, SchedulerShared, SchedulerStats};
pub use task::Task;
