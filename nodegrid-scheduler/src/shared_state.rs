//! Mutable scheduler state shared between the scheduler's own
//! dispatch loop and the core module (and any other module that needs
//! to read or mutate dispatcher/directory/registry/variables/handlers).
//! Modules only ever see `&self`, so the fields a command handler can
//! mutate live behind interior mutability here rather than in
//! `Scheduler` itself.

use crate::handler::HandlerTable;
use dashmap::DashMap;
use nodegrid_address::{Address, Registry};
use nodegrid_protocol::Envelope;
use nodegrid_shared::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

#[derive(Default)]
pub struct SchedulerFlags {
    pub log_messages: AtomicBool,
    pub log_proc_time: AtomicBool,
    pub trace_msgs: AtomicBool,
}

#[derive(Default)]
pub struct SchedulerStats {
    pub tasks_active: AtomicU64,
    pub tasks_finished: AtomicU64,
    pub messages_active: AtomicU64,
    pub messages_finished: AtomicU64,
    pub modules_count: AtomicU64,
    pub gates_count: AtomicU64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> Value {
        let mut out = Value::map();
        out.set("tasks_active", Value::UInt(self.tasks_active.load(Ordering::Relaxed)));
        out.set("tasks_finished", Value::UInt(self.tasks_finished.load(Ordering::Relaxed)));
        out.set("messages_active", Value::UInt(self.messages_active.load(Ordering::Relaxed)));
        out.set("messages_finished", Value::UInt(self.messages_finished.load(Ordering::Relaxed)));
        out.set("modules_count", Value::UInt(self.modules_count.load(Ordering::Relaxed)));
        out.set("gates_count", Value::UInt(self.gates_count.load(Ordering::Relaxed)));
        out
    }
}

pub struct SchedulerShared {
    pub name: RwLock<String>,
    pub dispatcher: RwLock<Option<Address>>,
    pub directory: RwLock<Option<Address>>,
    pub vars: DashMap<String, Value>,
    pub registry: Mutex<Registry>,
    pub flags: SchedulerFlags,
    pub stats: SchedulerStats,
    pub stop_requested: AtomicBool,
    pub restart_requested: AtomicBool,
    pub handlers: HandlerTable,
    /// Envelopes a module produced while only holding `&SchedulerShared`
    /// (no `StepContext`), e.g. a forward continuation relaying a
    /// target's reply back to the original requester. Drained and
    /// routed by the scheduler at the end of each `run_step`.
    pub forward_relay: Mutex<VecDeque<Envelope>>,
}

impl SchedulerShared {
    pub fn new(name: impl Into<String>) -> Self {
        SchedulerShared {
            name: RwLock::new(name.into()),
            dispatcher: RwLock::new(None),
            directory: RwLock::new(None),
            vars: DashMap::new(),
            registry: Mutex::new(Registry::new()),
            flags: SchedulerFlags::default(),
            stats: SchedulerStats::default(),
            stop_requested: AtomicBool::new(false),
            restart_requested: AtomicBool::new(false),
            handlers: HandlerTable::new(),
            forward_relay: Mutex::new(VecDeque::new()),
        }
    }
}
