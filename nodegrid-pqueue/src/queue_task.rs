//! Wires [`crate::queue::Queue`] into the scheduler as the `pqueue.*`
//! command module plus the background task that drives the periodic
//! timeout/purge sweep and drains `handled` messages into reply
//! envelopes (spec §4.7 "Timeouts", "Purge", "Replying", and §6's
//! `pqueue` wire command list). Grounded in
//! `examples/original_source/libs/grd/include/grd/PersQueue.h`'s
//! "Automatic processing" bullet list, expressed through
//! `nodegrid-scheduler`'s `Module`/`Task` traits the way `CoreModule`
//! does for `core.*`.

use crate::message::MessageStatus;
use crate::queue::{Queue, QueueConfig};
use crate::store::PersistentQueueStore;
use async_trait::async_trait;
use dashmap::DashMap;
use nodegrid_protocol::Envelope;
use nodegrid_scheduler::{Module, ModuleOutcome, StepContext, Task};
use nodegrid_shared::{NodegridError, NodegridResult, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Registry of named queues owned by one scheduler. Shared between the
/// `pqueue.*` module (handles wire commands) and the sweep task
/// (drives timeouts/purge/replies in the background).
pub struct QueueManager {
    store: Arc<dyn PersistentQueueStore>,
    default_config: QueueConfig,
    queues: DashMap<String, Arc<Queue>>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn PersistentQueueStore>, default_config: QueueConfig) -> Self {
        QueueManager {
            store,
            default_config,
            queues: DashMap::new(),
        }
    }

    /// `pqueue.define`: create (or replace) a queue and run its startup
    /// recovery sweep (spec §4.7 "Startup").
    pub async fn define(&self, name: &str, config: Option<QueueConfig>) -> NodegridResult<()> {
        let config = config.unwrap_or_else(|| self.default_config.clone());
        let queue = Arc::new(Queue::new(name, config, self.store.clone()));
        queue.open().await?;
        self.queues.insert(name.to_string(), queue);
        Ok(())
    }

    pub fn undefine(&self, name: &str) {
        self.queues.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|e| e.clone())
    }

    fn require(&self, name: &str) -> NodegridResult<Arc<Queue>> {
        self.get(name).ok_or_else(|| NodegridError::WrongParams(format!("no such queue: {name}")))
    }

    pub fn names(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    pub fn all(&self) -> Vec<Arc<Queue>> {
        self.queues.iter().map(|e| e.value().clone()).collect()
    }
}

/// The `pqueue.*` command module. Dispatches each command to the named
/// queue; `define`/`init` install [`PQueueTask`] on first use via
/// `TASK_REQ`, matching `CoreModule`'s pattern for commands that need
/// scheduler cooperation beyond a single request/response.
pub struct PQueueModule {
    manager: Arc<QueueManager>,
    task_installed: AtomicBool,
    sweep_interval: Duration,
}

impl PQueueModule {
    pub fn new(manager: Arc<QueueManager>, sweep_interval: Duration) -> Self {
        PQueueModule {
            manager,
            task_installed: AtomicBool::new(false),
            sweep_interval,
        }
    }

    fn maybe_spawn_task(&self) -> Option<Box<dyn Task>> {
        if self.task_installed.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Box::new(PQueueTask::new(self.manager.clone(), self.sweep_interval)))
    }
}

#[async_trait]
impl Module for PQueueModule {
    fn name(&self) -> &str {
        "pqueue"
    }

    fn interfaces(&self) -> &[&str] {
        &["pqueue"]
    }

    async fn handle_request(
        &self,
        _envelope: &Envelope,
        command: &str,
        params: &Value,
        _ctx: &mut StepContext<'_>,
    ) -> NodegridResult<ModuleOutcome> {
        let verb = command.strip_prefix("pqueue.").unwrap_or(command);
        let queue_name = params.get_str_or("queue", "");

        match verb {
            "init" => Ok(match self.maybe_spawn_task() {
                Some(task) => ModuleOutcome::TaskRequest(task),
                None => ModuleOutcome::HandledNoReply,
            }),

            "define" => {
                self.manager.define(queue_name, None).await?;
                Ok(ModuleOutcome::HandledNoReply)
            }
            "undefine" | "drop" | "close" => {
                self.manager.undefine(queue_name);
                Ok(ModuleOutcome::HandledNoReply)
            }
            "open" => {
                let queue = self.manager.require(queue_name)?;
                queue.open().await?;
                Ok(ModuleOutcome::HandledNoReply)
            }
            "qlist" => Ok(ModuleOutcome::Handled(Value::List(
                self.manager.names().into_iter().map(Value::String).collect(),
            ))),

            "put" => {
                let queue = self.manager.require(queue_name)?;
                let command = params.get_str_or("command", "");
                let payload = params.get("params").cloned().unwrap_or(Value::Null);
                let reference = params.get("reference").and_then(|v| v.as_str()).map(str::to_string);
                let reply_cmd = params.get("reply_cmd").and_then(|v| v.as_str()).map(str::to_string);
                let id = queue.put(command, payload, reference, reply_cmd).await?;
                let mut result = Value::map();
                result.set("message_id", Value::UInt(id));
                Ok(ModuleOutcome::Handled(result))
            }
            "mlist" => {
                let queue = self.manager.require(queue_name)?;
                let status = params.get("status").and_then(|v| v.as_str()).and_then(MessageStatus::parse);
                let rows = queue.mlist(status);
                Ok(ModuleOutcome::Handled(Value::List(
                    rows.into_iter().map(|m| serde_json::to_value(&m).ok().map(value_from_json).unwrap_or(Value::Null)).collect(),
                )))
            }
            "fetch" => {
                let queue = self.manager.require(queue_name)?;
                let limit = params.get_i64_or("limit", 1).max(0) as usize;
                let (lock_id, msgs) = queue.fetch(limit).await?;
                let mut result = Value::map();
                result.set("lock_id", Value::UInt(lock_id));
                result.set(
                    "msg_list",
                    Value::List(
                        msgs.into_iter()
                            .map(|m| {
                                let mut v = Value::map();
                                v.set("message_id", Value::UInt(m.id));
                                v.set("command", Value::from(m.command));
                                v.set("params", m.params);
                                v
                            })
                            .collect(),
                    ),
                );
                Ok(ModuleOutcome::Handled(result))
            }
            "handled" => {
                let queue = self.manager.require(queue_name)?;
                let lock_id = params.get_i64_or("lock_id", 0) as u64;
                let message_id = params.get_i64_or("message_id", 0) as u64;
                let exec_status = params.get_i64_or("exec_status", 0) as i32;
                let result = params.get("result").cloned();
                let error = params.get("error").and_then(|v| v.as_str()).map(str::to_string);
                let ok = queue.handled(lock_id, message_id, exec_status, result, error).await?;
                Ok(ModuleOutcome::Handled(Value::Bool(ok)))
            }
            "lock" => {
                let queue = self.manager.require(queue_name)?;
                let message_id = params.get_i64_or("message_id", 0) as u64;
                let lock_id = params.get_i64_or("lock_id", 0) as u64;
                let ok = queue.lock(message_id, lock_id).await?;
                Ok(ModuleOutcome::Handled(Value::Bool(ok)))
            }
            "unlock" => {
                let queue = self.manager.require(queue_name)?;
                let message_id = params.get_i64_or("message_id", 0) as u64;
                let ok = queue.unlock(message_id).await?;
                Ok(ModuleOutcome::Handled(Value::Bool(ok)))
            }
            "cancel" => {
                let queue = self.manager.require(queue_name)?;
                let message_id = params.get_i64_or("message_id", 0) as u64;
                let lock_id = params.get_i64_or("lock_id", 0) as u64;
                let ok = queue.cancel(message_id, lock_id).await?;
                Ok(ModuleOutcome::Handled(Value::Bool(ok)))
            }
            "peek" => {
                let queue = self.manager.require(queue_name)?;
                let found = if let Some(reference) = params.get("reference").and_then(|v| v.as_str()) {
                    queue.peek_by_reference(reference)
                } else {
                    queue.peek(params.get_i64_or("message_id", 0) as u64)
                };
                match found {
                    Some(m) => Ok(ModuleOutcome::Handled(serde_json::to_value(&m).ok().map(value_from_json).unwrap_or(Value::Null))),
                    None => Ok(ModuleOutcome::Failed("no such message".into())),
                }
            }
            "export" => {
                let queue = self.manager.require(queue_name)?;
                let path = params.get_str_or("path", "");
                let status = params.get("status").and_then(|v| v.as_str()).and_then(MessageStatus::parse);
                let n = queue.export(path, status).await?;
                Ok(ModuleOutcome::Handled(Value::UInt(n as u64)))
            }
            "import" => {
                let queue = self.manager.require(queue_name)?;
                let path = params.get_str_or("path", "");
                let n = queue.import(path).await?;
                Ok(ModuleOutcome::Handled(Value::UInt(n as u64)))
            }
            "register" => {
                // Publishing the queue's virtual address to a directory
                // is a registry operation owned by the scheduler's core
                // module, not by pqueue itself; pqueue only validates
                // the queue exists (spec §4.7 "register (publish the
                // queue's virtual address to a directory)").
                self.manager.require(queue_name)?;
                Ok(ModuleOutcome::HandledNoReply)
            }
            "purge" => {
                let queue = self.manager.require(queue_name)?;
                let n = queue.purge().await?;
                Ok(ModuleOutcome::Handled(Value::UInt(n as u64)))
            }

            _ => Ok(ModuleOutcome::Pass),
        }
    }
}

fn value_from_json(v: serde_json::Value) -> Value {
    serde_json::from_value(v).unwrap_or(Value::Null)
}

/// Daemon task driving every queue's periodic sweep: timeouts/retries,
/// draining `Handled` messages into reply envelopes, and purge — all
/// non-blocking within one `run_step` (spec §4.4 "no preemption within
/// a task's `runStep`").
pub struct PQueueTask {
    manager: Arc<QueueManager>,
    sweep_interval: Duration,
    last_sweep: AtomicI64,
    stopping: AtomicBool,
}

impl PQueueTask {
    pub fn new(manager: Arc<QueueManager>, sweep_interval: Duration) -> Self {
        PQueueTask {
            manager,
            sweep_interval,
            last_sweep: AtomicI64::new(0),
            stopping: AtomicBool::new(false),
        }
    }

    fn due(&self) -> bool {
        let now = now_millis();
        let last = self.last_sweep.load(Ordering::Relaxed);
        now - last >= self.sweep_interval.as_millis() as i64
    }
}

fn now_millis() -> i64 {
    static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(epoch).as_millis() as i64
}

#[async_trait]
impl Task for PQueueTask {
    fn name(&self) -> &str {
        "pqueue-sweep"
    }

    fn is_daemon(&self) -> bool {
        true
    }

    fn needs_run(&self) -> bool {
        !self.stopping.load(Ordering::Relaxed)
    }

    fn request_stop(&mut self) {
        self.stopping.store(true, Ordering::Relaxed);
    }

    async fn run_step(&mut self, ctx: &mut StepContext<'_>) -> NodegridResult<i32> {
        if !self.due() {
            return Ok(0);
        }
        self.last_sweep.store(now_millis(), Ordering::Relaxed);

        let mut moved = 0;
        for queue in self.manager.all() {
            queue.sweep_timeouts().await?;
            let envelopes = queue.drain_handled(ctx.own_address).await?;
            moved += envelopes.len() as i32;
            for env in envelopes {
                ctx.post(env);
            }
            moved += queue.purge().await? as i32;
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryPersistentQueueStore;
    use nodegrid_address::Address;
    use nodegrid_scheduler::RequestIdGenerator;

    fn manager() -> Arc<QueueManager> {
        Arc::new(QueueManager::new(Arc::new(InMemoryPersistentQueueStore::new()), QueueConfig::default()))
    }

    #[tokio::test]
    async fn define_then_put_then_fetch_roundtrips_through_the_module() {
        let manager = manager();
        let module = PQueueModule::new(manager.clone(), Duration::from_millis(10));
        let own = Address::raw("q-node");
        let ids = RequestIdGenerator::new();
        let mut outbox = Vec::new();
        let mut ctx = StepContext::new(&own, &mut outbox, &ids);
        let env = Envelope::request(Address::raw("caller"), own.clone(), 1, "pqueue.define", Value::Null, 0);

        let mut define_params = Value::map();
        define_params.set("queue", Value::from("orders"));
        module.handle_request(&env, "pqueue.define", &define_params, &mut ctx).await.unwrap();

        let mut put_params = Value::map();
        put_params.set("queue", Value::from("orders"));
        put_params.set("command", Value::from("do_thing"));
        let outcome = module.handle_request(&env, "pqueue.put", &put_params, &mut ctx).await.unwrap();
        let ModuleOutcome::Handled(result) = outcome else { panic!("expected Handled") };
        assert!(result.get("message_id").is_some());

        let mut fetch_params = Value::map();
        fetch_params.set("queue", Value::from("orders"));
        fetch_params.set("limit", Value::Int(10));
        let outcome = module.handle_request(&env, "pqueue.fetch", &fetch_params, &mut ctx).await.unwrap();
        let ModuleOutcome::Handled(result) = outcome else { panic!("expected Handled") };
        let list = result.get("msg_list").and_then(|v| v.as_list()).unwrap();
        assert_eq!(list.len(), 1);
    }

    #[tokio::test]
    async fn init_installs_the_sweep_task_exactly_once() {
        let manager = manager();
        let module = PQueueModule::new(manager, Duration::from_millis(10));
        let own = Address::raw("q-node");
        let ids = RequestIdGenerator::new();
        let mut outbox = Vec::new();
        let mut ctx = StepContext::new(&own, &mut outbox, &ids);
        let env = Envelope::request(Address::raw("caller"), own.clone(), 1, "pqueue.init", Value::Null, 0);

        let first = module.handle_request(&env, "pqueue.init", &Value::Null, &mut ctx).await.unwrap();
        assert!(matches!(first, ModuleOutcome::TaskRequest(_)));
        let second = module.handle_request(&env, "pqueue.init", &Value::Null, &mut ctx).await.unwrap();
        assert!(matches!(second, ModuleOutcome::HandledNoReply));
    }

    #[tokio::test]
    async fn sweep_task_drains_handled_messages_into_reply_envelopes() {
        let manager = manager();
        let mut config = QueueConfig::default();
        config.reply_addr = Some(Address::raw("caller"));
        manager.define("orders", Some(config)).await.unwrap();
        let queue = manager.get("orders").unwrap();
        let id = queue.put("do_thing", Value::Null, None, None).await.unwrap();
        let (lock_id, _) = queue.fetch(10).await.unwrap();
        queue.handled(lock_id, id, 0, Some(Value::from("ok")), None).await.unwrap();

        let mut task = PQueueTask::new(manager, Duration::from_millis(0));
        let own = Address::raw("q-node");
        let ids = RequestIdGenerator::new();
        let mut outbox = Vec::new();
        let mut ctx = StepContext::new(&own, &mut outbox, &ids);
        task.run_step(&mut ctx).await.unwrap();

        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].receiver, Address::raw("caller"));
    }
}
