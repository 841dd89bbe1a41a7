//! Worker-side job execution: the `JobWorkerTask` sync-action state
//! machine and the `job_worker.*` command module, grounded in
//! `examples/original_source/libs/grd/include/grd/JobWorkerTask.h`'s
//! `jwtso*` sync-action constants, `jwtSyncStage` enum, and
//! `postJobMessage`/`syncAction` contract.
//!
//! Every sync action is posted to the manager as a fire-and-forget
//! `job.*` request tagged with a worker-local `seq`; the manager acks
//! it back as a fire-and-forget `job_worker.ack` (never a correlated
//! Response — see `crate::manager::JobManagerModule::ack`). A sync
//! action's `before`/`after` phases collapse to "wait until this
//! task's outstanding-ack set is empty" (spec §4.8 "Worker task
//! framework").

use async_trait::async_trait;
use nodegrid_address::Address;
use nodegrid_protocol::Envelope;
use nodegrid_scheduler::{Module, ModuleOutcome, StepContext, Task};
use nodegrid_shared::{NodegridResult, Value};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    None,
    Before,
    Exec,
    After,
}

/// One queued mutation a [`JobWorkerTask`] sends to the manager,
/// matching `jwtso*`'s constant list.
#[derive(Debug, Clone)]
pub enum SyncAction {
    SyncPoint,
    Commit { trans_id: u64, chained: bool },
    Rollback { trans_id: u64, chained: bool },
    AddTempFile { trans_id: u64, name: String, path: String },
    RemoveTempFile { trans_id: u64, name: String },
    EndWork { status: i32, msg: String },
    Post { command: String, params: Value },
}

/// Per-job worker state shared between [`JobWorkerTask`] (drives the
/// state machine) and [`JobWorkerModule`] (receives acks from the
/// manager), mirroring `nodegrid_pqueue`'s manager/sweep-task split.
pub struct JobWorkerState {
    pub job_id: u64,
    pub lock_id: u64,
    pub trans_id: u64,
    pub own_addr: Address,
    pub return_addr: Address,
    pub log_level: u32,
    pub msg_level: u32,
    pub state_vars: BTreeMap<String, Value>,
    next_seq: AtomicI64,
    outstanding: HashSet<i64>,
    stage: SyncStage,
    queue: VecDeque<SyncAction>,
    ended: bool,
}

impl JobWorkerState {
    pub fn new(job_id: u64, lock_id: u64, trans_id: u64, own_addr: Address, return_addr: Address) -> Self {
        JobWorkerState {
            job_id,
            lock_id,
            trans_id,
            own_addr,
            return_addr,
            log_level: 7,
            msg_level: 7,
            state_vars: BTreeMap::new(),
            next_seq: AtomicI64::new(1),
            outstanding: HashSet::new(),
            stage: SyncStage::None,
            queue: VecDeque::new(),
            ended: false,
        }
    }

    fn next_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn is_all_synced(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn in_sync_action(&self) -> bool {
        self.stage != SyncStage::None
    }

    pub fn get_var(&self, name: &str, default: Value) -> Value {
        self.state_vars.get(name).cloned().unwrap_or(default)
    }

    pub fn set_var_local(&mut self, name: impl Into<String>, value: Value) {
        self.state_vars.insert(name.into(), value);
    }

    #[cfg(test)]
    pub fn outstanding_for_test(&self) -> &i64 {
        self.outstanding.iter().next().expect("an outstanding ack")
    }

    #[cfg(test)]
    pub fn ack_for_test(&mut self, seq: i64) {
        self.outstanding.remove(&seq);
    }
}

/// Worker-side counterpart of `JobManager`'s queue task, created by
/// [`JobWorkerModule`] in response to `job_worker.start_work` (spec
/// §4.8 "Worker task framework").
pub struct JobWorkerTask {
    state: Arc<Mutex<JobWorkerState>>,
    stopping: bool,
}

impl JobWorkerTask {
    pub fn new(state: Arc<Mutex<JobWorkerState>>) -> Self {
        JobWorkerTask { state, stopping: false }
    }

    pub fn state(&self) -> Arc<Mutex<JobWorkerState>> {
        self.state.clone()
    }

    /// `syncPoint`: a no-op barrier ensuring every previously queued
    /// action has been acked before whatever comes next.
    pub fn sync_point(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).queue.push_back(SyncAction::SyncPoint);
    }

    pub fn commit_work(&self, chained: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let trans_id = state.trans_id;
        state.queue.push_back(SyncAction::Commit { trans_id, chained });
    }

    pub fn rollback_work(&self, chained: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let trans_id = state.trans_id;
        state.queue.push_back(SyncAction::Rollback { trans_id, chained });
    }

    pub fn add_temp_file(&self, name: impl Into<String>, path: impl Into<String>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let trans_id = state.trans_id;
        state.queue.push_back(SyncAction::AddTempFile { trans_id, name: name.into(), path: path.into() });
    }

    pub fn remove_temp_file(&self, name: impl Into<String>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let trans_id = state.trans_id;
        state.queue.push_back(SyncAction::RemoveTempFile { trans_id, name: name.into() });
    }

    pub fn end_work(&self, status: i32, msg: impl Into<String>) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).queue.push_back(SyncAction::EndWork { status, msg: msg.into() });
    }

    pub fn post(&self, command: impl Into<String>, params: Value) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).queue.push_back(SyncAction::Post { command: command.into(), params });
    }

    fn envelopes_for(state: &mut JobWorkerState, action: &SyncAction) -> Vec<Envelope> {
        let seq = state.next_seq();
        state.outstanding.insert(seq);

        let mut base = Value::map();
        base.set("job_id", Value::UInt(state.job_id));
        base.set("lock_id", Value::UInt(state.lock_id));
        base.set("seq", Value::Int(seq));
        base.set("return_addr", Value::from(state.own_addr.to_wire_string()));

        let (command, params) = match action {
            SyncAction::SyncPoint => ("job.sync_point".to_string(), base),
            SyncAction::Commit { trans_id, chained } => {
                let mut p = base;
                p.set("trans_id", Value::UInt(*trans_id));
                p.set("chained", Value::Bool(*chained));
                ("job.commit_work".to_string(), p)
            }
            SyncAction::Rollback { trans_id, chained } => {
                let mut p = base;
                p.set("trans_id", Value::UInt(*trans_id));
                p.set("chained", Value::Bool(*chained));
                ("job.rollback_work".to_string(), p)
            }
            SyncAction::AddTempFile { trans_id, name, path } => {
                let mut p = base;
                p.set("trans_id", Value::UInt(*trans_id));
                p.set("name", Value::from(name.clone()));
                p.set("path", Value::from(path.clone()));
                ("job.reg_temp_file".to_string(), p)
            }
            SyncAction::RemoveTempFile { trans_id, name } => {
                let mut p = base;
                p.set("trans_id", Value::UInt(*trans_id));
                p.set("name", Value::from(name.clone()));
                ("job.unreg_temp_file".to_string(), p)
            }
            SyncAction::EndWork { status, msg } => {
                let mut p = base;
                p.set("status", Value::Int(*status as i64));
                p.set("msg", Value::from(msg.clone()));
                ("job.ended".to_string(), p)
            }
            SyncAction::Post { command, params } => {
                let mut p = base;
                for (k, v) in params.as_map().cloned().unwrap_or_default() {
                    p.set(k, v);
                }
                (command.clone(), p)
            }
        };
        vec![Envelope::request(state.own_addr.clone(), state.return_addr.clone(), 0, command, params, 0)]
    }
}

#[async_trait]
impl Task for JobWorkerTask {
    fn name(&self) -> &str {
        "job-worker"
    }

    fn needs_run(&self) -> bool {
        !self.stopping
    }

    fn request_stop(&mut self) {
        self.stopping = true;
    }

    async fn run_step(&mut self, ctx: &mut StepContext<'_>) -> NodegridResult<i32> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if !state.is_all_synced() {
            return Ok(0);
        }
        if state.stage == SyncStage::After {
            state.stage = SyncStage::None;
        }

        let Some(action) = state.queue.pop_front() else {
            if state.ended {
                self.stopping = true;
            }
            return Ok(0);
        };

        if matches!(action, SyncAction::EndWork { .. }) {
            state.ended = true;
        }

        state.stage = SyncStage::Exec;
        let envelopes = Self::envelopes_for(&mut state, &action);
        state.stage = SyncStage::After;
        drop(state);

        for env in envelopes {
            ctx.post(env);
        }
        Ok(1)
    }
}

/// The worker-side `job_worker.*` command module: installs
/// [`JobWorkerTask`] on `start_work`, routes the manager's acks back
/// into the matching task's shared state.
pub struct JobWorkerModule {
    states: dashmap::DashMap<u64, Arc<Mutex<JobWorkerState>>>,
}

impl JobWorkerModule {
    pub fn new() -> Self {
        JobWorkerModule { states: dashmap::DashMap::new() }
    }
}

impl Default for JobWorkerModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for JobWorkerModule {
    fn name(&self) -> &str {
        "job_worker"
    }

    fn interfaces(&self) -> &[&str] {
        &["job_worker"]
    }

    async fn handle_request(&self, _envelope: &Envelope, command: &str, params: &Value, ctx: &mut StepContext<'_>) -> NodegridResult<ModuleOutcome> {
        let verb = command.strip_prefix("job_worker.").unwrap_or(command);
        match verb {
            "start_work" => {
                let job_id = params.get_i64_or("job_id", 0) as u64;
                let lock_id = params.get_i64_or("lock_id", 0) as u64;
                let trans_id = params.get_i64_or("trans_id", 0) as u64;
                let return_addr = Address::raw(params.get_str_or("return_addr", ""));
                let own = ctx.own_address.clone();

                let state = Arc::new(Mutex::new(JobWorkerState::new(job_id, lock_id, trans_id, own.clone(), return_addr.clone())));
                self.states.insert(job_id, state.clone());

                let mut ack = Value::map();
                ack.set("job_id", Value::UInt(job_id));
                ack.set("lock_id", Value::UInt(lock_id));
                ack.set("worker_addr", Value::from(own.to_wire_string()));
                ctx.post(Envelope::request(own, return_addr, 0, "job.worker_started", ack, 0));

                Ok(ModuleOutcome::TaskRequest(Box::new(JobWorkerTask::new(state))))
            }
            "ack" => {
                let job_id = params.get_i64_or("job_id", 0) as u64;
                let seq = params.get_i64_or("seq", 0);
                if let Some(state) = self.states.get(&job_id) {
                    state.lock().unwrap_or_else(|e| e.into_inner()).outstanding.remove(&seq);
                }
                Ok(ModuleOutcome::HandledNoReply)
            }
            _ => Ok(ModuleOutcome::Pass),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodegrid_scheduler::RequestIdGenerator;

    fn ctx<'a>(own: &'a Address, outbox: &'a mut Vec<Envelope>, ids: &'a RequestIdGenerator) -> StepContext<'a> {
        StepContext::new(own, outbox, ids)
    }

    #[tokio::test]
    async fn start_work_installs_task_and_acks_manager() {
        let module = JobWorkerModule::new();
        let own = Address::raw("worker-1");
        let ids = RequestIdGenerator::new();
        let mut outbox = Vec::new();
        let mut c = ctx(&own, &mut outbox, &ids);
        let env = Envelope::request(Address::raw("mgr"), own.clone(), 0, "job_worker.start_work", Value::Null, 0);

        let mut params = Value::map();
        params.set("job_id", Value::UInt(1));
        params.set("lock_id", Value::UInt(5));
        params.set("return_addr", Value::from("mgr"));
        let outcome = module.handle_request(&env, "job_worker.start_work", &params, &mut c).await.unwrap();
        assert!(matches!(outcome, ModuleOutcome::TaskRequest(_)));
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].receiver, Address::raw("mgr"));
    }

    #[tokio::test]
    async fn task_waits_for_ack_before_running_next_action() {
        let state = Arc::new(Mutex::new(JobWorkerState::new(1, 1, 0, Address::raw("worker-1"), Address::raw("mgr"))));
        let mut task = JobWorkerTask::new(state.clone());
        task.commit_work(false);
        task.end_work(0, "done");

        let own = Address::raw("worker-1");
        let ids = RequestIdGenerator::new();
        let mut outbox = Vec::new();
        let mut c = ctx(&own, &mut outbox, &ids);

        let n = task.run_step(&mut c).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(outbox.len(), 1);

        // Second action is blocked until the first is acked.
        let n = task.run_step(&mut c).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(outbox.len(), 1);

        let seq = {
            let s = state.lock().unwrap();
            *s.outstanding.iter().next().unwrap()
        };
        state.lock().unwrap().outstanding.remove(&seq);

        let n = task.run_step(&mut c).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(outbox.len(), 2);
        assert!(task.needs_run());
    }
}
