//! `JobManager`, the `job.*` wire module, and the per-queue sweep task,
//! grounded in
//! `examples/original_source/libs/grd/include/grd/JobManagerModule.h`'s
//! command list and `JobQueueTask.h`'s queue lifecycle, expressed
//! through `nodegrid-scheduler`'s `Module`/`Task` traits the way
//! `nodegrid_pqueue::queue_task` does for `pqueue.*`.

use crate::definition::{resolve_params, JobDefinition, JobParamClass};
use crate::instance::{JobInstance, JobStatus};
use crate::store::{JobLogEntry, JobStore, LogSeverity};
use crate::transaction::{JobResource, JobTransaction, ResType, SafeRootList};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use nodegrid_address::Address;
use nodegrid_protocol::Envelope;
use nodegrid_scheduler::{Module, ModuleOutcome, StepContext, Task};
use nodegrid_shared::{NodegridError, NodegridResult, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A started queue's activation/timeout/purge configuration (spec §4.8
/// "Job queues run as tasks").
#[derive(Debug, Clone)]
pub struct QueueRuntime {
    pub target_addr: Address,
    pub return_addr: Address,
    pub purge_interval_ms: i64,
    pub purge_check_interval_ms: i64,
}

/// Restart-safe job runtime: definitions, started queues, and the
/// in-memory job table backed by a [`JobStore`] (spec §4.8).
pub struct JobManager {
    store: Arc<dyn JobStore>,
    safe_roots: SafeRootList,
    definitions: DashMap<String, JobDefinition>,
    next_def_id: AtomicU64,
    queues: DashMap<String, QueueRuntime>,
    jobs: DashMap<u64, Mutex<JobInstance>>,
    next_job_id: AtomicU64,
    next_trans_id: AtomicU64,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>, safe_roots: SafeRootList) -> Self {
        JobManager {
            store,
            safe_roots,
            definitions: DashMap::new(),
            next_def_id: AtomicU64::new(1),
            queues: DashMap::new(),
            jobs: DashMap::new(),
            next_job_id: AtomicU64::new(1),
            next_trans_id: AtomicU64::new(1),
        }
    }

    // ---- definitions --------------------------------------------------

    pub async fn define(
        &self,
        name: &str,
        base: Option<String>,
        command: &str,
        sys_params: BTreeMap<String, Value>,
        job_params: BTreeMap<String, Value>,
    ) -> NodegridResult<u64> {
        let id = self.next_def_id.fetch_add(1, Ordering::SeqCst);
        let mut def = JobDefinition::new(id, name, base, command);
        for (k, v) in sys_params {
            def.set_param(k, JobParamClass::Sys, v);
        }
        for (k, v) in job_params {
            def.set_param(k, JobParamClass::Job, v);
        }
        self.store.save_definition(&def).await?;
        self.definitions.insert(name.to_string(), def);
        Ok(id)
    }

    pub async fn change_def(&self, name: &str, params: BTreeMap<String, Value>) -> NodegridResult<()> {
        let mut entry = self
            .definitions
            .get_mut(name)
            .ok_or_else(|| NodegridError::WrongParams(format!("no such job definition: {name}")))?;
        for (k, v) in params {
            let class = entry.params.get(&k).map(|p| p.class).unwrap_or(JobParamClass::Job);
            entry.set_param(k, class, v);
        }
        self.store.save_definition(&entry).await?;
        Ok(())
    }

    pub async fn remove_def(&self, name: &str) -> NodegridResult<()> {
        self.store.remove_definition(name).await?;
        self.definitions.remove(name);
        Ok(())
    }

    pub fn list_defs(&self, filter: &str) -> Vec<String> {
        self.definitions
            .iter()
            .map(|e| e.key().clone())
            .filter(|name| filter.is_empty() || name.contains(filter))
            .collect()
    }

    pub fn desc_def(&self, name: &str) -> NodegridResult<JobDefinition> {
        self.definitions
            .get(name)
            .map(|e| e.clone())
            .ok_or_else(|| NodegridError::WrongParams(format!("no such job definition: {name}")))
    }

    fn require_def(&self, name: &str) -> NodegridResult<JobDefinition> {
        self.desc_def(name)
    }

    // ---- queues ---------------------------------------------------------

    /// `start_queue`: reload persisted jobs for this queue, bump stale
    /// in-flight jobs' lock and demote them (spec §4.8 "On start_queue").
    pub async fn start_queue(&self, name: &str, runtime: QueueRuntime) -> NodegridResult<()> {
        let persisted = self.store.load_instances(name).await?;
        for mut job in persisted {
            match job.status {
                JobStatus::Submitted => {
                    job.lock_id += 1;
                    job.set_status(JobStatus::Ready);
                }
                JobStatus::Running => {
                    job.lock_id += 1;
                    job.set_status(JobStatus::Sleep);
                }
                _ => {}
            }
            self.store.save_instance(&job).await?;
            self.jobs.insert(job.id, Mutex::new(job));
        }
        self.queues.insert(name.to_string(), runtime);
        Ok(())
    }

    /// `stop_queue`: demote running jobs to `sleep` and drop the queue's
    /// runtime entry; jobs stay in the in-memory table until purged.
    pub async fn stop_queue(&self, name: &str) -> NodegridResult<()> {
        for entry in self.jobs.iter() {
            let mut job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
            if job.queue == name && job.status == JobStatus::Running {
                job.lock_id += 1;
                job.set_status(JobStatus::Sleep);
                self.store.save_instance(&job).await?;
            }
        }
        self.queues.remove(name);
        Ok(())
    }

    pub fn list_queues(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    pub fn list_jobs(&self, queue: &str) -> Vec<(u64, JobStatus, Option<String>)> {
        self.jobs
            .iter()
            .filter_map(|e| {
                let job = e.value().lock().unwrap_or_else(|e| e.into_inner());
                (job.queue == queue).then(|| (job.id, job.status, job.worker_addr.clone()))
            })
            .collect()
    }

    fn queue_runtime(&self, name: &str) -> NodegridResult<QueueRuntime> {
        self.queues.get(name).map(|e| e.clone()).ok_or_else(|| NodegridError::WrongParams(format!("queue not started: {name}")))
    }

    // ---- job instance lifecycle ------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        &self,
        def_name: &str,
        queue: &str,
        overrides: &Value,
        job_timeout_ms: u64,
        trans_timeout_ms: u64,
        retry_limit: u32,
        trans_sup: bool,
        start_paused: bool,
    ) -> NodegridResult<u64> {
        let def = self.require_def(def_name)?;
        let base = def.base.as_deref().and_then(|b| self.definitions.get(b).map(|e| e.clone()));
        let params = resolve_params(base.as_ref(), &def, overrides);

        let id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let job = JobInstance::new(id, def.id, queue, &def.command, params, job_timeout_ms, trans_timeout_ms, retry_limit, trans_sup, start_paused);
        self.store.save_instance(&job).await?;
        self.jobs.insert(id, Mutex::new(job));
        Ok(id)
    }

    fn job_mut<'a>(&'a self, job_id: u64) -> NodegridResult<dashmap::mapref::one::Ref<'a, u64, Mutex<JobInstance>>> {
        self.jobs.get(&job_id).ok_or_else(|| NodegridError::WrongParams(format!("no such job: {job_id}")))
    }

    /// `job.ended`: worker reports normal completion. Commits any open
    /// transaction, sets `ended`. Stale `lock_id`s are logged and
    /// ignored (spec §4.8 "Job activation", E5).
    pub async fn ended(&self, job_id: u64, lock_id: u64, own: &Address, ctx: &mut StepContext<'_>) -> NodegridResult<()> {
        let entry = self.job_mut(job_id)?;
        let (trans_id, current_lock) = {
            let job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
            (job.current_trans_id, job.lock_id)
        };
        if lock_id != current_lock {
            self.log(job_id, LogSeverity::Warning, 0, format!("stale job.ended ack lock_id={lock_id} current={current_lock}"), own, ctx).await?;
            return Ok(());
        }
        if trans_id != 0 {
            self.commit_locked(&entry, trans_id, false).await?;
        }
        let mut job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
        job.set_status(JobStatus::Ended);
        self.store.save_instance(&job).await
    }

    /// `job.restart`: start over from scratch, discarding all pending
    /// work (spec §4.8 "Restart/return").
    pub async fn restart(&self, job_id: u64) -> NodegridResult<()> {
        self.rollback_all_pending(job_id).await?;
        self.store.remove_all_state(job_id).await?;
        let entry = self.job_mut(job_id)?;
        let mut job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
        job.lock_id += 1;
        job.worker_addr = None;
        job.current_trans_id = 0;
        job.started_at = None;
        job.trans_started_at = None;
        job.set_status(JobStatus::Ready);
        self.store.save_instance(&job).await
    }

    /// `job.return`: abort in-flight work and send the job back to
    /// `ready`, keeping accumulated retries (spec §4.8).
    pub async fn return_job(&self, job_id: u64) -> NodegridResult<()> {
        {
            let entry = self.job_mut(job_id)?;
            let status = entry.value().lock().unwrap_or_else(|e| e.into_inner()).status;
            if !status.returnable() {
                return Err(NodegridError::WrongParams(format!("job {job_id} not returnable from {status:?}")));
            }
        }
        self.rollback_all_pending(job_id).await?;
        let entry = self.job_mut(job_id)?;
        let mut job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
        job.lock_id += 1;
        job.worker_addr = None;
        job.current_trans_id = 0;
        job.trans_started_at = None;
        job.set_status(JobStatus::Ready);
        self.store.save_instance(&job).await
    }

    /// `job.stop`: same as `return`, but the final status is `aborted`
    /// (no reactivation).
    pub async fn stop(&self, job_id: u64) -> NodegridResult<()> {
        {
            let entry = self.job_mut(job_id)?;
            let status = entry.value().lock().unwrap_or_else(|e| e.into_inner()).status;
            if !status.returnable() {
                return Err(NodegridError::WrongParams(format!("job {job_id} not stoppable from {status:?}")));
            }
        }
        self.rollback_all_pending(job_id).await?;
        let entry = self.job_mut(job_id)?;
        let mut job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
        job.lock_id += 1;
        job.worker_addr = None;
        job.current_trans_id = 0;
        job.trans_started_at = None;
        job.set_status(JobStatus::Aborted);
        self.store.save_instance(&job).await
    }

    /// `job.purge`: wipe a job's work products and history, leaving a
    /// `purged` husk (spec §4.8 "Restart/return/stop/purge").
    pub async fn purge(&self, job_id: u64) -> NodegridResult<()> {
        {
            let entry = self.job_mut(job_id)?;
            let status = entry.value().lock().unwrap_or_else(|e| e.into_inner()).status;
            if !status.purgeable() {
                return Err(NodegridError::WrongParams(format!("job {job_id} not purgeable from {status:?}")));
            }
        }
        self.purge_job_products(job_id).await?;
        let entry = self.job_mut(job_id)?;
        let mut job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
        job.set_status(JobStatus::Purged);
        self.store.save_instance(&job).await
    }

    /// `job.pause(wait)`: `wait=false` rolls back to the last commit
    /// point immediately; `wait=true` pauses without disturbing the
    /// current transaction, so the next commit becomes the pause point
    /// (SPEC_FULL §4.8 addendum, grounded in `JobManagerModule.h`'s
    /// `job.pause <wait=true|false>`).
    pub async fn pause(&self, job_id: u64, wait: bool) -> NodegridResult<()> {
        if !wait {
            self.rollback_current(job_id).await?;
        }
        let entry = self.job_mut(job_id)?;
        let mut job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
        job.set_status(JobStatus::Paused);
        self.store.save_instance(&job).await
    }

    /// `job.resume`: reactivate a paused job from its last exec point.
    pub async fn resume(&self, job_id: u64) -> NodegridResult<()> {
        let entry = self.job_mut(job_id)?;
        let mut job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
        if job.status != JobStatus::Paused {
            return Err(NodegridError::WrongParams(format!("job {job_id} is not paused")));
        }
        job.lock_id += 1;
        job.set_status(JobStatus::Ready);
        self.store.save_instance(&job).await
    }

    // ---- state / resources / transactions --------------------------------

    pub async fn get_state(&self, job_id: u64) -> NodegridResult<BTreeMap<String, Value>> {
        self.store.get_state_vars(job_id, 0).await
    }

    pub async fn set_vars(&self, job_id: u64, trans_id: u64, vars: BTreeMap<String, Value>) -> NodegridResult<()> {
        for (name, value) in vars {
            self.store.set_state_var(job_id, trans_id, &name, value).await?;
        }
        Ok(())
    }

    /// `job.disp_vars`: post current base state vars to the job's
    /// configured `msg_addr` (falling back to `worker_addr`), gated by
    /// `msg_level != 0` (SPEC_FULL §4.8 addendum).
    pub async fn disp_vars(&self, job_id: u64, own: &Address, ctx: &mut StepContext<'_>) -> NodegridResult<()> {
        let entry = self.job_mut(job_id)?;
        let (msg_level, msg_addr, submitter) = {
            let job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
            (job.msg_level, job.msg_addr.clone(), job.worker_addr.clone())
        };
        if msg_level == 0 {
            return Ok(());
        }
        let vars = self.store.get_state_vars(job_id, 0).await?;
        let mut payload = Value::map();
        payload.set("job_id", Value::UInt(job_id));
        let mut vars_value = Value::map();
        for (k, v) in vars {
            vars_value.set(k, v);
        }
        payload.set("vars", vars_value);
        let target = msg_addr.or(submitter).map(Address::raw).unwrap_or_else(|| own.clone());
        ctx.post(Envelope::request(own.clone(), target, 0, "job.disp_vars", payload, 0));
        Ok(())
    }

    pub async fn alloc_res(&self, job_id: u64, trans_id: u64, name: &str, res_type: ResType, path: &str) -> NodegridResult<()> {
        self.store
            .alloc_resource(JobResource { job_id, trans_id, name: name.to_string(), res_path: path.to_string(), res_type })
            .await
    }

    pub async fn dealloc_res(&self, job_id: u64, trans_id: u64, name: &str) -> NodegridResult<bool> {
        Ok(self.store.dealloc_resource(job_id, trans_id, name).await?.is_some())
    }

    /// `job.commit`: per-entry helper shared by `ended()`.
    pub async fn commit(&self, job_id: u64, trans_id: u64, chained: bool) -> NodegridResult<Option<u64>> {
        let entry = self.job_mut(job_id)?;
        self.commit_locked(&entry, trans_id, chained).await
    }

    async fn commit_locked(
        &self,
        entry: &dashmap::mapref::one::Ref<'_, u64, Mutex<JobInstance>>,
        trans_id: u64,
        chained: bool,
    ) -> NodegridResult<Option<u64>> {
        self.store.copy_trans_state_to_base(entry.key().to_owned(), trans_id).await?;
        self.store.remove_trans_state(entry.key().to_owned(), trans_id).await?;
        self.process_allocations(entry.key().to_owned(), trans_id, ResType::delete_on_commit).await?;
        self.store.close_transaction(trans_id).await?;

        let new_trans = if chained { Some(self.open_transaction(entry.key().to_owned()).await?) } else { None };
        let mut job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
        job.current_trans_id = new_trans.unwrap_or(0);
        job.trans_started_at = new_trans.map(|_| Utc::now());
        self.store.save_instance(&job).await?;
        Ok(new_trans)
    }

    pub async fn rollback(&self, job_id: u64, trans_id: u64, chained: bool) -> NodegridResult<Option<u64>> {
        let entry = self.job_mut(job_id)?;
        self.rollback_locked(&entry, trans_id, chained).await
    }

    async fn rollback_locked(
        &self,
        entry: &dashmap::mapref::one::Ref<'_, u64, Mutex<JobInstance>>,
        trans_id: u64,
        chained: bool,
    ) -> NodegridResult<Option<u64>> {
        self.store.remove_trans_state(entry.key().to_owned(), trans_id).await?;
        self.process_allocations(entry.key().to_owned(), trans_id, ResType::delete_on_rollback).await?;
        self.store.close_transaction(trans_id).await?;

        let new_trans = if chained { Some(self.open_transaction(entry.key().to_owned()).await?) } else { None };
        let mut job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
        job.current_trans_id = new_trans.unwrap_or(0);
        job.trans_started_at = new_trans.map(|_| Utc::now());
        self.store.save_instance(&job).await?;
        Ok(new_trans)
    }

    async fn open_transaction(&self, job_id: u64) -> NodegridResult<u64> {
        let trans_id = self.next_trans_id.fetch_add(1, Ordering::SeqCst);
        self.store.open_transaction(&JobTransaction::new(trans_id, job_id)).await?;
        Ok(trans_id)
    }

    /// Delete (or retain) each allocated resource of `trans_id` per
    /// `keep(res_type)`, respecting the safe-root allow-list (spec §8
    /// invariant 7 "Safe purge").
    async fn process_allocations(&self, job_id: u64, trans_id: u64, delete_if: fn(ResType) -> bool) -> NodegridResult<()> {
        let resources = self.store.resources_for_trans(job_id, trans_id).await?;
        for res in resources {
            if delete_if(res.res_type) && self.safe_roots.is_safe(&res.res_path) {
                let _ = std::fs::remove_file(&res.res_path);
            }
            self.store.dealloc_resource(job_id, trans_id, &res.name).await?;
        }
        Ok(())
    }

    async fn rollback_all_pending(&self, job_id: u64) -> NodegridResult<()> {
        for trans in self.store.open_transactions_for_job(job_id).await? {
            let entry = self.job_mut(job_id)?;
            self.rollback_locked(&entry, trans.trans_id, false).await?;
        }
        Ok(())
    }

    async fn rollback_current(&self, job_id: u64) -> NodegridResult<()> {
        let trans_id = {
            let entry = self.job_mut(job_id)?;
            entry.value().lock().unwrap_or_else(|e| e.into_inner()).current_trans_id
        };
        if trans_id != 0 {
            let entry = self.job_mut(job_id)?;
            self.rollback_locked(&entry, trans_id, false).await?;
        }
        Ok(())
    }

    /// Rollback pending, remove all allocations regardless of type,
    /// clear state vars, transactions and log (spec §4.8 "purge").
    async fn purge_job_products(&self, job_id: u64) -> NodegridResult<()> {
        self.rollback_all_pending(job_id).await?;
        for res in self.store.remove_all_resources(job_id).await? {
            if self.safe_roots.is_safe(&res.res_path) {
                let _ = std::fs::remove_file(&res.res_path);
            }
        }
        self.store.remove_all_state(job_id).await?;
        self.store.clear_log(job_id).await?;
        Ok(())
    }

    /// Appends a `job_log` row and, when `log_level` admits `severity`,
    /// notifies the job's configured `log_addr` (falling back to
    /// `worker_addr`) with the same entry (SPEC_FULL §3/§4.8 addendum).
    pub async fn log(
        &self,
        job_id: u64,
        severity: LogSeverity,
        code: i32,
        text: String,
        own: &Address,
        ctx: &mut StepContext<'_>,
    ) -> NodegridResult<()> {
        self.store.append_log(JobLogEntry { job_id, severity, code, text: text.clone(), added_at: Utc::now() }).await?;

        let (log_level, log_addr, worker_addr) = match self.jobs.get(&job_id) {
            Some(entry) => {
                let job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
                (job.log_level, job.log_addr.clone(), job.worker_addr.clone())
            }
            None => return Ok(()),
        };
        if log_level & severity.bit() == 0 {
            return Ok(());
        }
        let Some(target) = log_addr.or(worker_addr) else {
            return Ok(());
        };
        let mut payload = Value::map();
        payload.set("job_id", Value::UInt(job_id));
        payload.set("severity", Value::from(severity.as_str()));
        payload.set("code", Value::Int(code as i64));
        payload.set("text", Value::from(text));
        ctx.post(Envelope::request(own.clone(), Address::raw(target), 0, "job.log_text", payload, 0));
        Ok(())
    }

    // ---- sweeps ------------------------------------------------------------

    /// Activate every `ready` job on `queue`: send `job_worker.start_work`
    /// to the queue's `target_addr`, mark `submitted` (spec §4.8 "Job
    /// activation").
    pub async fn activate_ready(&self, queue: &str, own: &Address) -> NodegridResult<Vec<Envelope>> {
        let runtime = self.queue_runtime(queue)?;
        let mut envelopes = Vec::new();
        for entry in self.jobs.iter() {
            let mut job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
            if job.queue != queue || job.status != JobStatus::Ready {
                continue;
            }
            if job.trans_sup && job.current_trans_id == 0 {
                let trans_id = self.open_transaction(job.id).await?;
                job.current_trans_id = trans_id;
                job.trans_started_at = Some(Utc::now());
            }
            job.set_status(JobStatus::Submitted);
            job.started_at.get_or_insert(Utc::now());
            self.store.save_instance(&job).await?;

            let mut params = Value::map();
            params.set("job_id", Value::UInt(job.id));
            params.set("lock_id", Value::UInt(job.lock_id));
            params.set("command", Value::from(job.command.clone()));
            params.set("trans_id", Value::UInt(job.current_trans_id));
            let mut params_value = Value::map();
            for (k, v) in &job.params {
                params_value.set(k.clone(), v.clone());
            }
            params.set("params", params_value);
            params.set("return_addr", Value::from(runtime.return_addr.to_wire_string()));
            envelopes.push(Envelope::request(own.clone(), runtime.target_addr.clone(), 0, "job_worker.start_work", params, 0));
        }
        Ok(envelopes)
    }

    /// Worker ack for `job_worker.start_work`: moves `submitted` to
    /// `running` and records the worker's address; stale locks are
    /// logged and ignored (spec §4.8, E5).
    pub async fn worker_started(
        &self,
        job_id: u64,
        lock_id: u64,
        worker_addr: &str,
        own: &Address,
        ctx: &mut StepContext<'_>,
    ) -> NodegridResult<()> {
        let entry = self.job_mut(job_id)?;
        let mut job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
        if job.lock_id != lock_id {
            drop(job);
            self.log(job_id, LogSeverity::Warning, 0, format!("stale start_work ack lock_id={lock_id}"), own, ctx).await?;
            return Ok(());
        }
        job.worker_addr = Some(worker_addr.to_string());
        job.set_status(JobStatus::Running);
        self.store.save_instance(&job).await
    }

    /// Timeout sweep (spec §4.8 "Timeout sweep"): job-level timeout
    /// since `started_at`, transaction-level timeout since
    /// `trans_started_at`.
    pub async fn sweep_timeouts(&self, queue: &str) -> NodegridResult<u32> {
        let mut job_ids = Vec::new();
        for entry in self.jobs.iter() {
            let job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
            if job.queue == queue && matches!(job.status, JobStatus::Submitted | JobStatus::Running | JobStatus::Sleep) {
                job_ids.push(job.id);
            }
        }

        let mut acted = 0;
        for job_id in job_ids {
            let (job_timed_out, trans_timed_out, retry_left) = {
                let entry = self.job_mut(job_id)?;
                let job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
                let job_timed_out = job.job_timeout_ms > 0 && job.ms_since_started().is_some_and(|ms| ms as u64 >= job.job_timeout_ms);
                let trans_timed_out =
                    job.trans_timeout_ms > 0 && job.ms_since_trans_started().is_some_and(|ms| ms as u64 >= job.trans_timeout_ms);
                (job_timed_out, trans_timed_out, job.retry_left)
            };

            if job_timed_out {
                if retry_left > 0 {
                    self.decrement_retry(job_id).await?;
                    self.restart(job_id).await?;
                } else {
                    self.stop(job_id).await?;
                }
                acted += 1;
            } else if trans_timed_out {
                if retry_left > 0 {
                    self.decrement_retry(job_id).await?;
                    self.return_job(job_id).await?;
                } else {
                    self.stop(job_id).await?;
                }
                acted += 1;
            }
        }
        Ok(acted)
    }

    async fn decrement_retry(&self, job_id: u64) -> NodegridResult<()> {
        let entry = self.job_mut(job_id)?;
        let mut job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
        job.retry_left = job.retry_left.saturating_sub(1);
        self.store.save_instance(&job).await
    }

    /// Global purge sweep (spec §4.8 "Global purge sweep"): fully purge
    /// and delete `ended|aborted|purged` jobs older than
    /// `purge_interval_ms`.
    pub async fn sweep_purge(&self, queue: &str) -> NodegridResult<u32> {
        let runtime = self.queue_runtime(queue)?;
        let mut stale = Vec::new();
        for entry in self.jobs.iter() {
            let job = entry.value().lock().unwrap_or_else(|e| e.into_inner());
            if job.queue != queue || !job.status.purgeable() {
                continue;
            }
            let age_ms = (Utc::now() - job.updated_at).num_milliseconds();
            if age_ms >= runtime.purge_interval_ms {
                stale.push(job.id);
            }
        }

        let mut purged = 0;
        for job_id in stale {
            self.purge_job_products(job_id).await?;
            self.store.remove_instance(job_id).await?;
            self.jobs.remove(&job_id);
            purged += 1;
        }
        Ok(purged)
    }
}

/// The `job.*` command module, matching `JobManagerModule.h`'s command
/// surface through `nodegrid_jobs::JobManager`. Installed in the queue
/// manager process only (worker-side ack handling lives in
/// `crate::worker_task`).
pub struct JobManagerModule {
    manager: Arc<JobManager>,
    task_installed: AtomicBool,
    sweep_interval: Duration,
}

impl JobManagerModule {
    pub fn new(manager: Arc<JobManager>, sweep_interval: Duration) -> Self {
        JobManagerModule { manager, task_installed: AtomicBool::new(false), sweep_interval }
    }

    fn params_map(params: &Value, key: &str) -> BTreeMap<String, Value> {
        params
            .get(key)
            .and_then(|v| v.as_map())
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default()
    }

    /// Ack a worker-posted sync action by name (`job_worker.ack`),
    /// echoing the `seq` the worker tagged it with (spec §9 design
    /// note: no `RequestHandler` slot exists for a task-owned request,
    /// so every "reply" crosses the wire as a fresh fire-and-forget
    /// request instead of a correlated Response).
    fn ack(&self, job_id: u64, params: &Value, result: Value, ctx: &mut StepContext<'_>) {
        let return_addr = params.get_str_or("return_addr", "");
        if return_addr.is_empty() {
            return;
        }
        let seq = params.get_i64_or("seq", 0);
        let mut ack = Value::map();
        ack.set("job_id", Value::UInt(job_id));
        ack.set("seq", Value::Int(seq));
        ack.set("result", result);
        ctx.post(Envelope::request(ctx.own_address.clone(), Address::raw(return_addr), 0, "job_worker.ack", ack, 0));
    }
}

#[async_trait]
impl Module for JobManagerModule {
    fn name(&self) -> &str {
        "job"
    }

    fn interfaces(&self) -> &[&str] {
        &["job"]
    }

    async fn handle_request(&self, _envelope: &Envelope, command: &str, params: &Value, ctx: &mut StepContext<'_>) -> NodegridResult<ModuleOutcome> {
        let verb = command.strip_prefix("job.").unwrap_or(command);
        let m = &self.manager;

        match verb {
            "init_manager" => Ok(if self.task_installed.swap(true, Ordering::SeqCst) {
                ModuleOutcome::HandledNoReply
            } else {
                ModuleOutcome::TaskRequest(Box::new(JobSweepTask::new(m.clone(), self.sweep_interval)))
            }),

            "define" => {
                let name = params.get_str_or("name", "");
                let base = params.get("base").and_then(|v| v.as_str()).map(str::to_string);
                let command = params.get_str_or("command", "");
                let id = m.define(name, base, command, Self::params_map(params, "sys_params"), Self::params_map(params, "job_params")).await?;
                let mut result = Value::map();
                result.set("def_id", Value::UInt(id));
                Ok(ModuleOutcome::Handled(result))
            }
            "change_def" => {
                m.change_def(params.get_str_or("name", ""), Self::params_map(params, "params")).await?;
                Ok(ModuleOutcome::HandledNoReply)
            }
            "remove_def" => {
                m.remove_def(params.get_str_or("name", "")).await?;
                Ok(ModuleOutcome::HandledNoReply)
            }
            "list_defs" => {
                let filter = params.get_str_or("filter", "");
                Ok(ModuleOutcome::Handled(Value::List(m.list_defs(filter).into_iter().map(Value::String).collect())))
            }
            "desc_def" => {
                let def = m.desc_def(params.get_str_or("name", ""))?;
                Ok(ModuleOutcome::Handled(serde_json::to_value(&def).ok().map(value_from_json).unwrap_or(Value::Null)))
            }

            "start_queue" => {
                let name = params.get_str_or("name", "");
                let runtime = QueueRuntime {
                    target_addr: Address::raw(params.get_str_or("target", "")),
                    return_addr: Address::raw(params.get_str_or("return", "")),
                    purge_interval_ms: params.get_i64_or("purge_interval_ms", 65 * 24 * 3_600_000),
                    purge_check_interval_ms: params.get_i64_or("purge_check_interval_ms", 60_000),
                };
                m.start_queue(name, runtime).await?;
                Ok(ModuleOutcome::HandledNoReply)
            }
            "stop_queue" => {
                m.stop_queue(params.get_str_or("name", "")).await?;
                Ok(ModuleOutcome::HandledNoReply)
            }
            "list_queues" => Ok(ModuleOutcome::Handled(Value::List(m.list_queues().into_iter().map(Value::String).collect()))),
            "list_jobs" => {
                let rows = m.list_jobs(params.get_str_or("name", ""));
                Ok(ModuleOutcome::Handled(Value::List(
                    rows.into_iter()
                        .map(|(id, status, worker)| {
                            let mut v = Value::map();
                            v.set("job_id", Value::UInt(id));
                            v.set("status", Value::from(status.as_str()));
                            v.set("worker_addr", worker.map(Value::from).unwrap_or(Value::Null));
                            v
                        })
                        .collect(),
                )))
            }

            "start" => {
                let overrides = params.get("params").cloned().unwrap_or(Value::Null);
                let job_id = m
                    .start(
                        params.get_str_or("name", ""),
                        params.get_str_or("queue", ""),
                        &overrides,
                        params.get_i64_or("job_timeout", 0) as u64,
                        params.get_i64_or("trans_timeout", 0) as u64,
                        params.get_i64_or("retry_limit", 0) as u32,
                        params.get_bool_or("trans_sup", false),
                        params.get_bool_or("start_paused", false),
                    )
                    .await?;
                let mut result = Value::map();
                result.set("job_id", Value::UInt(job_id));
                Ok(ModuleOutcome::Handled(result))
            }
            "ended" => {
                let job_id = params.get_i64_or("job_id", 0) as u64;
                m.ended(job_id, params.get_i64_or("lock_id", 0) as u64, ctx.own_address, ctx).await?;
                self.ack(job_id, params, Value::Null, ctx);
                Ok(ModuleOutcome::HandledNoReply)
            }
            "sync_point" => {
                self.ack(params.get_i64_or("job_id", 0) as u64, params, Value::Null, ctx);
                Ok(ModuleOutcome::HandledNoReply)
            }
            "restart" => {
                m.restart(params.get_i64_or("job_id", 0) as u64).await?;
                Ok(ModuleOutcome::HandledNoReply)
            }
            "return" => {
                m.return_job(params.get_i64_or("job_id", 0) as u64).await?;
                Ok(ModuleOutcome::HandledNoReply)
            }
            "stop" => {
                m.stop(params.get_i64_or("job_id", 0) as u64).await?;
                Ok(ModuleOutcome::HandledNoReply)
            }
            "purge" => {
                m.purge(params.get_i64_or("job_id", 0) as u64).await?;
                Ok(ModuleOutcome::HandledNoReply)
            }
            "pause" => {
                m.pause(params.get_i64_or("job_id", 0) as u64, params.get_bool_or("wait", false)).await?;
                Ok(ModuleOutcome::HandledNoReply)
            }
            "resume" => {
                m.resume(params.get_i64_or("job_id", 0) as u64).await?;
                Ok(ModuleOutcome::HandledNoReply)
            }

            "get_state" => {
                let vars = m.get_state(params.get_i64_or("job_id", 0) as u64).await?;
                let mut result = Value::map();
                for (k, v) in vars {
                    result.set(k, v);
                }
                Ok(ModuleOutcome::Handled(result))
            }
            "set_vars" => {
                m.set_vars(
                    params.get_i64_or("job_id", 0) as u64,
                    params.get_i64_or("trans_id", 0) as u64,
                    Self::params_map(params, "vars"),
                )
                .await?;
                Ok(ModuleOutcome::HandledNoReply)
            }
            "disp_vars" => {
                m.disp_vars(params.get_i64_or("job_id", 0) as u64, ctx.own_address, ctx).await?;
                Ok(ModuleOutcome::HandledNoReply)
            }
            "alloc_res" => {
                let res_type = ResType::parse(params.get_str_or("type", "tempfile")).unwrap_or(ResType::TempFile);
                m.alloc_res(
                    params.get_i64_or("job_id", 0) as u64,
                    params.get_i64_or("trans_id", 0) as u64,
                    params.get_str_or("name", ""),
                    res_type,
                    params.get_str_or("path", ""),
                )
                .await?;
                Ok(ModuleOutcome::HandledNoReply)
            }
            "dealloc_res" => {
                let freed = m
                    .dealloc_res(params.get_i64_or("job_id", 0) as u64, params.get_i64_or("trans_id", 0) as u64, params.get_str_or("name", ""))
                    .await?;
                Ok(ModuleOutcome::Handled(Value::Bool(freed)))
            }
            "commit" => {
                let new_trans =
                    m.commit(params.get_i64_or("job_id", 0) as u64, params.get_i64_or("trans_id", 0) as u64, params.get_bool_or("chained", false)).await?;
                let mut result = Value::map();
                result.set("trans_id", new_trans.map(Value::UInt).unwrap_or(Value::Null));
                Ok(ModuleOutcome::Handled(result))
            }
            "rollback" => {
                let new_trans = m
                    .rollback(params.get_i64_or("job_id", 0) as u64, params.get_i64_or("trans_id", 0) as u64, params.get_bool_or("chained", false))
                    .await?;
                let mut result = Value::map();
                result.set("trans_id", new_trans.map(Value::UInt).unwrap_or(Value::Null));
                Ok(ModuleOutcome::Handled(result))
            }
            "log_text" => {
                let severity = match params.get_i64_or("severity", 1) {
                    0 => LogSeverity::Error,
                    1 => LogSeverity::Warning,
                    _ => LogSeverity::Info,
                };
                m.log(
                    params.get_i64_or("job_id", 0) as u64,
                    severity,
                    params.get_i64_or("code", 0) as i32,
                    params.get_str_or("text", "").to_string(),
                    ctx.own_address,
                    ctx,
                )
                .await?;
                Ok(ModuleOutcome::HandledNoReply)
            }

            "worker_started" => {
                m.worker_started(
                    params.get_i64_or("job_id", 0) as u64,
                    params.get_i64_or("lock_id", 0) as u64,
                    params.get_str_or("worker_addr", ""),
                    ctx.own_address,
                    ctx,
                )
                .await?;
                Ok(ModuleOutcome::HandledNoReply)
            }

            // Worker-posted sync actions (`scJobWorkerTask::postJobMessage`
            // counterparts): each is acked back to the worker's
            // `return_addr` with the `seq` it was tagged with, never as a
            // correlated Response (request-owning tasks have no handler
            // slot to receive one into).
            "commit_work" => {
                let job_id = params.get_i64_or("job_id", 0) as u64;
                let trans_id = params.get_i64_or("trans_id", 0) as u64;
                let new_trans = m.commit(job_id, trans_id, params.get_bool_or("chained", true)).await?;
                self.ack(job_id, params, new_trans.map(Value::UInt).unwrap_or(Value::Null), ctx);
                Ok(ModuleOutcome::HandledNoReply)
            }
            "rollback_work" => {
                let job_id = params.get_i64_or("job_id", 0) as u64;
                let trans_id = params.get_i64_or("trans_id", 0) as u64;
                let new_trans = m.rollback(job_id, trans_id, params.get_bool_or("chained", true)).await?;
                self.ack(job_id, params, new_trans.map(Value::UInt).unwrap_or(Value::Null), ctx);
                Ok(ModuleOutcome::HandledNoReply)
            }
            "reg_temp_file" => {
                let job_id = params.get_i64_or("job_id", 0) as u64;
                m.alloc_res(
                    job_id,
                    params.get_i64_or("trans_id", 0) as u64,
                    params.get_str_or("name", ""),
                    ResType::TempFile,
                    params.get_str_or("path", ""),
                )
                .await?;
                self.ack(job_id, params, Value::Null, ctx);
                Ok(ModuleOutcome::HandledNoReply)
            }
            "unreg_temp_file" => {
                let job_id = params.get_i64_or("job_id", 0) as u64;
                m.dealloc_res(job_id, params.get_i64_or("trans_id", 0) as u64, params.get_str_or("name", "")).await?;
                self.ack(job_id, params, Value::Null, ctx);
                Ok(ModuleOutcome::HandledNoReply)
            }

            _ => Ok(ModuleOutcome::Pass),
        }
    }
}

fn value_from_json(v: serde_json::Value) -> Value {
    serde_json::from_value(v).unwrap_or(Value::Null)
}

/// Daemon task driving activation, timeout sweep, and global purge
/// sweep across every started queue (spec §4.8 "Job queues run as
/// tasks", "Timeout sweep", "Global purge sweep").
pub struct JobSweepTask {
    manager: Arc<JobManager>,
    sweep_interval: Duration,
    last_sweep: AtomicI64,
    stopping: AtomicBool,
}

impl JobSweepTask {
    pub fn new(manager: Arc<JobManager>, sweep_interval: Duration) -> Self {
        JobSweepTask { manager, sweep_interval, last_sweep: AtomicI64::new(0), stopping: AtomicBool::new(false) }
    }

    fn due(&self) -> bool {
        let now = now_millis();
        now - self.last_sweep.load(Ordering::Relaxed) >= self.sweep_interval.as_millis() as i64
    }
}

fn now_millis() -> i64 {
    static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(epoch).as_millis() as i64
}

#[async_trait]
impl Task for JobSweepTask {
    fn name(&self) -> &str {
        "job-sweep"
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

        let mut work = 0;
        for queue in self.manager.list_queues() {
            let envelopes = self.manager.activate_ready(&queue, ctx.own_address).await?;
            work += envelopes.len() as i32;
            for env in envelopes {
                ctx.post(env);
            }
            work += self.manager.sweep_timeouts(&queue).await? as i32;
            work += self.manager.sweep_purge(&queue).await? as i32;
        }
        Ok(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use nodegrid_scheduler::RequestIdGenerator;

    fn manager() -> Arc<JobManager> {
        Arc::new(JobManager::new(Arc::new(InMemoryJobStore::new()), SafeRootList::new(vec!["/safe/".into()])))
    }

    #[tokio::test]
    async fn start_then_activate_sends_start_work_and_marks_submitted() {
        let m = manager();
        m.define("noop", None, "noop_cmd", BTreeMap::new(), BTreeMap::new()).await.unwrap();
        m.start_queue("q1", QueueRuntime { target_addr: Address::raw("worker"), return_addr: Address::raw("mgr"), purge_interval_ms: 1, purge_check_interval_ms: 1 })
            .await
            .unwrap();
        let job_id = m.start("noop", "q1", &Value::Null, 0, 0, 0, false, false).await.unwrap();

        let own = Address::raw("mgr");
        let envelopes = m.activate_ready("q1", &own).await.unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].receiver, Address::raw("worker"));

        let rows = m.list_jobs("q1");
        assert_eq!(rows.iter().find(|r| r.0 == job_id).unwrap().1, JobStatus::Submitted);
    }

    #[tokio::test]
    async fn commit_copies_state_and_deletes_tempfile_but_keeps_workfile() {
        let dir = tempfile::tempdir().unwrap();
        let m = Arc::new(JobManager::new(
            Arc::new(InMemoryJobStore::new()),
            SafeRootList::new(vec![dir.path().to_string_lossy().to_string()]),
        ));
        m.define("j", None, "cmd", BTreeMap::new(), BTreeMap::new()).await.unwrap();
        let job_id = m.start("j", "q", &Value::Null, 0, 0, 0, true, false).await.unwrap();
        let trans_id = {
            let entry = m.job_mut(job_id).unwrap();
            let mut job = entry.value().lock().unwrap();
            let t = m.next_trans_id.fetch_add(1, Ordering::SeqCst);
            job.current_trans_id = t;
            t
        };
        m.store.open_transaction(&JobTransaction::new(trans_id, job_id)).await.unwrap();
        m.set_vars(job_id, trans_id, BTreeMap::from([("a".to_string(), Value::Int(1))])).await.unwrap();

        let path = dir.path().join("t.tmp");
        std::fs::write(&path, b"x").unwrap();
        m.alloc_res(job_id, trans_id, "out", ResType::TempFile, path.to_str().unwrap()).await.unwrap();

        m.commit(job_id, trans_id, false).await.unwrap();
        assert!(!path.exists());
        let base = m.get_state(job_id).await.unwrap();
        assert_eq!(base.get("a"), Some(&Value::Int(1)));
    }

    /// `msg_addr` overrides `worker_addr` as `disp_vars`'s post target
    /// (SPEC_FULL §3/§4.8 addendum).
    #[tokio::test]
    async fn disp_vars_posts_to_msg_addr_override_not_worker_addr() {
        let m = manager();
        m.define("j", None, "cmd", BTreeMap::new(), BTreeMap::new()).await.unwrap();
        let job_id = m.start("j", "q", &Value::Null, 0, 0, 0, false, false).await.unwrap();
        {
            let entry = m.job_mut(job_id).unwrap();
            let mut job = entry.value().lock().unwrap();
            job.worker_addr = Some("worker".to_string());
            job.msg_addr = Some("display-sink".to_string());
        }

        let own = Address::raw("mgr");
        let ids = RequestIdGenerator::new();
        let mut outbox = Vec::new();
        let mut ctx = StepContext::new(&own, &mut outbox, &ids);
        m.disp_vars(job_id, &own, &mut ctx).await.unwrap();

        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].receiver, Address::raw("display-sink"));
    }

    /// `log_addr` gates a `job.log_text` notification on `log_level`
    /// admitting the entry's severity; the persisted log row is written
    /// regardless (SPEC_FULL §3/§4.8 addendum).
    #[tokio::test]
    async fn log_notifies_log_addr_only_when_log_level_admits_severity() {
        let m = manager();
        m.define("j", None, "cmd", BTreeMap::new(), BTreeMap::new()).await.unwrap();
        let job_id = m.start("j", "q", &Value::Null, 0, 0, 0, false, false).await.unwrap();
        {
            let entry = m.job_mut(job_id).unwrap();
            let mut job = entry.value().lock().unwrap();
            job.log_addr = Some("log-sink".to_string());
            job.log_level = LogSeverity::Error.bit();
        }

        let own = Address::raw("mgr");
        let ids = RequestIdGenerator::new();

        let mut outbox = Vec::new();
        let mut ctx = StepContext::new(&own, &mut outbox, &ids);
        m.log(job_id, LogSeverity::Info, 0, "ignored".to_string(), &own, &mut ctx).await.unwrap();
        assert!(outbox.is_empty());

        let mut outbox = Vec::new();
        let mut ctx = StepContext::new(&own, &mut outbox, &ids);
        m.log(job_id, LogSeverity::Error, 1, "boom".to_string(), &own, &mut ctx).await.unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].receiver, Address::raw("log-sink"));
    }
}
