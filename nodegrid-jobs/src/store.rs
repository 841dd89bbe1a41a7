//! Durable storage for job definitions, instances, transactions, state
//! vars, resources, and the job log, grounded in
//! `examples/original_source/libs/grd/include/grd/JobQueueTask.h`'s
//! method list (`insertJobToDb`, `getJobParams`, `removeAllocationsFromDb`,
//! `addJobLogEntry`, ...) and spec §6 "Persisted layout"'s table list
//! (`job_def`, `job_def_param`, `job`, `job_param`, `job_log`,
//! `job_state`, `job_res`, `job_trans`).

use crate::definition::JobDefinition;
use crate::instance::JobInstance;
use crate::transaction::{JobResource, JobTransaction, ResType};
use async_trait::async_trait;
use nodegrid_shared::{NodegridError, NodegridResult, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Error,
    Warning,
    Info,
}

impl LogSeverity {
    /// This severity's bit in the `log_level`/`msg_level` 0-7 bitmask
    /// (SPEC_FULL §3 addendum).
    pub fn bit(self) -> u32 {
        match self {
            LogSeverity::Error => 1,
            LogSeverity::Warning => 2,
            LogSeverity::Info => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogSeverity::Error => "error",
            LogSeverity::Warning => "warning",
            LogSeverity::Info => "info",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobLogEntry {
    pub job_id: u64,
    pub severity: LogSeverity,
    pub code: i32,
    pub text: String,
    pub added_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save_definition(&self, def: &JobDefinition) -> NodegridResult<()>;
    async fn load_definitions(&self) -> NodegridResult<Vec<JobDefinition>>;
    async fn remove_definition(&self, name: &str) -> NodegridResult<()>;

    async fn save_instance(&self, job: &JobInstance) -> NodegridResult<()>;
    async fn load_instances(&self, queue: &str) -> NodegridResult<Vec<JobInstance>>;
    async fn load_instance(&self, job_id: u64) -> NodegridResult<Option<JobInstance>>;
    async fn remove_instance(&self, job_id: u64) -> NodegridResult<()>;

    async fn open_transaction(&self, trans: &JobTransaction) -> NodegridResult<()>;
    async fn close_transaction(&self, trans_id: u64) -> NodegridResult<()>;
    async fn open_transactions_for_job(&self, job_id: u64) -> NodegridResult<Vec<JobTransaction>>;

    async fn set_state_var(&self, job_id: u64, trans_id: u64, name: &str, value: Value) -> NodegridResult<()>;
    async fn get_state_vars(&self, job_id: u64, trans_id: u64) -> NodegridResult<BTreeMap<String, Value>>;
    async fn copy_trans_state_to_base(&self, job_id: u64, trans_id: u64) -> NodegridResult<()>;
    async fn remove_trans_state(&self, job_id: u64, trans_id: u64) -> NodegridResult<()>;
    async fn remove_all_state(&self, job_id: u64) -> NodegridResult<()>;

    async fn alloc_resource(&self, res: JobResource) -> NodegridResult<()>;
    async fn dealloc_resource(&self, job_id: u64, trans_id: u64, name: &str) -> NodegridResult<Option<JobResource>>;
    async fn resources_for_trans(&self, job_id: u64, trans_id: u64) -> NodegridResult<Vec<JobResource>>;
    async fn remove_all_resources(&self, job_id: u64) -> NodegridResult<Vec<JobResource>>;

    async fn append_log(&self, entry: JobLogEntry) -> NodegridResult<()>;
    async fn clear_log(&self, job_id: u64) -> NodegridResult<()>;
}

#[derive(Default)]
struct InMemoryTables {
    definitions: HashMap<String, JobDefinition>,
    instances: HashMap<u64, JobInstance>,
    transactions: HashMap<u64, JobTransaction>,
    /// `(job_id, trans_id, var_name) -> value`.
    state: HashMap<(u64, u64, String), Value>,
    /// `(job_id, trans_id, name) -> resource`.
    resources: HashMap<(u64, u64, String), JobResource>,
    log: Vec<JobLogEntry>,
}

/// In-memory store used by unit/integration tests, grounded in the
/// teacher's `MessagingProvider::new_in_memory()` pattern.
#[derive(Default)]
pub struct InMemoryJobStore {
    tables: Mutex<InMemoryTables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        InMemoryJobStore::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save_definition(&self, def: &JobDefinition) -> NodegridResult<()> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner()).definitions.insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn load_definitions(&self) -> NodegridResult<Vec<JobDefinition>> {
        Ok(self.tables.lock().unwrap_or_else(|e| e.into_inner()).definitions.values().cloned().collect())
    }

    async fn remove_definition(&self, name: &str) -> NodegridResult<()> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner()).definitions.remove(name);
        Ok(())
    }

    async fn save_instance(&self, job: &JobInstance) -> NodegridResult<()> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner()).instances.insert(job.id, job.clone());
        Ok(())
    }

    async fn load_instances(&self, queue: &str) -> NodegridResult<Vec<JobInstance>> {
        Ok(self
            .tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .instances
            .values()
            .filter(|j| j.queue == queue)
            .cloned()
            .collect())
    }

    async fn load_instance(&self, job_id: u64) -> NodegridResult<Option<JobInstance>> {
        Ok(self.tables.lock().unwrap_or_else(|e| e.into_inner()).instances.get(&job_id).cloned())
    }

    async fn remove_instance(&self, job_id: u64) -> NodegridResult<()> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner()).instances.remove(&job_id);
        Ok(())
    }

    async fn open_transaction(&self, trans: &JobTransaction) -> NodegridResult<()> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner()).transactions.insert(trans.trans_id, trans.clone());
        Ok(())
    }

    async fn close_transaction(&self, trans_id: u64) -> NodegridResult<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(trans) = tables.transactions.get_mut(&trans_id) {
            trans.closed = true;
            trans.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    async fn open_transactions_for_job(&self, job_id: u64) -> NodegridResult<Vec<JobTransaction>> {
        Ok(self
            .tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .transactions
            .values()
            .filter(|t| t.job_id == job_id && !t.closed)
            .cloned()
            .collect())
    }

    async fn set_state_var(&self, job_id: u64, trans_id: u64, name: &str, value: Value) -> NodegridResult<()> {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state
            .insert((job_id, trans_id, name.to_string()), value);
        Ok(())
    }

    async fn get_state_vars(&self, job_id: u64, trans_id: u64) -> NodegridResult<BTreeMap<String, Value>> {
        Ok(self
            .tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state
            .iter()
            .filter(|((j, t, _), _)| *j == job_id && *t == trans_id)
            .map(|((_, _, name), value)| (name.clone(), value.clone()))
            .collect())
    }

    async fn copy_trans_state_to_base(&self, job_id: u64, trans_id: u64) -> NodegridResult<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let overrides: Vec<(String, Value)> = tables
            .state
            .iter()
            .filter(|((j, t, _), _)| *j == job_id && *t == trans_id)
            .map(|((_, _, name), value)| (name.clone(), value.clone()))
            .collect();
        for (name, value) in overrides {
            tables.state.insert((job_id, 0, name), value);
        }
        Ok(())
    }

    async fn remove_trans_state(&self, job_id: u64, trans_id: u64) -> NodegridResult<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.state.retain(|(j, t, _), _| !(*j == job_id && *t == trans_id));
        Ok(())
    }

    async fn remove_all_state(&self, job_id: u64) -> NodegridResult<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.state.retain(|(j, _, _), _| *j != job_id);
        Ok(())
    }

    async fn alloc_resource(&self, res: JobResource) -> NodegridResult<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.resources.insert((res.job_id, res.trans_id, res.name.clone()), res);
        Ok(())
    }

    async fn dealloc_resource(&self, job_id: u64, trans_id: u64, name: &str) -> NodegridResult<Option<JobResource>> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables.resources.remove(&(job_id, trans_id, name.to_string())))
    }

    async fn resources_for_trans(&self, job_id: u64, trans_id: u64) -> NodegridResult<Vec<JobResource>> {
        Ok(self
            .tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .resources
            .iter()
            .filter(|((j, t, _), _)| *j == job_id && *t == trans_id)
            .map(|(_, res)| res.clone())
            .collect())
    }

    async fn remove_all_resources(&self, job_id: u64) -> NodegridResult<Vec<JobResource>> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let removed: Vec<JobResource> = tables
            .resources
            .iter()
            .filter(|((j, _, _), _)| *j == job_id)
            .map(|(_, res)| res.clone())
            .collect();
        tables.resources.retain(|(j, _, _), _| *j != job_id);
        Ok(removed)
    }

    async fn append_log(&self, entry: JobLogEntry) -> NodegridResult<()> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner()).log.push(entry);
        Ok(())
    }

    async fn clear_log(&self, job_id: u64) -> NodegridResult<()> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner()).log.retain(|l| l.job_id != job_id);
        Ok(())
    }
}

/// Postgres-backed store, grounded in the teacher's `sqlx::PgPool` usage
/// throughout `tasker-orchestration`/`tasker-shared`. Table shapes follow
/// `spec.md §6`'s `job_def`/`job_def_param`/`job`/`job_param`/`job_log`/
/// `job_state`/`job_res`/`job_trans` list; each logical table is a single
/// `jobs_*`-prefixed relational table, matching the persistent-queue
/// store's one-table-per-concern layout rather than per-definition DDL.
pub struct PgJobStore {
    pool: sqlx::PgPool,
}

impl PgJobStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        PgJobStore { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn save_definition(&self, def: &JobDefinition) -> NodegridResult<()> {
        let params_json = serde_json::to_value(&def.params).map_err(NodegridError::Serde)?;
        sqlx::query(
            "INSERT INTO jobs_def (def_id, name, base, command, params) VALUES ($1,$2,$3,$4,$5) \
             ON CONFLICT (name) DO UPDATE SET base=$3, command=$4, params=$5",
        )
        .bind(def.id as i64)
        .bind(&def.name)
        .bind(&def.base)
        .bind(&def.command)
        .bind(params_json)
        .execute(&self.pool)
        .await
        .map_err(NodegridError::Database)?;
        Ok(())
    }

    async fn load_definitions(&self) -> NodegridResult<Vec<JobDefinition>> {
        use sqlx::Row;
        let rows = sqlx::query("SELECT def_id, name, base, command, params FROM jobs_def")
            .fetch_all(&self.pool)
            .await
            .map_err(NodegridError::Database)?;
        rows.into_iter()
            .map(|row| {
                let params_json: serde_json::Value = row.try_get("params").map_err(NodegridError::Database)?;
                Ok(JobDefinition {
                    id: row.try_get::<i64, _>("def_id").map_err(NodegridError::Database)? as u64,
                    name: row.try_get("name").map_err(NodegridError::Database)?,
                    base: row.try_get("base").map_err(NodegridError::Database)?,
                    command: row.try_get("command").map_err(NodegridError::Database)?,
                    params: serde_json::from_value(params_json).map_err(NodegridError::Serde)?,
                })
            })
            .collect()
    }

    async fn remove_definition(&self, name: &str) -> NodegridResult<()> {
        sqlx::query("DELETE FROM jobs_def WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(NodegridError::Database)?;
        Ok(())
    }

    async fn save_instance(&self, job: &JobInstance) -> NodegridResult<()> {
        let params_json = serde_json::to_value(&job.params).map_err(NodegridError::Serde)?;
        sqlx::query(
            "INSERT INTO jobs_job \
             (job_id, def_id, queue, status, lock_id, worker_addr, command, priority, log_level, msg_level, \
              job_timeout_ms, trans_timeout_ms, retry_left, trans_sup, added_at, updated_at, started_at, \
              trans_started_at, current_trans_id, params) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20) \
             ON CONFLICT (job_id) DO UPDATE SET status=$4, lock_id=$5, worker_addr=$6, updated_at=$16, \
             started_at=$17, trans_started_at=$18, current_trans_id=$19, params=$20",
        )
        .bind(job.id as i64)
        .bind(job.def_id as i64)
        .bind(&job.queue)
        .bind(job.status.as_str())
        .bind(job.lock_id as i64)
        .bind(&job.worker_addr)
        .bind(&job.command)
        .bind(job.priority as i32)
        .bind(job.log_level as i32)
        .bind(job.msg_level as i32)
        .bind(job.job_timeout_ms as i64)
        .bind(job.trans_timeout_ms as i64)
        .bind(job.retry_left as i32)
        .bind(job.trans_sup)
        .bind(job.added_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.trans_started_at)
        .bind(job.current_trans_id as i64)
        .bind(params_json)
        .execute(&self.pool)
        .await
        .map_err(NodegridError::Database)?;
        Ok(())
    }

    async fn load_instances(&self, queue: &str) -> NodegridResult<Vec<JobInstance>> {
        use sqlx::Row;
        let rows = sqlx::query("SELECT * FROM jobs_job WHERE queue = $1")
            .bind(queue)
            .fetch_all(&self.pool)
            .await
            .map_err(NodegridError::Database)?;
        rows.into_iter().map(row_to_instance).collect()
    }

    async fn load_instance(&self, job_id: u64) -> NodegridResult<Option<JobInstance>> {
        use sqlx::Row;
        let row = sqlx::query("SELECT * FROM jobs_job WHERE job_id = $1")
            .bind(job_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(NodegridError::Database)?;
        row.map(row_to_instance).transpose()
    }

    async fn remove_instance(&self, job_id: u64) -> NodegridResult<()> {
        sqlx::query("DELETE FROM jobs_job WHERE job_id = $1")
            .bind(job_id as i64)
            .execute(&self.pool)
            .await
            .map_err(NodegridError::Database)?;
        Ok(())
    }

    async fn open_transaction(&self, trans: &JobTransaction) -> NodegridResult<()> {
        sqlx::query(
            "INSERT INTO jobs_trans (trans_id, job_id, closed, added_at, updated_at) VALUES ($1,$2,$3,$4,$5) \
             ON CONFLICT (trans_id) DO UPDATE SET closed=$3, updated_at=$5",
        )
        .bind(trans.trans_id as i64)
        .bind(trans.job_id as i64)
        .bind(trans.closed)
        .bind(trans.added_at)
        .bind(trans.updated_at)
        .execute(&self.pool)
        .await
        .map_err(NodegridError::Database)?;
        Ok(())
    }

    async fn close_transaction(&self, trans_id: u64) -> NodegridResult<()> {
        sqlx::query("UPDATE jobs_trans SET closed = true, updated_at = now() WHERE trans_id = $1")
            .bind(trans_id as i64)
            .execute(&self.pool)
            .await
            .map_err(NodegridError::Database)?;
        Ok(())
    }

    async fn open_transactions_for_job(&self, job_id: u64) -> NodegridResult<Vec<JobTransaction>> {
        use sqlx::Row;
        let rows = sqlx::query("SELECT * FROM jobs_trans WHERE job_id = $1 AND closed = false")
            .bind(job_id as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(NodegridError::Database)?;
        rows.into_iter()
            .map(|row| {
                Ok(JobTransaction {
                    trans_id: row.try_get::<i64, _>("trans_id").map_err(NodegridError::Database)? as u64,
                    job_id: row.try_get::<i64, _>("job_id").map_err(NodegridError::Database)? as u64,
                    closed: row.try_get("closed").map_err(NodegridError::Database)?,
                    added_at: row.try_get("added_at").map_err(NodegridError::Database)?,
                    updated_at: row.try_get("updated_at").map_err(NodegridError::Database)?,
                })
            })
            .collect()
    }

    async fn set_state_var(&self, job_id: u64, trans_id: u64, name: &str, value: Value) -> NodegridResult<()> {
        let value_json = serde_json::to_value(&value).map_err(NodegridError::Serde)?;
        sqlx::query(
            "INSERT INTO jobs_state (job_id, trans_id, var_name, var_value) VALUES ($1,$2,$3,$4) \
             ON CONFLICT (job_id, trans_id, var_name) DO UPDATE SET var_value = $4",
        )
        .bind(job_id as i64)
        .bind(trans_id as i64)
        .bind(name)
        .bind(value_json)
        .execute(&self.pool)
        .await
        .map_err(NodegridError::Database)?;
        Ok(())
    }

    async fn get_state_vars(&self, job_id: u64, trans_id: u64) -> NodegridResult<BTreeMap<String, Value>> {
        use sqlx::Row;
        let rows = sqlx::query("SELECT var_name, var_value FROM jobs_state WHERE job_id = $1 AND trans_id = $2")
            .bind(job_id as i64)
            .bind(trans_id as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(NodegridError::Database)?;
        let mut out = BTreeMap::new();
        for row in rows {
            let name: String = row.try_get("var_name").map_err(NodegridError::Database)?;
            let value_json: serde_json::Value = row.try_get("var_value").map_err(NodegridError::Database)?;
            out.insert(name, serde_json::from_value(value_json).map_err(NodegridError::Serde)?);
        }
        Ok(out)
    }

    async fn copy_trans_state_to_base(&self, job_id: u64, trans_id: u64) -> NodegridResult<()> {
        let vars = self.get_state_vars(job_id, trans_id).await?;
        for (name, value) in vars {
            self.set_state_var(job_id, 0, &name, value).await?;
        }
        Ok(())
    }

    async fn remove_trans_state(&self, job_id: u64, trans_id: u64) -> NodegridResult<()> {
        sqlx::query("DELETE FROM jobs_state WHERE job_id = $1 AND trans_id = $2")
            .bind(job_id as i64)
            .bind(trans_id as i64)
            .execute(&self.pool)
            .await
            .map_err(NodegridError::Database)?;
        Ok(())
    }

    async fn remove_all_state(&self, job_id: u64) -> NodegridResult<()> {
        sqlx::query("DELETE FROM jobs_state WHERE job_id = $1")
            .bind(job_id as i64)
            .execute(&self.pool)
            .await
            .map_err(NodegridError::Database)?;
        Ok(())
    }

    async fn alloc_resource(&self, res: JobResource) -> NodegridResult<()> {
        sqlx::query(
            "INSERT INTO jobs_res (job_id, trans_id, name, res_path, res_type) VALUES ($1,$2,$3,$4,$5) \
             ON CONFLICT (job_id, trans_id, name) DO UPDATE SET res_path=$4, res_type=$5",
        )
        .bind(res.job_id as i64)
        .bind(res.trans_id as i64)
        .bind(&res.name)
        .bind(&res.res_path)
        .bind(res.res_type.as_str())
        .execute(&self.pool)
        .await
        .map_err(NodegridError::Database)?;
        Ok(())
    }

    async fn dealloc_resource(&self, job_id: u64, trans_id: u64, name: &str) -> NodegridResult<Option<JobResource>> {
        use sqlx::Row;
        let row = sqlx::query("DELETE FROM jobs_res WHERE job_id = $1 AND trans_id = $2 AND name = $3 RETURNING res_path, res_type")
            .bind(job_id as i64)
            .bind(trans_id as i64)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(NodegridError::Database)?;
        row.map(|row| {
            let res_type_str: String = row.try_get("res_type").map_err(NodegridError::Database)?;
            Ok(JobResource {
                job_id,
                trans_id,
                name: name.to_string(),
                res_path: row.try_get("res_path").map_err(NodegridError::Database)?,
                res_type: ResType::parse(&res_type_str).ok_or_else(|| NodegridError::Other(format!("bad res_type {res_type_str}")))?,
            })
        })
        .transpose()
    }

    async fn resources_for_trans(&self, job_id: u64, trans_id: u64) -> NodegridResult<Vec<JobResource>> {
        use sqlx::Row;
        let rows = sqlx::query("SELECT name, res_path, res_type FROM jobs_res WHERE job_id = $1 AND trans_id = $2")
            .bind(job_id as i64)
            .bind(trans_id as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(NodegridError::Database)?;
        rows.into_iter()
            .map(|row| {
                let res_type_str: String = row.try_get("res_type").map_err(NodegridError::Database)?;
                Ok(JobResource {
                    job_id,
                    trans_id,
                    name: row.try_get("name").map_err(NodegridError::Database)?,
                    res_path: row.try_get("res_path").map_err(NodegridError::Database)?,
                    res_type: ResType::parse(&res_type_str).ok_or_else(|| NodegridError::Other(format!("bad res_type {res_type_str}")))?,
                })
            })
            .collect()
    }

    async fn remove_all_resources(&self, job_id: u64) -> NodegridResult<Vec<JobResource>> {
        use sqlx::Row;
        let rows = sqlx::query("DELETE FROM jobs_res WHERE job_id = $1 RETURNING trans_id, name, res_path, res_type")
            .bind(job_id as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(NodegridError::Database)?;
        rows.into_iter()
            .map(|row| {
                let res_type_str: String = row.try_get("res_type").map_err(NodegridError::Database)?;
                Ok(JobResource {
                    job_id,
                    trans_id: row.try_get::<i64, _>("trans_id").map_err(NodegridError::Database)? as u64,
                    name: row.try_get("name").map_err(NodegridError::Database)?,
                    res_path: row.try_get("res_path").map_err(NodegridError::Database)?,
                    res_type: ResType::parse(&res_type_str).ok_or_else(|| NodegridError::Other(format!("bad res_type {res_type_str}")))?,
                })
            })
            .collect()
    }

    async fn append_log(&self, entry: JobLogEntry) -> NodegridResult<()> {
        sqlx::query("INSERT INTO jobs_log (job_id, severity, code, text, added_at) VALUES ($1,$2,$3,$4,$5)")
            .bind(entry.job_id as i64)
            .bind(entry.severity.as_str())
            .bind(entry.code)
            .bind(&entry.text)
            .bind(entry.added_at)
            .execute(&self.pool)
            .await
            .map_err(NodegridError::Database)?;
        Ok(())
    }

    async fn clear_log(&self, job_id: u64) -> NodegridResult<()> {
        sqlx::query("DELETE FROM jobs_log WHERE job_id = $1")
            .bind(job_id as i64)
            .execute(&self.pool)
            .await
            .map_err(NodegridError::Database)?;
        Ok(())
    }
}

fn row_to_instance(row: sqlx::postgres::PgRow) -> NodegridResult<JobInstance> {
    use sqlx::Row;
    let status_str: String = row.try_get("status").map_err(NodegridError::Database)?;
    let params_json: serde_json::Value = row.try_get("params").map_err(NodegridError::Database)?;
    Ok(JobInstance {
        id: row.try_get::<i64, _>("job_id").map_err(NodegridError::Database)? as u64,
        def_id: row.try_get::<i64, _>("def_id").map_err(NodegridError::Database)? as u64,
        queue: row.try_get("queue").map_err(NodegridError::Database)?,
        status: crate::instance::JobStatus::parse(&status_str)
            .ok_or_else(|| NodegridError::Other(format!("bad status {status_str}")))?,
        lock_id: row.try_get::<i64, _>("lock_id").map_err(NodegridError::Database)? as u64,
        worker_addr: row.try_get("worker_addr").map_err(NodegridError::Database)?,
        command: row.try_get("command").map_err(NodegridError::Database)?,
        priority: row.try_get::<i32, _>("priority").map_err(NodegridError::Database)? as u32,
        log_level: row.try_get::<i32, _>("log_level").map_err(NodegridError::Database)? as u32,
        msg_level: row.try_get::<i32, _>("msg_level").map_err(NodegridError::Database)? as u32,
        job_timeout_ms: row.try_get::<i64, _>("job_timeout_ms").map_err(NodegridError::Database)? as u64,
        trans_timeout_ms: row.try_get::<i64, _>("trans_timeout_ms").map_err(NodegridError::Database)? as u64,
        retry_left: row.try_get::<i32, _>("retry_left").map_err(NodegridError::Database)? as u32,
        trans_sup: row.try_get("trans_sup").map_err(NodegridError::Database)?,
        added_at: row.try_get("added_at").map_err(NodegridError::Database)?,
        updated_at: row.try_get("updated_at").map_err(NodegridError::Database)?,
        started_at: row.try_get("started_at").map_err(NodegridError::Database)?,
        trans_started_at: row.try_get("trans_started_at").map_err(NodegridError::Database)?,
        current_trans_id: row.try_get::<i64, _>("current_trans_id").map_err(NodegridError::Database)? as u64,
        params: serde_json::from_value(params_json).map_err(NodegridError::Serde)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_copies_trans_state_to_base_and_clears_trans_rows() {
        let store = InMemoryJobStore::new();
        store.set_state_var(1, 5, "a", Value::Int(1)).await.unwrap();
        store.copy_trans_state_to_base(1, 5).await.unwrap();
        store.remove_trans_state(1, 5).await.unwrap();

        let base = store.get_state_vars(1, 0).await.unwrap();
        assert_eq!(base.get("a"), Some(&Value::Int(1)));
        let trans = store.get_state_vars(1, 5).await.unwrap();
        assert!(trans.is_empty());
    }

    #[tokio::test]
    async fn dealloc_returns_the_removed_resource() {
        let store = InMemoryJobStore::new();
        store
            .alloc_resource(JobResource { job_id: 1, trans_id: 2, name: "out".into(), res_path: "/safe/x".into(), res_type: ResType::TempFile })
            .await
            .unwrap();
        let res = store.dealloc_resource(1, 2, "out").await.unwrap();
        assert!(res.is_some());
        assert!(store.dealloc_resource(1, 2, "out").await.unwrap().is_none());
    }
}
