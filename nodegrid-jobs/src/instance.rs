//! Job instance shape and status machine, grounded in
//! `examples/original_source/libs/grd/include/grd/JobCommon.h`'s
//! `scJobStatus` enum and spec §3 "Job instance".

use chrono::{DateTime, Utc};
use nodegrid_shared::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Null,
    Paused,
    Waiting,
    Ready,
    Submitted,
    Running,
    Ended,
    Purged,
    Aborted,
    Sleep,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Null => "null",
            JobStatus::Paused => "paused",
            JobStatus::Waiting => "waiting",
            JobStatus::Ready => "ready",
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Ended => "ended",
            JobStatus::Purged => "purged",
            JobStatus::Aborted => "aborted",
            JobStatus::Sleep => "sleep",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "null" => JobStatus::Null,
            "paused" => JobStatus::Paused,
            "waiting" => JobStatus::Waiting,
            "ready" => JobStatus::Ready,
            "submitted" => JobStatus::Submitted,
            "running" => JobStatus::Running,
            "ended" => JobStatus::Ended,
            "purged" => JobStatus::Purged,
            "aborted" => JobStatus::Aborted,
            "sleep" => JobStatus::Sleep,
            _ => return None,
        })
    }

    /// Statuses `return`/`restart` accept (spec §4.8 "Restart/return").
    pub fn returnable(self) -> bool {
        matches!(
            self,
            JobStatus::Submitted | JobStatus::Ready | JobStatus::Running | JobStatus::Sleep | JobStatus::Paused | JobStatus::Aborted
        )
    }

    /// Statuses `purge` accepts (spec §4.8 "Restart/return/stop/purge").
    pub fn purgeable(self) -> bool {
        matches!(self, JobStatus::Aborted | JobStatus::Ended | JobStatus::Purged)
    }
}

/// `{id, def_id, queue, status, lock_id, worker_addr?, command, priority,
/// log_level, msg_level, msg_addr?, log_addr?, job_timeout, trans_timeout,
/// retry_left, trans_sup, added_at, updated_at, started_at, params}` (spec
/// §3 "Job instance").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: u64,
    pub def_id: u64,
    pub queue: String,
    pub status: JobStatus,
    pub lock_id: u64,
    pub worker_addr: Option<String>,
    pub command: String,
    pub priority: u32,
    pub log_level: u32,
    pub msg_level: u32,
    /// Override target for `job.disp_vars` (default: `worker_addr`).
    pub msg_addr: Option<String>,
    /// Override target for `job.log_text` notifications (default:
    /// `worker_addr`).
    pub log_addr: Option<String>,
    pub job_timeout_ms: u64,
    pub trans_timeout_ms: u64,
    pub retry_left: u32,
    pub trans_sup: bool,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub trans_started_at: Option<DateTime<Utc>>,
    pub current_trans_id: u64,
    pub params: BTreeMap<String, Value>,
}

impl JobInstance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        def_id: u64,
        queue: impl Into<String>,
        command: impl Into<String>,
        params: BTreeMap<String, Value>,
        job_timeout_ms: u64,
        trans_timeout_ms: u64,
        retry_left: u32,
        trans_sup: bool,
        start_paused: bool,
    ) -> Self {
        let now = Utc::now();
        JobInstance {
            id,
            def_id,
            queue: queue.into(),
            status: if start_paused { JobStatus::Paused } else { JobStatus::Ready },
            lock_id: 0,
            worker_addr: None,
            command: command.into(),
            priority: 5,
            log_level: 7,
            msg_level: 7,
            msg_addr: None,
            log_addr: None,
            job_timeout_ms,
            trans_timeout_ms,
            retry_left,
            trans_sup,
            added_at: now,
            updated_at: now,
            started_at: None,
            trans_started_at: None,
            current_trans_id: 0,
            params,
        }
    }

    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn ms_since_started(&self) -> Option<i64> {
        self.started_at.map(|dt| (Utc::now() - dt).num_milliseconds())
    }

    pub fn ms_since_trans_started(&self) -> Option<i64> {
        self.trans_started_at.map(|dt| (Utc::now() - dt).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            JobStatus::Null,
            JobStatus::Paused,
            JobStatus::Waiting,
            JobStatus::Ready,
            JobStatus::Submitted,
            JobStatus::Running,
            JobStatus::Ended,
            JobStatus::Purged,
            JobStatus::Aborted,
            JobStatus::Sleep,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn start_paused_sets_paused_status() {
        let job = JobInstance::new(1, 1, "q", "cmd", BTreeMap::new(), 0, 0, 0, false, true);
        assert_eq!(job.status, JobStatus::Paused);
    }
}
