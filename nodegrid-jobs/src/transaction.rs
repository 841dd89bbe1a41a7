//! Job transactions, state vars, and resource allocations, grounded in
//! spec §3 "Job transaction" and §4.8 "Transactions", and
//! `examples/original_source/libs/grd/include/grd/JobCommon.h`'s
//! `JMM_RESTYP_*` resource-type comments (`"delete on commit and
//! rollback"`, `"delete on rollback"`, `"delete on commit"`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResType {
    /// Deleted on both commit and rollback.
    TempFile,
    /// Deleted on rollback only; retained on commit.
    WorkFile,
    /// Deleted on commit only; retained on rollback.
    ObsolFile,
}

impl ResType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResType::TempFile => "tempfile",
            ResType::WorkFile => "workfile",
            ResType::ObsolFile => "obsolfile",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "tempfile" => ResType::TempFile,
            "workfile" => ResType::WorkFile,
            "obsolfile" => ResType::ObsolFile,
            _ => return None,
        })
    }

    /// Whether this resource type is deleted when its owning transaction
    /// commits (spec §4.8 "commit: ... delete `tempfile`+`obsolfile`
    /// paths, retain `workfile`").
    pub fn delete_on_commit(self) -> bool {
        matches!(self, ResType::TempFile | ResType::ObsolFile)
    }

    /// Whether this resource type is deleted when its owning transaction
    /// rolls back (spec §4.8 "rollback: ... delete `tempfile`+`workfile`,
    /// retain `obsolfile`").
    pub fn delete_on_rollback(self) -> bool {
        matches!(self, ResType::TempFile | ResType::WorkFile)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResource {
    pub job_id: u64,
    pub trans_id: u64,
    pub name: String,
    pub res_path: String,
    pub res_type: ResType,
}

/// `{trans_id, job_id, closed, added_at, updated_at}` (spec §3 "Job
/// transaction"). Row-level state (`job_state`) and resource allocations
/// (`job_res`) live alongside it in the store, keyed by `(trans_id,
/// *)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTransaction {
    pub trans_id: u64,
    pub job_id: u64,
    pub closed: bool,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobTransaction {
    pub fn new(trans_id: u64, job_id: u64) -> Self {
        let now = Utc::now();
        JobTransaction { trans_id, job_id, closed: false, added_at: now, updated_at: now }
    }
}

/// Upper-cased prefix allow-list guarding file deletion on commit and
/// rollback (spec §8 invariant 7 "Safe purge"): a path is only ever
/// deleted if its upper-cased form starts with one of the configured
/// roots' upper-cased forms.
#[derive(Debug, Clone, Default)]
pub struct SafeRootList {
    roots: Vec<String>,
}

impl SafeRootList {
    pub fn new(roots: Vec<String>) -> Self {
        SafeRootList { roots: roots.into_iter().map(|r| r.to_uppercase()).collect() }
    }

    pub fn is_safe(&self, path: &str) -> bool {
        let upper = path.to_uppercase();
        self.roots.iter().any(|root| upper.starts_with(root.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_commit_rollback_retention_matches_spec_table() {
        assert!(ResType::TempFile.delete_on_commit());
        assert!(ResType::TempFile.delete_on_rollback());
        assert!(!ResType::WorkFile.delete_on_commit());
        assert!(ResType::WorkFile.delete_on_rollback());
        assert!(ResType::ObsolFile.delete_on_commit());
        assert!(!ResType::ObsolFile.delete_on_rollback());
    }

    #[test]
    fn safe_root_list_matches_case_insensitively_by_prefix() {
        let roots = SafeRootList::new(vec!["/safe/".into()]);
        assert!(roots.is_safe("/safe/x/y.tmp"));
        assert!(roots.is_safe("/SAFE/X/Y.TMP"));
        assert!(!roots.is_safe("/etc/passwd"));
    }
}
