//! # Nodegrid Configuration
//!
//! Layered configuration loading for the nodegrid runtime: a base TOML file,
//! an optional environment-specific override file, and `NODEGRID_`-prefixed
//! environment variables, composed with the `config` crate (the same layering
//! strategy the teacher project uses for `tasker::TaskerConfig`).
//!
//! ## Structure
//!
//! ```text
//! NodegridConfig
//! ├── scheduler: SchedulerConfig       # run-loop timing, yield smoothing
//! ├── database: DatabaseConfig         # Postgres DSN for pqueue/job stores
//! ├── pqueue: PersistentQueueConfig    # default timeouts, purge interval
//! └── jobs: JobManagerConfig           # timeout sweep, purge sweep, safe roots
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler run-loop tuning (spec §4.4).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Minimum sleep between `run()` invocations when idle, milliseconds.
    pub yield_min_ms: u64,
    /// Maximum sleep between `run()` invocations when idle, milliseconds.
    pub yield_max_ms: u64,
    /// Smoothing factor for the exponential moving average of run duration.
    pub yield_smoothing_alpha: f64,
    /// Emit a trace span per dispatched envelope.
    pub log_messages: bool,
    /// Emit a trace event with each `run()` step's wall-clock time.
    pub log_proc_time: bool,
    /// Emit full envelope contents to trace (very verbose; debug only).
    pub trace_msgs: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            yield_min_ms: 1,
            yield_max_ms: 100,
            yield_smoothing_alpha: 0.2,
            log_messages: false,
            log_proc_time: false,
            trace_msgs: false,
        }
    }
}

impl SchedulerConfig {
    pub fn yield_min(&self) -> Duration {
        Duration::from_millis(self.yield_min_ms)
    }

    pub fn yield_max(&self) -> Duration {
        Duration::from_millis(self.yield_max_ms)
    }
}

/// Database connectivity for the persistent queue and job manager stores.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/nodegrid".to_string(),
            max_connections: 10,
            connect_timeout_ms: 5_000,
        }
    }
}

/// Persistent queue defaults (spec §4.7); overridable per-queue via
/// `pqueue.define`/`queue_config`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistentQueueConfig {
    pub handle_timeout_ms: u64,
    pub storage_timeout_ms: u64,
    pub error_limit: u32,
    pub error_delay_ms: u64,
    pub purge_interval_ms: u64,
    pub status_check_delay_ms: u64,
    pub lock_save_freq: u64,
}

impl Default for PersistentQueueConfig {
    fn default() -> Self {
        Self {
            handle_timeout_ms: 30_000,
            storage_timeout_ms: 3_600_000,
            error_limit: 3,
            error_delay_ms: 5_000,
            purge_interval_ms: 60_000,
            status_check_delay_ms: 100,
            lock_save_freq: 1_000,
        }
    }
}

/// Job manager defaults (spec §4.8).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JobManagerConfig {
    pub timeout_check_delay_ms: u64,
    pub purge_check_interval_ms: u64,
    pub purge_interval_ms: u64,
    /// Upper-cased path prefixes under which file deletion on commit/
    /// rollback/purge is permitted (spec §4.8, property test 7).
    pub safe_roots: Vec<String>,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            timeout_check_delay_ms: 1_000,
            purge_check_interval_ms: 60_000,
            purge_interval_ms: 86_400_000,
            safe_roots: Vec::new(),
        }
    }
}

/// Top-level nodegrid configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NodegridConfig {
    pub scheduler: SchedulerConfig,
    pub database: DatabaseConfig,
    pub pqueue: PersistentQueueConfig,
    pub jobs: JobManagerConfig,
}

impl NodegridConfig {
    /// Load layered configuration:
    /// 1. `config/nodegrid/base.toml` (optional)
    /// 2. `config/nodegrid/{env}.toml`, `env` from `NODEGRID_ENV` (default `development`)
    /// 3. Environment variables prefixed `NODEGRID__`, double-underscore separated
    ///    (e.g. `NODEGRID__DATABASE__URL`)
    pub fn load() -> Result<Self, config::ConfigError> {
        let env = std::env::var("NODEGRID_ENV").unwrap_or_else(|_| "development".to_string());

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/nodegrid/base").required(false))
            .add_source(
                config::File::with_name(&format!("config/nodegrid/{env}")).required(false),
            )
            .add_source(
                config::Environment::with_prefix("NODEGRID")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Build a config purely from defaults, bypassing file/env discovery.
    /// Used by tests and by embedding code that manages its own config.
    pub fn defaults() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scheduler_yields_are_sane() {
        let cfg = SchedulerConfig::default();
        assert!(cfg.yield_min() <= cfg.yield_max());
    }

    #[test]
    fn defaults_round_trip_through_json() {
        let cfg = NodegridConfig::defaults();
        let json_text = serde_json::to_string(&cfg).unwrap();
        let restored: NodegridConfig = serde_json::from_str(&json_text).unwrap();
        assert_eq!(restored.database.url, cfg.database.url);
        assert_eq!(restored.pqueue.error_limit, cfg.pqueue.error_limit);
    }

    #[test]
    fn job_manager_default_has_no_safe_roots() {
        assert!(JobManagerConfig::default().safe_roots.is_empty());
    }

    #[test]
    fn pqueue_default_lock_save_freq_matches_spec() {
        // PQ_LOCK_SAVE_FREQ per spec §4.7.
        assert_eq!(PersistentQueueConfig::default().lock_save_freq, 1_000);
    }
}
