//! Named-scheduler factory, grounded in
//! `examples/original_source/libs/grd/src/grd/CompactServer.cpp`'s
//! `grdCompactNodeFactory::intCreateNode`/`initModules` (a scheduler is
//! created, named, and handed the fixed module bundle — core,
//! persistent queue, job manager — before being handed back to the
//! caller). Unlike the original, which special-cased a command-line
//! listener module, this factory's bundle is the always-on three named
//! in spec §4.9: "core, simple queue, listener, watchdog" become
//! `core`, `pqueue`, `job`; there is no listener/watchdog counterpart
//! in the distributed-runtime spec, so the bundle stops at the three
//! that have one.

use nodegrid_address::Address;
use nodegrid_jobs::{JobManager, JobManagerModule, JobSweepTask, JobStore, SafeRootList};
use nodegrid_pqueue::{PQueueModule, PQueueTask, PersistentQueueStore, QueueConfig, QueueManager};
use nodegrid_scheduler::{CoreModule, Scheduler};
use std::sync::Arc;
use std::time::Duration;

/// Shared backing stores and default tunables every node created by this
/// factory is wired up with. One `NodeFactory` per process; every node
/// it creates shares the same durable stores (spec §4.7/§4.8 imply a
/// single relational store per process, not per node).
pub struct NodeFactory {
    pqueue_store: Arc<dyn PersistentQueueStore>,
    job_store: Arc<dyn JobStore>,
    default_queue_config: QueueConfig,
    safe_roots: SafeRootList,
    pqueue_sweep_interval: Duration,
    job_sweep_interval: Duration,
}

impl NodeFactory {
    pub fn new(
        pqueue_store: Arc<dyn PersistentQueueStore>,
        job_store: Arc<dyn JobStore>,
        default_queue_config: QueueConfig,
        safe_roots: SafeRootList,
    ) -> Self {
        NodeFactory {
            pqueue_store,
            job_store,
            default_queue_config,
            safe_roots,
            pqueue_sweep_interval: Duration::from_millis(100),
            job_sweep_interval: Duration::from_millis(1_000),
        }
    }

    pub fn with_sweep_intervals(mut self, pqueue: Duration, job: Duration) -> Self {
        self.pqueue_sweep_interval = pqueue;
        self.job_sweep_interval = job;
        self
    }

    /// Create a named node (scheduler) with the fixed module bundle
    /// installed: `core`, `pqueue`, `job`. Mirrors
    /// `grdCompactNodeFactory::initModules` installing `scCoreModule`
    /// then `scSmplQueueModule` before handing the scheduler back.
    pub fn create_node(&self, own_address: Address, name: impl Into<String>) -> Scheduler {
        let mut scheduler = Scheduler::new(own_address, name);
        let shared = scheduler.shared();

        scheduler.add_module(Box::new(CoreModule::new(shared)));

        let queue_manager = Arc::new(QueueManager::new(
            self.pqueue_store.clone(),
            self.default_queue_config.clone(),
        ));
        scheduler.add_module(Box::new(PQueueModule::new(queue_manager.clone(), self.pqueue_sweep_interval)));
        scheduler.add_task(Box::new(PQueueTask::new(queue_manager, self.pqueue_sweep_interval)));

        let job_manager = Arc::new(JobManager::new(self.job_store.clone(), self.safe_roots.clone()));
        scheduler.add_module(Box::new(JobManagerModule::new(job_manager.clone(), self.job_sweep_interval)));
        scheduler.add_task(Box::new(JobSweepTask::new(job_manager, self.job_sweep_interval)));

        scheduler
    }
}
