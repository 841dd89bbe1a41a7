//! Multi-scheduler process driver, grounded directly in
//! `examples/original_source/libs/grd/src/grd/CompactServer.cpp`
//! (`grdCompactServer::run`/`runSchedulers`/`needsRun`/`runYieldBusy`/
//! `runYieldWait`/`calcSleepTimeForWait`). A compact server owns every
//! scheduler (node) in the process and steps them all in each
//! `run_step`; `yield_busy`/`yield_wait` are the embedding entry points
//! for cooperative hosts (spec §4.9) that want to interleave their own
//! work between steps while still driving the schedulers forward.

use nodegrid_scheduler::Scheduler;
use nodegrid_shared::config::SchedulerConfig;
use nodegrid_shared::NodegridResult;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Exponentially-smoothed average of recent `run_step` wall-clock time,
/// used to size the idle sleep in `yield_wait` (spec §4.4 "Suspension
/// points": "1-100ms based on an exponentially-smoothed average of
/// scheduler run time"). Grounded in `calcSleepTimeForWait`'s
/// `AVG_FACTOR`-weighted blend of the running average and the last
/// sample.
struct RunTimeAverage {
    avg_ms: f64,
    alpha: f64,
}

impl RunTimeAverage {
    fn new(alpha: f64) -> Self {
        RunTimeAverage { avg_ms: 0.0, alpha }
    }

    fn sample(&mut self, elapsed: Duration) -> f64 {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_ms = self.alpha * ms + (1.0 - self.alpha) * self.avg_ms;
        self.avg_ms
    }
}

/// Drives every named scheduler registered in the process. Stands in
/// for `grdCompactServer`'s `m_localRegistry` of nodes.
pub struct CompactServer {
    nodes: HashMap<String, Scheduler>,
    config: SchedulerConfig,
    run_time_avg: RunTimeAverage,
    stop_on_idle: bool,
}

impl CompactServer {
    pub fn new(config: SchedulerConfig) -> Self {
        CompactServer {
            nodes: HashMap::new(),
            run_time_avg: RunTimeAverage::new(config.yield_smoothing_alpha),
            config,
            stop_on_idle: false,
        }
    }

    pub fn set_stop_on_idle(&mut self, value: bool) {
        self.stop_on_idle = value;
        for node in self.nodes.values_mut() {
            node.set_stop_on_idle(value);
        }
    }

    /// Register an already-constructed node (typically produced by
    /// [`crate::NodeFactory::create_node`]).
    pub fn add_node(&mut self, name: impl Into<String>, mut scheduler: Scheduler) {
        scheduler.set_stop_on_idle(self.stop_on_idle);
        self.nodes.insert(name.into(), scheduler);
    }

    pub fn node(&self, name: &str) -> Option<&Scheduler> {
        self.nodes.get(name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Scheduler> {
        self.nodes.get_mut(name)
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Ask every node to stop (spec §4.4 "Node lifecycle").
    pub fn request_stop(&mut self) {
        for node in self.nodes.values_mut() {
            node.request_stop();
        }
    }

    /// True while any node still needs running, mirroring
    /// `grdCompactServer::needsRun`.
    pub fn needs_run(&self) -> bool {
        self.nodes.values().any(|n| n.needs_run())
    }

    /// Step every node exactly once. Returns the number of nodes that
    /// still need another step afterward (grdCompactServer's
    /// `runSchedulers` return-as-"busy" signal, expressed as a count).
    async fn run_schedulers(&mut self) -> NodegridResult<usize> {
        let mut still_busy = 0;
        for (name, node) in self.nodes.iter_mut() {
            if let Err(e) = node.run_step().await {
                tracing::error!(node = %name, error = %e, "node run_step failed");
                continue;
            }
            if node.needs_run() {
                still_busy += 1;
            }
        }
        Ok(still_busy)
    }

    /// Drive every node's `run_step` once, accepting CPU time "during
    /// processing" the way `grdCompactServer::runYieldBusy` does for an
    /// embedding host that is itself busy (no sleep regardless of
    /// outcome — the caller already has work to return to).
    pub async fn yield_busy(&mut self) -> NodegridResult<()> {
        let start = Instant::now();
        self.run_schedulers().await?;
        self.run_time_avg.sample(start.elapsed());
        Ok(())
    }

    /// Drive every node's `run_step` once and, if none of them had
    /// work, sleep for a duration derived from the smoothed average
    /// run time (spec §4.4; `calcSleepTimeForWait`). Intended for a
    /// host that has nothing else to do between calls.
    pub async fn yield_wait(&mut self) -> NodegridResult<()> {
        let start = Instant::now();
        let busy_count = self.run_schedulers().await?;
        let avg = self.run_time_avg.sample(start.elapsed());

        if busy_count == 0 {
            let sleep_ms = avg.round().clamp(
                self.config.yield_min_ms as f64,
                self.config.yield_max_ms as f64,
            ) as u64;
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
        Ok(())
    }

    /// Run until every node's `needs_run()` goes false (`requestStop`
    /// plus drain), sleeping via [`Self::yield_wait`] between steps.
    /// Mirrors `grdCompactServer::waitForStop`.
    pub async fn run_until_stopped(&mut self) -> NodegridResult<()> {
        while self.needs_run() {
            self.yield_wait().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodegrid_address::Address;

    #[tokio::test]
    async fn compact_server_drives_a_solo_node_to_idle_stop() {
        let mut server = CompactServer::new(SchedulerConfig::default());
        server.set_stop_on_idle(true);
        let scheduler = Scheduler::new(Address::raw("solo"), "solo");
        server.add_node("solo", scheduler);

        assert!(server.needs_run());
        server.request_stop();
        assert!(!server.needs_run());
    }

    #[tokio::test]
    async fn yield_wait_sleeps_when_nothing_is_busy() {
        let mut server = CompactServer::new(SchedulerConfig::default());
        let scheduler = Scheduler::new(Address::raw("solo"), "solo");
        server.add_node("solo", scheduler);

        let start = Instant::now();
        server.yield_wait().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1));
    }
}
