//! Task contract, grounded in
//! `examples/original_source/libs/grd/include/grd/WorkerTask.h`
//! (`scWorkerTask`/`scTask`): a piece of work the scheduler advances by
//! calling `run_step` repeatedly until `needs_run()` goes false.
//! `run_step` never blocks — long work splits itself across calls (spec
//! §4.4 "no preemption within a task's `runStep`").

use crate::context::StepContext;
use async_trait::async_trait;
use nodegrid_shared::NodegridResult;

#[async_trait]
pub trait Task: Send {
    fn name(&self) -> &str;

    /// Daemon tasks don't count toward "zero non-daemon tasks" in
    /// `Scheduler::needs_run` (spec §4.4 "Node lifecycle").
    fn is_daemon(&self) -> bool {
        false
    }

    fn needs_run(&self) -> bool;

    fn request_stop(&mut self);

    /// Advance the task by one time slice. Returns the number of work
    /// units processed (0 if the task had nothing to do this step).
    async fn run_step(&mut self, ctx: &mut StepContext<'_>) -> NodegridResult<i32>;
}
