//! Module contract, grounded in
//! `examples/original_source/libs/grd/include/grd/CoreModule.h`
//! (`scModule`/`scCoreModule`): one module owns a set of `iface.verb`
//! command prefixes; the scheduler tries modules in order and stops at
//! the first one whose interface set contains the command's prefix.

use crate::context::StepContext;
use async_trait::async_trait;
use nodegrid_protocol::Envelope;
use nodegrid_shared::{NodegridResult, Value};

/// What a module did with a dispatched request, matching the status
/// taxonomy's `Ok`/`Pass`/`TaskReq` distinction (spec §4.4 "Dispatch
/// rules").
pub enum ModuleOutcome {
    /// Fully handled; carries the result to send back (ignored for
    /// fire-and-forget requests).
    Handled(Value),
    /// Handled with no reply owed (e.g. `core.set_var`).
    HandledNoReply,
    /// Handled, but failed; the scheduler turns this into an error
    /// response with the given message.
    Failed(String),
    /// This module doesn't recognize the command; try the next one.
    Pass,
    /// The module wants a task installed to continue this request
    /// asynchronously (spec's `TASK_REQ`). The scheduler installs
    /// `task` and leaves the request outstanding.
    TaskRequest(Box<dyn crate::task::Task>),
}

#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Interface prefixes this module claims, e.g. `["core"]`.
    fn interfaces(&self) -> &[&str];

    fn supports(&self, command: &str) -> bool {
        let Some((iface, _verb)) = command.split_once('.') else {
            return false;
        };
        self.interfaces().contains(&iface)
    }

    async fn handle_request(
        &self,
        envelope: &Envelope,
        command: &str,
        params: &Value,
        ctx: &mut StepContext<'_>,
    ) -> NodegridResult<ModuleOutcome>;
}
