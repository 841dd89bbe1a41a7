//! The cooperative scheduler itself (spec §4.4 "Scheduler (C4)"),
//! grounded in
//! `examples/original_source/libs/grd/include/grd/core.h`'s message
//! lifecycle comment (`gate->get -> dispatch -> ... -> gate->put`) and
//! `Scheduler.h`'s ownership list (gates, modules, tasks, registry,
//! dispatcher/directory addresses, request-id counter, handler table).

use crate::context::{RequestIdGenerator, StepContext};
use crate::handler::RequestHandler;
use crate::module::{Module, ModuleOutcome};
use crate::shared_state::SchedulerShared;
use crate::task::Task;
use nodegrid_address::{Address, AddressForm};
use nodegrid_gate::Gate;
use nodegrid_protocol::{Envelope, Event};
use nodegrid_shared::{NodegridResult, StatusCode, Value};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub struct Scheduler {
    own_address: Address,
    shared: Arc<SchedulerShared>,
    input_gates: Vec<Arc<dyn Gate>>,
    output_gates: Vec<Arc<dyn Gate>>,
    modules: Vec<Box<dyn Module>>,
    tasks: Vec<Box<dyn Task>>,
    ids: RequestIdGenerator,
    inbound: VecDeque<Envelope>,
    stop_on_idle: bool,
}

impl Scheduler {
    pub fn new(own_address: Address, name: impl Into<String>) -> Self {
        Scheduler {
            own_address,
            shared: Arc::new(SchedulerShared::new(name)),
            input_gates: Vec::new(),
            output_gates: Vec::new(),
            modules: Vec::new(),
            tasks: Vec::new(),
            ids: RequestIdGenerator::new(),
            inbound: VecDeque::new(),
            stop_on_idle: false,
        }
    }

    pub fn shared(&self) -> Arc<SchedulerShared> {
        self.shared.clone()
    }

    pub fn own_address(&self) -> &Address {
        &self.own_address
    }

    pub fn set_stop_on_idle(&mut self, value: bool) {
        self.stop_on_idle = value;
    }

    pub fn add_module(&mut self, module: Box<dyn Module>) {
        self.shared.stats.modules_count.fetch_add(1, Ordering::Relaxed);
        self.modules.push(module);
    }

    pub fn add_task(&mut self, task: Box<dyn Task>) {
        self.shared.stats.tasks_active.fetch_add(1, Ordering::Relaxed);
        self.tasks.push(task);
    }

    pub fn add_input_gate(&mut self, gate: Arc<dyn Gate>) {
        self.shared.stats.gates_count.fetch_add(1, Ordering::Relaxed);
        self.input_gates.push(gate);
    }

    pub fn add_output_gate(&mut self, gate: Arc<dyn Gate>) {
        self.shared.stats.gates_count.fetch_add(1, Ordering::Relaxed);
        self.output_gates.push(gate);
    }

    /// Mark every task stopping (spec §4.4 "Node lifecycle").
    pub fn request_stop(&mut self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        for task in &mut self.tasks {
            task.request_stop();
        }
    }

    /// False once stopped, or once idle with `stop_on_idle` set and no
    /// non-daemon tasks left.
    pub fn needs_run(&self) -> bool {
        if self.shared.stop_requested.load(Ordering::SeqCst) {
            return false;
        }
        if self.stop_on_idle {
            let non_daemon = self.tasks.iter().filter(|t| !t.is_daemon()).count();
            if non_daemon == 0 {
                return false;
            }
        }
        true
    }

    /// Send a request from this scheduler, registering `handler` for
    /// the reply (or the synthetic timeout).
    pub async fn request(
        &mut self,
        receiver: Address,
        command: impl Into<String>,
        params: Value,
        timeout_ms: u32,
        handler: Box<dyn RequestHandler>,
    ) -> NodegridResult<i64> {
        self.request_owned(receiver, command, params, timeout_ms, handler, None).await
    }

    /// Same as [`Scheduler::request`], tagging the handler with an
    /// owning task name so it is released with a comm-error if that
    /// task is destroyed before a response arrives (spec §4.6/§5).
    pub async fn request_owned(
        &mut self,
        receiver: Address,
        command: impl Into<String>,
        params: Value,
        timeout_ms: u32,
        handler: Box<dyn RequestHandler>,
        owner_task: Option<String>,
    ) -> NodegridResult<i64> {
        let request_id = self.ids.next();
        let envelope = Envelope::request(self.own_address.clone(), receiver, request_id, command, params, timeout_ms);
        self.shared.handlers.register_owned(request_id, envelope.clone(), handler, owner_task);
        self.route(envelope).await?;
        Ok(request_id)
    }

    /// Cancel an outstanding request, synthesizing a `USR_ABORT`
    /// response to its handler (spec §4.6 "Cancellation").
    pub async fn cancel_request(&self, request_id: i64) -> bool {
        self.shared.handlers.cancel_request(request_id).await
    }

    /// One non-blocking step: drain inputs, dispatch, advance tasks,
    /// run outputs, sweep. Never blocks; the embedding process decides
    /// how long to sleep between calls (`yield_busy`/`yield_wait`,
    /// implemented in `nodegrid-server`).
    pub async fn run_step(&mut self) -> NodegridResult<()> {
        for gate in self.input_gates.clone() {
            gate.run().await?;
            while let Some(env) = gate.get().await {
                self.inbound.push_back(env);
            }
        }

        let mut batch = std::mem::take(&mut self.inbound);
        while let Some(env) = batch.pop_front() {
            self.dispatch(env).await?;
        }

        let own = self.own_address.clone();
        let mut finished = Vec::new();
        for (i, task) in self.tasks.iter_mut().enumerate() {
            if !task.needs_run() {
                finished.push(i);
                continue;
            }
            let mut outbox = Vec::new();
            {
                let mut ctx = StepContext::new(&own, &mut outbox, &self.ids);
                task.run_step(&mut ctx).await?;
            }
            for env in outbox {
                self.route(env).await?;
            }
            if !task.needs_run() {
                finished.push(i);
            }
        }
        for i in finished.into_iter().rev() {
            let task = self.tasks.remove(i);
            self.shared.handlers.release_for_task(task.name()).await;
            self.shared.stats.tasks_finished.fetch_add(1, Ordering::Relaxed);
        }
        self.shared
            .stats
            .tasks_active
            .store(self.tasks.len() as u64, Ordering::Relaxed);

        let relayed: Vec<Envelope> = std::mem::take(&mut *self.shared.forward_relay.lock().unwrap_or_else(|e| e.into_inner())).into();
        for env in relayed {
            self.route(env).await?;
        }

        for gate in self.output_gates.clone() {
            gate.run().await?;
        }

        self.shared.handlers.sweep_expired().await;
        self.shared.registry.lock().unwrap_or_else(|e| e.into_inner()).validate_entries();

        Ok(())
    }

    async fn dispatch(&mut self, envelope: Envelope) -> NodegridResult<()> {
        if let AddressForm::Role { role } = &envelope.receiver.form {
            if role == "null" {
                return Ok(());
            }
        }

        if !self.is_local(&envelope.receiver) {
            return self.route(envelope).await;
        }

        match &envelope.event {
            Event::Response { .. } => {
                self.shared.handlers.deliver(&envelope).await;
                Ok(())
            }
            Event::Request { command, params, .. } => {
                let command = command.clone();
                let params = params.clone();
                self.dispatch_request(envelope, command, params).await
            }
        }
    }

    async fn dispatch_request(&mut self, envelope: Envelope, command: String, params: Value) -> NodegridResult<()> {
        let own = self.own_address.clone();
        let mut outbox = Vec::new();
        let mut outcome = None;
        {
            let mut ctx = StepContext::new(&own, &mut outbox, &self.ids);
            for module in &self.modules {
                if module.supports(&command) {
                    match module.handle_request(&envelope, &command, &params, &mut ctx).await? {
                        ModuleOutcome::Pass => continue,
                        other => {
                            outcome = Some(other);
                            break;
                        }
                    }
                }
            }
        }

        for env in outbox {
            self.route(env).await?;
        }

        let request_id = envelope.request_id();
        match outcome {
            Some(ModuleOutcome::Handled(value)) => {
                if request_id != 0 {
                    let reply = envelope.reply(StatusCode::Ok, value);
                    self.route(reply).await?;
                }
            }
            Some(ModuleOutcome::HandledNoReply) => {}
            Some(ModuleOutcome::Failed(message)) => {
                if request_id != 0 {
                    let reply = envelope.reply_error(StatusCode::Error, message);
                    self.route(reply).await?;
                }
            }
            Some(ModuleOutcome::TaskRequest(task)) => {
                self.add_task(task);
            }
            Some(ModuleOutcome::Pass) => unreachable!("Pass is filtered out of outcome above"),
            None => {
                if request_id != 0 {
                    let reply = envelope.reply_error(StatusCode::UnkMsg, format!("unknown command: {command}"));
                    self.route(reply).await?;
                }
            }
        }
        Ok(())
    }

    /// Spec §4.1's resolve() rules wired into dispatch: `@role` checks
    /// the role multimap (unchanged), and `Name`/`VPath` forms —
    /// registered via `core.reg_map`/`register_for_path` — now also
    /// check the registry's exact-match index, matching "Path and Name
    /// → exact map lookup".
    fn is_local(&self, receiver: &Address) -> bool {
        if receiver.to_wire_string() == self.own_address.to_wire_string() {
            return true;
        }
        let own_wire = self.own_address.to_wire_string();
        let registry = || self.shared.registry.lock().unwrap_or_else(|e| e.into_inner());
        match &receiver.form {
            AddressForm::Role { role } => match role.as_str() {
                "this" | "all" | "local" => true,
                "log" | "control" | "null" => false,
                _ => registry().get_addr_list_for_role(role, false).iter().any(|a| a == &own_wire),
            },
            AddressForm::Raw { value } => registry().get_addr_list_for_name(value).iter().any(|a| a == &own_wire),
            AddressForm::VPath { path } => registry().get_addr_list_for_path(path).iter().any(|a| a == &own_wire),
            AddressForm::Fixed { .. } => false,
        }
    }

    /// Deliver locally (next dispatch pass) or hand to the output gate
    /// whose protocol matches the receiver; falls back to the
    /// dispatcher address for unknown receivers (spec §4.4 "Dispatch
    /// rules").
    async fn route(&mut self, envelope: Envelope) -> NodegridResult<()> {
        if self.is_local(&envelope.receiver) {
            self.inbound.push_back(envelope);
            return Ok(());
        }
        for gate in &self.output_gates {
            if gate.supports_protocol(&envelope.receiver.protocol) {
                gate.put(envelope).await;
                return Ok(());
            }
        }
        let dispatcher = self.shared.dispatcher.read().unwrap().clone();
        if let Some(dispatcher) = dispatcher {
            let mut forwarded = envelope;
            forwarded.receiver = dispatcher;
            for gate in &self.output_gates {
                if gate.supports_protocol(&forwarded.receiver.protocol) {
                    gate.put(forwarded).await;
                    return Ok(());
                }
            }
            tracing::warn!("no output gate supports dispatcher's protocol; dropping envelope");
            return Ok(());
        }
        tracing::warn!(receiver = %envelope.receiver, "no route to receiver; dropping");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_module::CoreModule;
    use nodegrid_gate::LoopbackGate;
    use std::sync::Mutex;

    struct CapturingHandler {
        result: Arc<Mutex<Option<Value>>>,
    }

    #[async_trait::async_trait]
    impl RequestHandler for CapturingHandler {
        async fn handle_result(&self, response: &Envelope) {
            if let Event::Response { result, .. } = &response.event {
                *self.result.lock().unwrap() = Some(result.clone());
            }
        }
        async fn handle_error(&self, response: &Envelope) {
            if let Event::Response { error, .. } = &response.event {
                *self.result.lock().unwrap() = Some(Value::from(error.clone().unwrap_or_default()));
            }
        }
    }

    #[tokio::test]
    async fn echo_round_trips_between_two_schedulers_over_a_loopback_gate() {
        let addr_a = Address::raw("node-a");
        let addr_b = Address::raw("node-b");
        let (gate_a, gate_b) = LoopbackGate::pair("");
        let gate_a: Arc<dyn Gate> = Arc::new(gate_a);
        let gate_b: Arc<dyn Gate> = Arc::new(gate_b);

        let mut scheduler_a = Scheduler::new(addr_a.clone(), "node-a");
        scheduler_a.add_input_gate(gate_a.clone());
        scheduler_a.add_output_gate(gate_a);

        let mut scheduler_b = Scheduler::new(addr_b.clone(), "node-b");
        scheduler_b.add_input_gate(gate_b.clone());
        scheduler_b.add_output_gate(gate_b);
        let shared_b = scheduler_b.shared();
        scheduler_b.add_module(Box::new(CoreModule::new(shared_b)));

        let result = Arc::new(Mutex::new(None));
        scheduler_a
            .request(
                addr_b,
                "core.echo",
                Value::from("hello"),
                1000,
                Box::new(CapturingHandler { result: result.clone() }),
            )
            .await
            .unwrap();

        for _ in 0..10 {
            scheduler_a.run_step().await.unwrap();
            scheduler_b.run_step().await.unwrap();
            if result.lock().unwrap().is_some() {
                break;
            }
        }

        assert_eq!(*result.lock().unwrap(), Some(Value::from("hello")));
    }

    #[tokio::test]
    async fn unknown_command_produces_unk_msg_error() {
        let addr_a = Address::raw("node-a");
        let addr_b = Address::raw("node-b");
        let (gate_a, gate_b) = LoopbackGate::pair("");
        let gate_a: Arc<dyn Gate> = Arc::new(gate_a);
        let gate_b: Arc<dyn Gate> = Arc::new(gate_b);

        let mut scheduler_a = Scheduler::new(addr_a.clone(), "node-a");
        scheduler_a.add_input_gate(gate_a.clone());
        scheduler_a.add_output_gate(gate_a);

        let mut scheduler_b = Scheduler::new(addr_b.clone(), "node-b");
        scheduler_b.add_input_gate(gate_b.clone());
        scheduler_b.add_output_gate(gate_b);
        let shared_b = scheduler_b.shared();
        scheduler_b.add_module(Box::new(CoreModule::new(shared_b)));

        let result = Arc::new(Mutex::new(None));
        scheduler_a
            .request(
                addr_b,
                "core.nonexistent",
                Value::Null,
                1000,
                Box::new(CapturingHandler { result: result.clone() }),
            )
            .await
            .unwrap();

        for _ in 0..10 {
            scheduler_a.run_step().await.unwrap();
            scheduler_b.run_step().await.unwrap();
            if result.lock().unwrap().is_some() {
                break;
            }
        }

        let got = result.lock().unwrap().clone().unwrap();
        assert!(matches!(got, Value::String(s) if s.contains("unknown command")));
    }

    #[tokio::test]
    async fn needs_run_is_false_once_stopped() {
        let mut scheduler = Scheduler::new(Address::raw("solo"), "solo");
        assert!(scheduler.needs_run());
        scheduler.request_stop();
        assert!(!scheduler.needs_run());
    }

    #[tokio::test]
    async fn name_registered_via_reg_map_is_recognized_as_local() {
        let scheduler = Scheduler::new(Address::raw("node-a"), "node-a");
        scheduler
            .shared()
            .registry
            .lock()
            .unwrap()
            .register_for_name("node-a", "printer", nodegrid_address::EntryFeatures::empty());
        assert!(scheduler.is_local(&Address::raw("printer")));
    }

    /// Spec §4.5: `core.forward` must act as a continuation, not a
    /// synchronous reply — the original caller should see the *target's*
    /// actual result, never a literal `"forwarded"` placeholder. Node B
    /// forwards A's request back to A itself (acting as its own forward
    /// target), which exercises the full relay path — register,
    /// `HandledNoReply`, relayed request, relayed reply, correlation back
    /// to A's original request id — over a single shared gate.
    #[tokio::test]
    async fn forward_relays_the_targets_real_result_to_the_original_caller() {
        let addr_a = Address::raw("node-a");
        let addr_b = Address::raw("node-b");
        // Plain `Address::raw` carries an empty protocol tag, so the gate
        // pair must match it exactly for `Scheduler::route` to select it.
        let (gate_a, gate_b) = LoopbackGate::pair("");
        let gate_a: Arc<dyn Gate> = Arc::new(gate_a);
        let gate_b: Arc<dyn Gate> = Arc::new(gate_b);

        let mut scheduler_a = Scheduler::new(addr_a.clone(), "node-a");
        scheduler_a.add_input_gate(gate_a.clone());
        scheduler_a.add_output_gate(gate_a);
        let shared_a = scheduler_a.shared();
        scheduler_a.add_module(Box::new(CoreModule::new(shared_a)));

        let mut scheduler_b = Scheduler::new(addr_b.clone(), "node-b");
        scheduler_b.add_input_gate(gate_b.clone());
        scheduler_b.add_output_gate(gate_b);
        let shared_b = scheduler_b.shared();
        scheduler_b.add_module(Box::new(CoreModule::new(shared_b)));

        let mut forward_params = Value::map();
        forward_params.set("address", Value::from(addr_a.to_wire_string()));
        forward_params.set("fwd_command", Value::from("core.echo"));
        forward_params.set("fwd_params", Value::from("hello-via-forward"));

        let result = Arc::new(Mutex::new(None));
        scheduler_a
            .request(
                addr_b,
                "core.forward",
                forward_params,
                1000,
                Box::new(CapturingHandler { result: result.clone() }),
            )
            .await
            .unwrap();

        for _ in 0..10 {
            scheduler_a.run_step().await.unwrap();
            scheduler_b.run_step().await.unwrap();
            if result.lock().unwrap().is_some() {
                break;
            }
        }

        assert_eq!(*result.lock().unwrap(), Some(Value::from("hello-via-forward")));
    }
}
