//! The always-required `core.*` module, grounded in
//! `examples/original_source/libs/grd/include/grd/CoreModule.h`
//! (`scCoreModule`)'s documented command list. `run`/`run_cmd` are
//! implemented as a plain file read and a subprocess call respectively
//! — there is no embedded scripting/macro language behind them, matching
//! how little of `CommandParser`'s grammar survives the rest of this
//! crate.

use crate::context::StepContext;
use crate::handler::RequestHandler;
use crate::module::{Module, ModuleOutcome};
use crate::shared_state::SchedulerShared;
use async_trait::async_trait;
use nodegrid_address::{Address, EntryFeatures, Registry};
use nodegrid_protocol::{Envelope, Event};
use nodegrid_shared::{NodegridResult, StatusCode, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub struct CoreModule {
    shared: Arc<SchedulerShared>,
}

impl CoreModule {
    pub fn new(shared: Arc<SchedulerShared>) -> Self {
        CoreModule { shared }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.shared.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Module for CoreModule {
    fn name(&self) -> &str {
        "core"
    }

    fn interfaces(&self) -> &[&str] {
        &["core"]
    }

    async fn handle_request(
        &self,
        envelope: &Envelope,
        command: &str,
        params: &Value,
        ctx: &mut StepContext<'_>,
    ) -> NodegridResult<ModuleOutcome> {
        let verb = command.strip_prefix("core.").unwrap_or(command);
        match verb {
            "echo" => Ok(ModuleOutcome::Handled(params.clone())),

            "if_equ" => {
                let eq = params.get("a") == params.get("b");
                Ok(ModuleOutcome::Handled(Value::Bool(eq)))
            }
            "if_diff" => {
                let diff = params.get("a") != params.get("b");
                Ok(ModuleOutcome::Handled(Value::Bool(diff)))
            }

            "set_dispatcher" => {
                let addr = Address::parse(params.get_str_or("address", ""))?;
                *self.shared.dispatcher.write().unwrap() = Some(addr);
                Ok(ModuleOutcome::HandledNoReply)
            }
            "set_directory" => {
                let addr = Address::parse(params.get_str_or("address", ""))?;
                *self.shared.directory.write().unwrap() = Some(addr);
                Ok(ModuleOutcome::HandledNoReply)
            }
            "set_name" => {
                *self.shared.name.write().unwrap() = params.get_str_or("name", "").to_string();
                Ok(ModuleOutcome::HandledNoReply)
            }
            "set_var" => {
                let name = params.get_str_or("name", "");
                if name.is_empty() {
                    return Ok(ModuleOutcome::Failed("set_var requires a non-empty name".into()));
                }
                let value = params.get("value").cloned().unwrap_or(Value::Null);
                self.shared.vars.insert(name.to_string(), value);
                Ok(ModuleOutcome::HandledNoReply)
            }
            "import_env" => {
                let name = params.get_str_or("var_name", "");
                match std::env::var(name) {
                    Ok(v) => {
                        self.shared.vars.insert(name.to_string(), Value::from(v));
                        Ok(ModuleOutcome::HandledNoReply)
                    }
                    Err(_) => Ok(ModuleOutcome::Failed(format!("environment variable {name} not set"))),
                }
            }
            "flush_events" => Ok(ModuleOutcome::HandledNoReply),

            "set_option" => {
                let name = params.get_str_or("name", "");
                let value = params.get_bool_or("value", false);
                match name {
                    "show_processing_time" => {
                        self.shared.flags.log_proc_time.store(value, Ordering::Relaxed);
                        Ok(ModuleOutcome::HandledNoReply)
                    }
                    "log_messages" => {
                        self.shared.flags.log_messages.store(value, Ordering::Relaxed);
                        Ok(ModuleOutcome::HandledNoReply)
                    }
                    "trace_msgs" => {
                        self.shared.flags.trace_msgs.store(value, Ordering::Relaxed);
                        Ok(ModuleOutcome::HandledNoReply)
                    }
                    other => Ok(ModuleOutcome::Failed(format!("unknown option: {other}"))),
                }
            }

            "get_stats" => Ok(ModuleOutcome::Handled(self.shared.stats.snapshot())),

            "shutdown_node" => {
                self.shared.stop_requested.store(true, Ordering::SeqCst);
                Ok(ModuleOutcome::HandledNoReply)
            }
            "restart_node" => {
                self.shared.restart_requested.store(true, Ordering::SeqCst);
                self.shared.stop_requested.store(true, Ordering::SeqCst);
                Ok(ModuleOutcome::HandledNoReply)
            }
            "sleep" => {
                let ms = params.get_i64_or("time", 0).max(0) as u64;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ModuleOutcome::HandledNoReply)
            }

            "reg_node" => {
                let source = params.get_str_or("source", "");
                let target = params.get_str_or("target", "");
                let public = params.get_bool_or("public", false);
                let direct = params.get_bool_or("direct_contact", false);
                let mut features = EntryFeatures::empty();
                if public {
                    features = features | EntryFeatures::PUBLIC;
                }
                if direct {
                    features = features | EntryFeatures::DIRECT_MODE;
                }
                let source = if source.is_empty() {
                    uuid::Uuid::new_v4().to_string()
                } else {
                    source.to_string()
                };
                let handle = if let Some(role) = target.strip_prefix('@') {
                    self.registry().register_for_role(&source, role, features)
                } else {
                    self.registry().register_for_name(&source, target, features)
                };
                let mut result = Value::map();
                result.set("id", Value::from(source));
                result.set("handle", Value::UInt(handle));
                Ok(ModuleOutcome::Handled(result))
            }
            "reg_node_at" => {
                let exec_at = Address::parse(params.get_str_or("exec_at_addr", ""))?;
                let mut fwd_params = Value::map();
                fwd_params.set("source", Value::from(envelope.sender.to_wire_string()));
                fwd_params.set("target", params.get("source_name").cloned().unwrap_or(Value::Null));
                ctx.post(Envelope::request(
                    envelope.sender.clone(),
                    exec_at,
                    ctx.next_request_id(),
                    "core.reg_node",
                    fwd_params,
                    envelope.timeout_ms,
                ));
                Ok(ModuleOutcome::HandledNoReply)
            }
            "reg_map" => {
                let name = params.get_str_or("name", "");
                let target = params.get_str_or("target", "");
                self.registry().register_for_name(target, name, EntryFeatures::empty());
                Ok(ModuleOutcome::HandledNoReply)
            }

            "advertise" => {
                let role = params.get_str_or("role", "");
                let key = params.get_str_or("key", "");
                let addrs = if key.is_empty() {
                    self.registry().get_addr_list_for_role(role, false)
                } else {
                    self.registry().get_addr_list_for_role_and_key(role, key, false)
                };
                if !addrs.is_empty() {
                    let list = addrs.into_iter().map(Value::String).collect();
                    return Ok(ModuleOutcome::Handled(Value::List(list)));
                }
                let directory = self.shared.directory.read().unwrap().clone();
                match directory {
                    Some(dir) => {
                        ctx.post(Envelope {
                            sender: envelope.sender.clone(),
                            receiver: dir,
                            timeout_ms: envelope.timeout_ms,
                            event: Event::request(envelope.request_id(), command, params.clone()),
                        });
                        Ok(ModuleOutcome::HandledNoReply)
                    }
                    None => Ok(ModuleOutcome::Failed(format!("unknown alias: {role}"))),
                }
            }
            "forward" => {
                let target = Address::parse(params.get_str_or("address", ""))?;
                let fwd_command = params.get_str_or("fwd_command", "");
                let fwd_params = params.get("fwd_params").cloned().unwrap_or(Value::Null);
                let fwd_request_id = ctx.next_request_id();
                let relay = Envelope::request(
                    ctx.own_address.clone(),
                    target,
                    fwd_request_id,
                    fwd_command,
                    fwd_params,
                    envelope.timeout_ms,
                );
                self.shared.handlers.register(
                    fwd_request_id,
                    envelope.clone(),
                    Box::new(ForwardHandler {
                        shared: self.shared.clone(),
                        original: envelope.clone(),
                    }),
                );
                ctx.post(relay);
                Ok(ModuleOutcome::HandledNoReply)
            }

            "run_cmd" => {
                let cmd = params.get_str_or("cmd", "");
                if cmd.is_empty() {
                    return Ok(ModuleOutcome::Failed("run_cmd requires cmd".into()));
                }
                let mut parts = cmd.split_whitespace();
                let Some(program) = parts.next() else {
                    return Ok(ModuleOutcome::Failed("run_cmd requires cmd".into()));
                };
                let output = tokio::process::Command::new(program)
                    .args(parts)
                    .output()
                    .await;
                match output {
                    Ok(out) => {
                        let mut result = Value::map();
                        result.set("stdout", Value::from(String::from_utf8_lossy(&out.stdout).into_owned()));
                        result.set("stderr", Value::from(String::from_utf8_lossy(&out.stderr).into_owned()));
                        result.set("exit_code", Value::Int(out.status.code().unwrap_or(-1) as i64));
                        Ok(ModuleOutcome::Handled(result))
                    }
                    Err(e) => Ok(ModuleOutcome::Failed(format!("run_cmd failed: {e}"))),
                }
            }
            "run" => {
                let path = params.get_str_or("script_file", "");
                match tokio::fs::read_to_string(path).await {
                    Ok(content) => Ok(ModuleOutcome::Handled(Value::from(content))),
                    Err(e) => Ok(ModuleOutcome::Failed(format!("could not read {path}: {e}"))),
                }
            }

            "create_node" | "add_gate" => Ok(ModuleOutcome::Failed(format!(
                "{verb} requires a node/gate factory, which core does not provide"
            ))),

            _ => Ok(ModuleOutcome::Pass),
        }
    }
}

/// The continuation `core.forward` registers in place of an immediate
/// reply (spec §4.5): relays the forward target's real response back to
/// the original requester under the original request id. Grounded in
/// `examples/original_source/libs/grd/src/grd/CoreModule.cpp`'s
/// `scForwardHandler`, which does the same via `SC_MSG_STATUS_FORWARDED`.
struct ForwardHandler {
    shared: Arc<SchedulerShared>,
    original: Envelope,
}

#[async_trait]
impl RequestHandler for ForwardHandler {
    async fn handle_result(&self, response: &Envelope) {
        let result = match &response.event {
            Event::Response { result, .. } => result.clone(),
            Event::Request { .. } => Value::Null,
        };
        let relay = self.original.reply(StatusCode::Forwarded, result);
        self.shared.forward_relay.lock().unwrap_or_else(|e| e.into_inner()).push_back(relay);
    }

    async fn handle_error(&self, response: &Envelope) {
        let (status, message) = match &response.event {
            Event::Response { status, error, .. } => (*status, error.clone().unwrap_or_default()),
            Event::Request { .. } => (StatusCode::Error, String::new()),
        };
        let relay = self.original.reply_error(status, message);
        self.shared.forward_relay.lock().unwrap_or_else(|e| e.into_inner()).push_back(relay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestIdGenerator;

    fn module() -> CoreModule {
        CoreModule::new(Arc::new(SchedulerShared::new("test-node")))
    }

    fn envelope(command: &str, params: Value) -> Envelope {
        Envelope::request(Address::raw("caller"), Address::raw("node"), 1, command, params, 0)
    }

    #[tokio::test]
    async fn echo_returns_params_unchanged() {
        let m = module();
        let ids = RequestIdGenerator::new();
        let own = Address::raw("node");
        let mut outbox = Vec::new();
        let mut ctx = StepContext::new(&own, &mut outbox, &ids);
        let env = envelope("core.echo", Value::from("hello"));
        let outcome = m.handle_request(&env, "core.echo", &Value::from("hello"), &mut ctx).await.unwrap();
        match outcome {
            ModuleOutcome::Handled(v) => assert_eq!(v, Value::from("hello")),
            _ => panic!("expected Handled"),
        }
    }

    #[tokio::test]
    async fn set_var_then_get_stats_round_trips_through_shared_state() {
        let shared = Arc::new(SchedulerShared::new("test-node"));
        let m = CoreModule::new(shared.clone());
        let ids = RequestIdGenerator::new();
        let own = Address::raw("node");
        let mut outbox = Vec::new();
        let mut ctx = StepContext::new(&own, &mut outbox, &ids);

        let mut params = Value::map();
        params.set("name", Value::from("greeting"));
        params.set("value", Value::from("hi"));
        let env = envelope("core.set_var", params.clone());
        let outcome = m.handle_request(&env, "core.set_var", &params, &mut ctx).await.unwrap();
        assert!(matches!(outcome, ModuleOutcome::HandledNoReply));
        assert_eq!(shared.vars.get("greeting").map(|v| v.clone()), Some(Value::from("hi")));
    }

    #[tokio::test]
    async fn unknown_command_passes() {
        let m = module();
        let ids = RequestIdGenerator::new();
        let own = Address::raw("node");
        let mut outbox = Vec::new();
        let mut ctx = StepContext::new(&own, &mut outbox, &ids);
        let env = envelope("core.nope", Value::Null);
        let outcome = m.handle_request(&env, "core.nope", &Value::Null, &mut ctx).await.unwrap();
        assert!(matches!(outcome, ModuleOutcome::Pass));
    }

    #[tokio::test]
    async fn reg_node_with_role_target_is_resolvable_via_advertise() {
        let m = module();
        let ids = RequestIdGenerator::new();
        let own = Address::raw("node");
        let mut outbox = Vec::new();
        let mut ctx = StepContext::new(&own, &mut outbox, &ids);

        let mut reg_params = Value::map();
        reg_params.set("source", Value::from("svc::#hostA/n1/"));
        reg_params.set("target", Value::from("@worker"));
        reg_params.set("direct_contact", Value::Bool(true));
        let env = envelope("core.reg_node", reg_params.clone());
        m.handle_request(&env, "core.reg_node", &reg_params, &mut ctx).await.unwrap();

        let mut adv_params = Value::map();
        adv_params.set("role", Value::from("worker"));
        let env2 = envelope("core.advertise", adv_params.clone());
        let outcome = m.handle_request(&env2, "core.advertise", &adv_params, &mut ctx).await.unwrap();
        match outcome {
            ModuleOutcome::Handled(Value::List(addrs)) => {
                assert_eq!(addrs, vec![Value::from("svc::#hostA/n1/")]);
            }
            _ => panic!("expected a resolved address list"),
        }
    }

    #[tokio::test]
    async fn reg_node_without_direct_contact_resolves_to_role_address() {
        let m = module();
        let ids = RequestIdGenerator::new();
        let own = Address::raw("node");
        let mut outbox = Vec::new();
        let mut ctx = StepContext::new(&own, &mut outbox, &ids);

        let mut reg_params = Value::map();
        reg_params.set("source", Value::from("svc::#hostA/n1/"));
        reg_params.set("target", Value::from("@worker"));
        let env = envelope("core.reg_node", reg_params.clone());
        m.handle_request(&env, "core.reg_node", &reg_params, &mut ctx).await.unwrap();

        let mut adv_params = Value::map();
        adv_params.set("role", Value::from("worker"));
        let env2 = envelope("core.advertise", adv_params.clone());
        let outcome = m.handle_request(&env2, "core.advertise", &adv_params, &mut ctx).await.unwrap();
        match outcome {
            ModuleOutcome::Handled(Value::List(addrs)) => {
                assert_eq!(addrs, vec![Value::from("@worker")]);
            }
            _ => panic!("expected a resolved address list"),
        }
    }

    #[tokio::test]
    async fn advertise_with_no_match_and_no_directory_fails() {
        let m = module();
        let ids = RequestIdGenerator::new();
        let own = Address::raw("node");
        let mut outbox = Vec::new();
        let mut ctx = StepContext::new(&own, &mut outbox, &ids);
        let mut params = Value::map();
        params.set("role", Value::from("ghost"));
        let env = envelope("core.advertise", params.clone());
        let outcome = m.handle_request(&env, "core.advertise", &params, &mut ctx).await.unwrap();
        assert!(matches!(outcome, ModuleOutcome::Failed(_)));
    }
}
