//! Job definitions, grounded in
//! `examples/original_source/libs/grd/include/grd/JobManagerModule.h`'s
//! `job.define`/`job.change_def` doc comments ("each param is named",
//! resolution order base → definition → start overrides) and spec §3's
//! `Job definition` shape.

use nodegrid_shared::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobParamClass {
    Sys,
    Job,
}

impl JobParamClass {
    pub fn as_str(self) -> &'static str {
        match self {
            JobParamClass::Sys => "sys",
            JobParamClass::Job => "job",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParam {
    pub class: JobParamClass,
    pub value: Value,
}

/// `{id, name, base?, command, params: map<name, {class, value}>}` (spec
/// §3 "Job definition"). `base` names another definition whose params
/// are inherited unless overridden here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: u64,
    pub name: String,
    pub base: Option<String>,
    pub command: String,
    pub params: BTreeMap<String, JobParam>,
}

impl JobDefinition {
    pub fn new(id: u64, name: impl Into<String>, base: Option<String>, command: impl Into<String>) -> Self {
        JobDefinition { id, name: name.into(), base, command: command.into(), params: BTreeMap::new() }
    }

    pub fn set_param(&mut self, name: impl Into<String>, class: JobParamClass, value: Value) {
        self.params.insert(name.into(), JobParam { class, value });
    }
}

/// Resolve effective params in the documented order: `base` definition
/// first, then this definition's own params, then caller-supplied
/// start-time overrides (spec §4.8 "Job definitions").
pub fn resolve_params(
    base: Option<&JobDefinition>,
    definition: &JobDefinition,
    overrides: &Value,
) -> BTreeMap<String, Value> {
    let mut resolved = BTreeMap::new();
    if let Some(base) = base {
        for (name, param) in &base.params {
            resolved.insert(name.clone(), param.value.clone());
        }
    }
    for (name, param) in &definition.params {
        resolved.insert(name.clone(), param.value.clone());
    }
    if let Some(map) = overrides.as_map() {
        for (name, value) in map {
            resolved.insert(name.clone(), value.clone());
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_order_is_base_then_definition_then_overrides() {
        let mut base = JobDefinition::new(1, "_default", None, "noop");
        base.set_param("retry_limit", JobParamClass::Sys, Value::Int(1));
        base.set_param("chunk_count", JobParamClass::Job, Value::Int(10));

        let mut def = JobDefinition::new(2, "import", Some("_default".into()), "import_cmd");
        def.set_param("chunk_count", JobParamClass::Job, Value::Int(20));

        let mut overrides = Value::map();
        overrides.set("chunk_count", Value::Int(99));

        let resolved = resolve_params(Some(&base), &def, &overrides);
        assert_eq!(resolved.get("retry_limit"), Some(&Value::Int(1)));
        assert_eq!(resolved.get("chunk_count"), Some(&Value::Int(99)));
    }
}
