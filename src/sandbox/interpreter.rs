use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::builtins;
use super::module::{Arg, CompiledCallable, CompiledModule, NodeSource};
use super::registry::{Args, CallContext, Registry};
use super::SandboxError;
use crate::scheduler::task::{Details, ParamValue, Params};

/// Public signature of an entry point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryPoint {
    pub name: String,
    pub params: IndexMap<String, String>,
    pub returns: Vec<String>,
}

impl From<&CompiledCallable> for EntryPoint {
    fn from(callable: &CompiledCallable) -> Self {
        Self {
            name: callable.name.clone(),
            params: callable.params.clone(),
            returns: callable.returns.clone(),
        }
    }
}

/// Outputs of one invocation plus everything the workflow printed.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub outputs: Vec<Value>,
    pub printed: Vec<String>,
}

impl Invocation {
    pub fn into_value(self) -> Value {
        Value::Array(self.outputs)
    }
}

/// A resolved module: its entry points and config, ready to invoke.
#[derive(Debug, Clone)]
pub struct ModuleBundle {
    module: Arc<CompiledModule>,
    registry: Arc<Registry>,
    entry_points: Vec<EntryPoint>,
}

impl ModuleBundle {
    pub(crate) fn new(
        module: Arc<CompiledModule>,
        registry: Arc<Registry>,
        entry_points: Vec<EntryPoint>,
    ) -> Self {
        Self {
            module,
            registry,
            entry_points,
        }
    }

    pub fn name(&self) -> &str {
        &self.module.name
    }

    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }

    /// The module's `config` object.
    pub fn config(&self) -> &Map<String, Value> {
        &self.module.config
    }

    pub fn find_callable(&self, name: &str) -> Result<&CompiledCallable, SandboxError> {
        if !self.entry_points.iter().any(|e| e.name == name) {
            return Err(SandboxError::CallableNotFound(name.to_string()));
        }
        self.module
            .callables
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| SandboxError::CallableNotFound(name.to_string()))
    }

    /// Describe an entry point's parameters and node options without doing
    /// any work.
    pub fn prepare(&self, name: &str, details: &Details) -> Result<Value, SandboxError> {
        let callable = self.find_callable(name)?;
        let params: Map<String, Value> = callable
            .params
            .keys()
            .map(|p| (p.clone(), Value::Null))
            .collect();

        let printed = RefCell::new(Vec::new());
        self.run(callable, &params, details, true, None, &printed)?;

        let mut config = Map::new();
        for (node_name, node) in &callable.nodes {
            if !node.options.is_empty() {
                let options = effective_options(node_name, node, details)?;
                config.insert(node_name.clone(), Value::Object(options));
            }
        }

        Ok(json!({
            "callable": callable.name,
            "params": callable.params,
            "returns": callable.returns,
            "config": config,
        }))
    }

    /// Run an entry point. `timeout` is checked between nodes.
    pub fn invoke(
        &self,
        name: &str,
        params: &Params,
        details: &Details,
        timeout: Option<Duration>,
    ) -> Result<Invocation, SandboxError> {
        let callable = self.find_callable(name)?;
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let resolved = self.resolve_params(callable, params)?;

        let printed = RefCell::new(Vec::new());
        let mut values = self.run(callable, &resolved, details, false, deadline, &printed)?;
        let outputs = callable
            .outputs
            .iter()
            .map(|o| values.remove(o).unwrap_or(Value::Null))
            .collect();

        tracing::debug!(
            module = %self.module.name,
            callable = name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Invocation finished"
        );
        Ok(Invocation {
            outputs,
            printed: printed.into_inner(),
        })
    }

    /// Turn wire parameters into values, building constructor references
    /// through the registry.
    pub fn resolve_params(
        &self,
        callable: &CompiledCallable,
        params: &Params,
    ) -> Result<Map<String, Value>, SandboxError> {
        if let Some(extra) = params.keys().find(|k| !callable.params.contains_key(*k)) {
            return Err(SandboxError::UnexpectedParam {
                callable: callable.name.clone(),
                param: extra.clone(),
            });
        }

        let mut resolved = Map::new();
        for (name, declared) in &callable.params {
            let value = match params.get(name) {
                None => {
                    return Err(SandboxError::MissingParam {
                        callable: callable.name.clone(),
                        param: name.clone(),
                    })
                }
                Some(ParamValue::Constructor { function, params }) => {
                    let ctor = self
                        .registry
                        .constructor(function)
                        .ok_or_else(|| SandboxError::UnknownConstructor(function.clone()))?;
                    ctor(params).map_err(|source| SandboxError::Constructor {
                        param: name.clone(),
                        function: function.clone(),
                        source,
                    })?
                }
                Some(ParamValue::Literal(value)) => {
                    if let Some(expected) = type_mismatch(declared, value) {
                        return Err(SandboxError::InvalidParam {
                            param: name.clone(),
                            expected,
                        });
                    }
                    value.clone()
                }
            };
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }

    fn run(
        &self,
        callable: &CompiledCallable,
        params: &Map<String, Value>,
        details: &Details,
        prepare: bool,
        deadline: Option<Instant>,
        printed: &RefCell<Vec<String>>,
    ) -> Result<HashMap<String, Value>, SandboxError> {
        let mut values: HashMap<String, Value> = HashMap::new();

        for node_name in &callable.order {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(SandboxError::Timeout {
                    callable: callable.name.clone(),
                    node: node_name.clone(),
                });
            }

            let node = &callable.nodes[node_name];
            let options = effective_options(node_name, node, details)?;
            let args: Args = node
                .args
                .iter()
                .map(|(k, a)| (k.clone(), evaluate(a, params, &values)))
                .collect();
            let ctx = CallContext::new(prepare, node_name, &options, printed);

            let outcome = if builtins::is_builtin(&node.op) {
                if prepare {
                    Ok(Value::Null)
                } else {
                    builtins::call(&node.op, &ctx, &args).unwrap_or(Ok(Value::Null))
                }
            } else {
                let f = self
                    .registry
                    .function(&node.op)
                    .ok_or_else(|| SandboxError::UnknownFunction {
                        node: node_name.clone(),
                        op: node.op.clone(),
                    })?;
                f(&ctx, &args)
            };

            let value = outcome.map_err(|source| SandboxError::Node {
                node: node_name.clone(),
                op: node.op.clone(),
                source,
            })?;
            values.insert(node_name.clone(), value);
        }
        Ok(values)
    }
}

/// Declared option defaults overridden by `details[node]`.
fn effective_options(
    node_name: &str,
    node: &NodeSource,
    details: &Details,
) -> Result<Map<String, Value>, SandboxError> {
    let mut options: Map<String, Value> = node
        .options
        .iter()
        .map(|(k, spec)| (k.clone(), spec.default.clone()))
        .collect();
    match details.get(node_name) {
        None | Some(Value::Null) => {}
        Some(Value::Object(overrides)) => {
            for (k, v) in overrides {
                options.insert(k.clone(), v.clone());
            }
        }
        Some(_) => return Err(SandboxError::InvalidDetails(node_name.to_string())),
    }
    Ok(options)
}

fn evaluate(arg: &Arg, params: &Map<String, Value>, values: &HashMap<String, Value>) -> Value {
    match arg {
        Arg::Node(r) => values.get(&r.node).cloned().unwrap_or(Value::Null),
        Arg::Param(p) => params.get(&p.param).cloned().unwrap_or(Value::Null),
        Arg::List(items) => Value::Array(items.iter().map(|a| evaluate(a, params, values)).collect()),
        Arg::Literal(v) => v.clone(),
    }
}

/// Check a literal against a primitive declared type. Other types are not
/// checked.
fn type_mismatch(declared: &str, value: &Value) -> Option<&'static str> {
    let (ok, expected) = match declared {
        "int" => (value.is_i64() || value.is_u64(), "an integer"),
        "float" => (value.is_number(), "a number"),
        "str" => (value.is_string(), "a string"),
        "bool" => (value.is_boolean(), "a boolean"),
        "list" => (value.is_array(), "a list"),
        "dict" => (value.is_object(), "a mapping"),
        _ => (true, ""),
    };
    (!ok).then_some(expected)
}
