//! Workflow module format and the restricted compiler.
//!
//! A module is a YAML document of named entry points, each a graph of nodes.
//! Compiling checks the graph's shape without looking anything up in the
//! registry; capability checks happen when the module is executed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::SandboxError;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleSource {
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub callables: IndexMap<String, CallableSource>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallableSource {
    /// Parameter name to declared type.
    #[serde(default)]
    pub params: IndexMap<String, String>,
    #[serde(default)]
    pub returns: Vec<String>,
    #[serde(default)]
    pub nodes: IndexMap<String, NodeSource>,
    /// Nodes whose values are returned, in order.
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSource {
    pub op: String,
    #[serde(default)]
    pub args: IndexMap<String, Arg>,
    #[serde(default)]
    pub options: IndexMap<String, OptionSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptionSpec {
    #[serde(default)]
    pub default: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeRef {
    #[serde(rename = "ref")]
    pub node: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamRef {
    pub param: String,
}

/// A node argument: another node's value, an entry point parameter, a list
/// of arguments, or a literal.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    Node(NodeRef),
    Param(ParamRef),
    List(Vec<Arg>),
    Literal(Value),
}

impl Arg {
    fn visit<'a>(&'a self, nodes: &mut Vec<&'a str>, params: &mut Vec<&'a str>) {
        match self {
            Arg::Node(r) => nodes.push(&r.node),
            Arg::Param(p) => params.push(&p.param),
            Arg::List(items) => items.iter().for_each(|a| a.visit(nodes, params)),
            Arg::Literal(_) => {}
        }
    }
}

/// An entry point that passed the compiler.
#[derive(Debug, Clone)]
pub struct CompiledCallable {
    pub name: String,
    pub params: IndexMap<String, String>,
    pub returns: Vec<String>,
    pub nodes: IndexMap<String, NodeSource>,
    /// Node names in dependency order.
    pub order: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub name: String,
    pub path: PathBuf,
    pub imports: Vec<String>,
    pub config: Map<String, Value>,
    pub callables: Vec<CompiledCallable>,
}

fn is_private(name: &str) -> bool {
    name.split('.').any(|segment| segment.starts_with('_'))
}

fn check_name(name: &str) -> Result<(), SandboxError> {
    if name.is_empty() || is_private(name) {
        return Err(SandboxError::PrivateName(name.to_string()));
    }
    Ok(())
}

/// Read and compile a module file.
pub fn load_file(path: &Path) -> Result<CompiledModule, SandboxError> {
    let path = std::path::absolute(path).map_err(|source| SandboxError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if !path.is_file() {
        return Err(SandboxError::NotFound(path));
    }
    let text = std::fs::read_to_string(&path).map_err(|source| SandboxError::Io {
        path: path.clone(),
        source,
    })?;
    let source: ModuleSource =
        serde_yaml::from_str(&text).map_err(|source| SandboxError::Parse {
            path: path.clone(),
            source,
        })?;
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("module")
        .to_string();
    compile(name, path, source)
}

/// The restricted compiler: reject private names, dangling references and
/// cycles, and fix each entry point's evaluation order.
pub fn compile(
    name: String,
    path: PathBuf,
    source: ModuleSource,
) -> Result<CompiledModule, SandboxError> {
    for import in &source.imports {
        check_name(import)?;
    }

    let mut callables = Vec::with_capacity(source.callables.len());
    for (callable_name, callable) in source.callables {
        callables.push(compile_callable(callable_name, callable)?);
    }

    Ok(CompiledModule {
        name,
        path,
        imports: source.imports,
        config: source.config,
        callables,
    })
}

fn compile_callable(name: String, source: CallableSource) -> Result<CompiledCallable, SandboxError> {
    check_name(&name)?;
    for param in source.params.keys() {
        check_name(param)?;
    }
    for (node_name, node) in &source.nodes {
        check_name(node_name)?;
        check_name(&node.op)?;
        for option in node.options.keys() {
            check_name(option)?;
        }
    }

    let order = dependency_order(&name, &source)?;

    for output in &source.outputs {
        if !source.nodes.contains_key(output) {
            return Err(SandboxError::UnknownOutput {
                callable: name.clone(),
                output: output.clone(),
            });
        }
    }

    Ok(CompiledCallable {
        name,
        params: source.params,
        returns: source.returns,
        nodes: source.nodes,
        order,
        outputs: source.outputs,
    })
}

/// Resolve references and sort the nodes so every node runs after the nodes
/// it reads from.
fn dependency_order(callable: &str, source: &CallableSource) -> Result<Vec<String>, SandboxError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
    for node_name in source.nodes.keys() {
        indices.insert(node_name.as_str(), graph.add_node(node_name.as_str()));
    }

    for (node_name, node) in &source.nodes {
        let mut node_refs = Vec::new();
        let mut param_refs = Vec::new();
        for arg in node.args.values() {
            arg.visit(&mut node_refs, &mut param_refs);
        }
        for param in param_refs {
            if !source.params.contains_key(param) {
                return Err(SandboxError::UnknownParam {
                    callable: callable.to_string(),
                    node: node_name.clone(),
                    param: param.to_string(),
                });
            }
        }
        let target = indices[node_name.as_str()];
        for dependency in node_refs {
            let Some(&dep) = indices.get(dependency) else {
                return Err(SandboxError::UnknownNode {
                    callable: callable.to_string(),
                    node: node_name.clone(),
                    reference: dependency.to_string(),
                });
            };
            graph.add_edge(dep, target, ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| SandboxError::Cycle {
        callable: callable.to_string(),
        node: graph[cycle.node_id()].to_string(),
    })?;
    Ok(sorted.into_iter().map(|idx| graph[idx].to_string()).collect())
}
