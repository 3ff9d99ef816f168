//! Loading and running workflow modules.
//!
//! A [`ModuleRunner`] turns a module file into a [`ModuleBundle`] in two
//! steps: `load` parses and compiles the file, `execute` resolves it against
//! the function registry and discovers its entry points. [`Sandbox`] enforces
//! an import allow-list on top; [`NoSandbox`] does not.

pub mod builtins;
pub mod interpreter;
pub mod module;
pub mod project;
pub mod registry;
pub mod sdk;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::config::SandboxConfig;

pub use interpreter::{EntryPoint, Invocation, ModuleBundle};
pub use module::{CompiledCallable, CompiledModule};
pub use project::{find_project_root, Project};
pub use registry::{CallContext, FunctionError, Registry};

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("module not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("private name `{0}` is not allowed")]
    PrivateName(String),

    #[error("node `{node}` in `{callable}` references unknown node `{reference}`")]
    UnknownNode {
        callable: String,
        node: String,
        reference: String,
    },

    #[error("node `{node}` in `{callable}` references unknown parameter `{param}`")]
    UnknownParam {
        callable: String,
        node: String,
        param: String,
    },

    #[error("`{callable}` outputs unknown node `{output}`")]
    UnknownOutput { callable: String, output: String },

    #[error("`{callable}` has a dependency cycle through node `{node}`")]
    Cycle { callable: String, node: String },

    #[error("no module loaded")]
    NotLoaded,

    #[error("import denied: module `{0}` is not in the allowed list")]
    ImportDenied(String),

    #[error("no module named `{0}`")]
    ModuleNotFound(String),

    #[error("node `{node}` may not call `{op}`: not a builtin and not under an import")]
    CapabilityDenied { node: String, op: String },

    #[error("node `{node}` calls unknown function `{op}`")]
    UnknownFunction { node: String, op: String },

    #[error("callable not found: {0}")]
    CallableNotFound(String),

    #[error("`{callable}` is missing parameter `{param}`")]
    MissingParam { callable: String, param: String },

    #[error("`{callable}` has no parameter `{param}`")]
    UnexpectedParam { callable: String, param: String },

    #[error("parameter `{param}` must be {expected}")]
    InvalidParam {
        param: String,
        expected: &'static str,
    },

    #[error("unknown constructor `{0}`")]
    UnknownConstructor(String),

    #[error("failed to build parameter `{param}` with `{function}`")]
    Constructor {
        param: String,
        function: String,
        #[source]
        source: FunctionError,
    },

    #[error("details for node `{0}` must be a mapping")]
    InvalidDetails(String),

    #[error("node `{node}` ({op}) failed")]
    Node {
        node: String,
        op: String,
        #[source]
        source: FunctionError,
    },

    #[error("`{callable}` timed out before node `{node}`")]
    Timeout { callable: String, node: String },
}

/// Loads a workflow module and resolves it into a [`ModuleBundle`].
pub trait ModuleRunner: Send {
    /// Parse and compile the module at `path`. Nothing runs.
    fn load(&mut self, path: &Path) -> Result<(), SandboxError>;

    /// Resolve the loaded module. Each call starts from a fresh discovery
    /// context.
    fn execute(&self) -> Result<ModuleBundle, SandboxError>;

    fn execute_file(&mut self, path: &Path) -> Result<ModuleBundle, SandboxError> {
        self.load(path)?;
        self.execute()
    }
}

/// Entry points found while resolving one module.
#[derive(Debug, Default)]
struct Discovery {
    entry_points: Vec<EntryPoint>,
}

impl Discovery {
    fn record(&mut self, callable: &CompiledCallable) {
        self.entry_points.push(EntryPoint::from(callable));
    }
}

enum ImportPolicy<'a> {
    AllowList(&'a [String]),
    Unrestricted,
}

impl ImportPolicy<'_> {
    fn permits(&self, module: &str) -> bool {
        match self {
            ImportPolicy::AllowList(allowed) => allowed.iter().any(|a| {
                module == a
                    || module
                        .strip_prefix(a.as_str())
                        .is_some_and(|rest| rest.starts_with('.'))
            }),
            ImportPolicy::Unrestricted => true,
        }
    }
}

fn under_import(op: &str, imports: &[String]) -> bool {
    imports.iter().any(|import| {
        op.strip_prefix(import.as_str())
            .is_some_and(|rest| rest.starts_with('.'))
    })
}

fn resolve(
    module: &Arc<CompiledModule>,
    registry: &Arc<Registry>,
    policy: ImportPolicy<'_>,
) -> Result<ModuleBundle, SandboxError> {
    let mut discovery = Discovery::default();

    for import in &module.imports {
        if !policy.permits(import) {
            return Err(SandboxError::ImportDenied(import.clone()));
        }
        if !registry.has_module(import) {
            return Err(SandboxError::ModuleNotFound(import.clone()));
        }
    }

    for callable in &module.callables {
        for node_name in &callable.order {
            let op = &callable.nodes[node_name].op;
            if builtins::is_builtin(op) {
                continue;
            }
            if matches!(policy, ImportPolicy::AllowList(_)) && !under_import(op, &module.imports) {
                return Err(SandboxError::CapabilityDenied {
                    node: node_name.clone(),
                    op: op.clone(),
                });
            }
            if registry.function(op).is_none() {
                return Err(SandboxError::UnknownFunction {
                    node: node_name.clone(),
                    op: op.clone(),
                });
            }
        }
        discovery.record(callable);
    }

    Ok(ModuleBundle::new(
        Arc::clone(module),
        Arc::clone(registry),
        discovery.entry_points,
    ))
}

fn log_failure<T>(result: Result<T, SandboxError>, module: &CompiledModule) -> Result<T, SandboxError> {
    if let Err(e) = &result {
        tracing::error!(
            module = %module.path.display(),
            error = %crate::error::report(e),
            "Module execution failed"
        );
    }
    result
}

/// Runs modules under an import allow-list. Only builtins and functions
/// under an allowed import are reachable.
#[derive(Debug)]
pub struct Sandbox {
    registry: Arc<Registry>,
    allowed_modules: Vec<String>,
    module: Option<Arc<CompiledModule>>,
}

impl Sandbox {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_config(registry, &SandboxConfig::default())
    }

    pub fn with_config(registry: Arc<Registry>, config: &SandboxConfig) -> Self {
        Self {
            registry,
            allowed_modules: config.allowed_modules.clone(),
            module: None,
        }
    }

    pub fn allow_module(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.allowed_modules.contains(&name) {
            self.allowed_modules.push(name);
        }
    }

    pub fn allow_modules<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.allow_module(name);
        }
    }

    pub fn allowed_modules(&self) -> &[String] {
        &self.allowed_modules
    }
}

impl ModuleRunner for Sandbox {
    fn load(&mut self, path: &Path) -> Result<(), SandboxError> {
        let module = module::load_file(path)?;
        tracing::debug!(module = %module.path.display(), "Module loaded");
        self.module = Some(Arc::new(module));
        Ok(())
    }

    fn execute(&self) -> Result<ModuleBundle, SandboxError> {
        let module = self.module.as_ref().ok_or(SandboxError::NotLoaded)?;
        let policy = ImportPolicy::AllowList(&self.allowed_modules);
        log_failure(resolve(module, &self.registry, policy), module)
    }
}

/// Runs trusted modules: any registered function is reachable by its full
/// path, imports or not.
#[derive(Debug)]
pub struct NoSandbox {
    registry: Arc<Registry>,
    module: Option<Arc<CompiledModule>>,
}

impl NoSandbox {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            module: None,
        }
    }
}

impl ModuleRunner for NoSandbox {
    fn load(&mut self, path: &Path) -> Result<(), SandboxError> {
        self.module = Some(Arc::new(module::load_file(path)?));
        Ok(())
    }

    fn execute(&self) -> Result<ModuleBundle, SandboxError> {
        let module = self.module.as_ref().ok_or(SandboxError::NotLoaded)?;
        log_failure(
            resolve(module, &self.registry, ImportPolicy::Unrestricted),
            module,
        )
    }
}

/// Pick the runner a task asks for.
pub fn runner_for(
    use_sandbox: bool,
    registry: Arc<Registry>,
    config: &SandboxConfig,
) -> Box<dyn ModuleRunner> {
    if use_sandbox {
        Box::new(Sandbox::with_config(registry, config))
    } else {
        Box::new(NoSandbox::new(registry))
    }
}

/// List a module's entry points and their types.
pub fn describe(path: &Path, registry: Arc<Registry>) -> Result<Vec<EntryPoint>, SandboxError> {
    let mut runner = NoSandbox::new(registry);
    let bundle = runner.execute_file(path)?;
    Ok(bundle.entry_points().to_vec())
}
