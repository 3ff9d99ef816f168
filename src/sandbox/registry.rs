//! Closed registry of node operations and parameter constructors.
//!
//! Workflows can only reach functionality that was registered here at
//! startup; there is no way for a module to name arbitrary host code.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use thiserror::Error;

/// Evaluated node arguments, by name.
pub type Args = IndexMap<String, Value>;

pub type FunctionResult = Result<Value, FunctionError>;

pub type NodeFn = Arc<dyn Fn(&CallContext<'_>, &Args) -> FunctionResult + Send + Sync>;

pub type ConstructorFn = Arc<dyn Fn(&Map<String, Value>) -> FunctionResult + Send + Sync>;

#[derive(Error, Debug)]
pub enum FunctionError {
    #[error("missing argument `{0}`")]
    MissingArg(String),

    #[error("argument `{name}` must be {expected}")]
    InvalidArg { name: String, expected: &'static str },

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What a node function sees of the running workflow.
pub struct CallContext<'a> {
    /// Set during a prepare pass. Functions return placeholders instead of
    /// doing work.
    pub prepare: bool,
    pub node: &'a str,
    /// Declared defaults overridden by the caller's details for this node.
    pub options: &'a Map<String, Value>,
    printed: &'a RefCell<Vec<String>>,
}

impl<'a> CallContext<'a> {
    pub fn new(
        prepare: bool,
        node: &'a str,
        options: &'a Map<String, Value>,
        printed: &'a RefCell<Vec<String>>,
    ) -> Self {
        Self {
            prepare,
            node,
            options,
            printed,
        }
    }

    pub fn option(&self, name: &str) -> Option<&Value> {
        self.options.get(name)
    }

    pub fn print(&self, line: impl Into<String>) {
        self.printed.borrow_mut().push(line.into());
    }
}

/// Look up a required argument.
pub fn arg<'a>(args: &'a Args, name: &str) -> Result<&'a Value, FunctionError> {
    args.get(name)
        .ok_or_else(|| FunctionError::MissingArg(name.to_string()))
}

pub fn arg_f64(args: &Args, name: &str) -> Result<f64, FunctionError> {
    arg(args, name)?.as_f64().ok_or(FunctionError::InvalidArg {
        name: name.to_string(),
        expected: "a number",
    })
}

pub fn arg_u64(args: &Args, name: &str) -> Result<u64, FunctionError> {
    arg(args, name)?.as_u64().ok_or(FunctionError::InvalidArg {
        name: name.to_string(),
        expected: "a non-negative integer",
    })
}

pub fn arg_str<'a>(args: &'a Args, name: &str) -> Result<&'a str, FunctionError> {
    arg(args, name)?.as_str().ok_or(FunctionError::InvalidArg {
        name: name.to_string(),
        expected: "a string",
    })
}

pub fn arg_array<'a>(args: &'a Args, name: &str) -> Result<&'a Vec<Value>, FunctionError> {
    arg(args, name)?.as_array().ok_or(FunctionError::InvalidArg {
        name: name.to_string(),
        expected: "a list",
    })
}

#[derive(Default, Clone)]
pub struct Registry {
    functions: HashMap<String, NodeFn>,
    constructors: HashMap<String, ConstructorFn>,
    modules: BTreeSet<String>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut functions: Vec<_> = self.functions.keys().collect();
        functions.sort();
        let mut constructors: Vec<_> = self.constructors.keys().collect();
        constructors.sort();
        f.debug_struct("Registry")
            .field("functions", &functions)
            .field("constructors", &constructors)
            .finish()
    }
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the bundled SDK and host functions.
    pub fn with_sdk() -> Self {
        let mut registry = Self::new();
        super::sdk::install(&mut registry);
        registry
    }

    pub fn register_function<F>(&mut self, path: &str, f: F)
    where
        F: Fn(&CallContext<'_>, &Args) -> FunctionResult + Send + Sync + 'static,
    {
        self.add_modules(path);
        self.functions.insert(path.to_string(), Arc::new(f));
    }

    pub fn register_constructor<F>(&mut self, path: &str, f: F)
    where
        F: Fn(&Map<String, Value>) -> FunctionResult + Send + Sync + 'static,
    {
        self.add_modules(path);
        self.constructors.insert(path.to_string(), Arc::new(f));
    }

    /// Every dotted prefix of a registered path is a module.
    fn add_modules(&mut self, path: &str) {
        let mut prefix = String::new();
        let segments: Vec<&str> = path.split('.').collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(segment);
            self.modules.insert(prefix.clone());
        }
    }

    pub fn function(&self, path: &str) -> Option<&NodeFn> {
        self.functions.get(path)
    }

    pub fn constructor(&self, path: &str) -> Option<&ConstructorFn> {
        self.constructors.get(path)
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.modules.contains(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(String::as_str)
    }
}
