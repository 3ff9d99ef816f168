use std::path::PathBuf;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type TaskId = Uuid;

/// Named arguments for the entry point, in declaration order.
pub type Params = IndexMap<String, ParamValue>;

/// Per-node option overrides keyed by node name.
pub type Details = Map<String, Value>;

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A parameter for an entry point.
///
/// Either a plain JSON literal or a reference to a registered constructor,
/// written on the wire as `{"function": "sdk.Prompt.create", "params": {...}}`.
/// Constructor references are resolved by the executor through its
/// constructor registry, never by importing arbitrary paths.
///
/// That exact shape is reserved: an object whose keys are `function` (a
/// string) and optionally `params` (an object) always reads as a
/// constructor. Any other object, including one with a `function` key next
/// to other keys, stays a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, deny_unknown_fields)]
pub enum ParamValue {
    Constructor {
        function: String,
        #[serde(default)]
        params: Map<String, Value>,
    },
    Literal(Value),
}

impl ParamValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        ParamValue::Literal(value.into())
    }

    pub fn constructor(function: impl Into<String>, params: Map<String, Value>) -> Self {
        ParamValue::Constructor {
            function: function.into(),
            params,
        }
    }
}

/// One request to run a named entry point of a workflow module, plus the
/// lifecycle state the scheduler tracks for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub script: PathBuf,
    pub callable: String,
    pub params: Params,
    pub details: Details,
    pub is_prepare: bool,

    pub priority: i64,
    pub timeout: u64,
    pub use_sandbox: bool,

    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub executor_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(script: impl Into<PathBuf>, callable: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            script: script.into(),
            callable: callable.into(),
            params: Params::new(),
            details: Details::new(),
            is_prepare: false,
            priority: 0,
            timeout: DEFAULT_TIMEOUT_SECS,
            use_sandbox: true,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            executor_id: None,
            result: None,
            error: None,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_details(mut self, details: Details) -> Self {
        self.details = details;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = timeout_secs;
        self
    }

    /// Turn this into a prepare pass: discover the entry point's parameter
    /// and option schema instead of running it.
    pub fn prepare(mut self) -> Self {
        self.is_prepare = true;
        self
    }

    pub fn without_sandbox(mut self) -> Self {
        self.use_sandbox = false;
        self
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Put a task back into the state it had before an assignment attempt.
    pub(crate) fn reset_assignment(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.executor_id = None;
    }
}
