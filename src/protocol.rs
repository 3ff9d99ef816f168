//! Wire protocol between the scheduler and its executors.
//!
//! Every message is a JSON object carried in a WebSocket text frame and
//! discriminated by its `type` field:
//!
//! | type                | direction            |
//! |---------------------|----------------------|
//! | `executor_register` | executor → scheduler |
//! | `register_response` | scheduler → executor |
//! | `task`              | scheduler → executor |
//! | `update_status`     | executor → scheduler |
//! | `task_result`       | executor → scheduler |
//! | `kill`              | scheduler → executor |

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message as Frame;

use crate::scheduler::task::{
    Details, Params, Task, TaskId, TaskStatus, DEFAULT_TIMEOUT_SECS,
};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("binary frame is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    ExecutorRegister(ExecutorRegister),
    RegisterResponse(RegisterResponse),
    Task(TaskMessage),
    UpdateStatus(UpdateStatus),
    TaskResult(TaskResult),
    Kill,
}

fn default_max_tasks() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorRegister {
    pub executor_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: String,
    pub message: String,
}

impl RegisterResponse {
    pub fn success() -> Self {
        Self {
            status: "success".to_string(),
            message: "registered".to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Wire form of a [`Task`]: the work descriptor and scheduling metadata,
/// without the scheduler-side lifecycle fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: TaskId,
    pub script: PathBuf,
    pub callable: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub details: Details,
    #[serde(default)]
    pub is_prepare: bool,
    #[serde(default = "default_true")]
    pub use_sandbox: bool,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub priority: i64,
}

impl From<&Task> for TaskMessage {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id,
            script: task.script.clone(),
            callable: task.callable.clone(),
            params: task.params.clone(),
            details: task.details.clone(),
            is_prepare: task.is_prepare,
            use_sandbox: task.use_sandbox,
            timeout: task.timeout,
            priority: task.priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn completed(task_id: TaskId, result: Value) -> Self {
        Self {
            task_id,
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(task_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }
}

impl Message {
    /// The `type` discriminator of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ExecutorRegister(_) => "executor_register",
            Message::RegisterResponse(_) => "register_response",
            Message::Task(_) => "task",
            Message::UpdateStatus(_) => "update_status",
            Message::TaskResult(_) => "task_result",
            Message::Kill => "kill",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(Frame::Text(self.to_json()?))
    }
}

/// What a single WebSocket frame means to the protocol layer.
#[derive(Debug)]
pub enum Inbound {
    Message(Message),
    /// Ping/pong or raw frames: proof of life without a payload.
    Heartbeat,
    Closed,
}

pub fn decode_frame(frame: Frame) -> Result<Inbound, ProtocolError> {
    match frame {
        Frame::Text(text) => Ok(Inbound::Message(Message::from_json(&text)?)),
        Frame::Binary(bytes) => {
            let text = std::str::from_utf8(&bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
            Ok(Inbound::Message(Message::from_json(text)?))
        }
        Frame::Ping(_) | Frame::Pong(_) | Frame::Frame(_) => Ok(Inbound::Heartbeat),
        Frame::Close(_) => Ok(Inbound::Closed),
    }
}
