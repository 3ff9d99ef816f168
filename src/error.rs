use thiserror::Error;
use uuid::Uuid;

use crate::protocol::ProtocolError;
use crate::sandbox::SandboxError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Task {task_id} failed: {error}")]
    TaskFailed { task_id: Uuid, error: String },

    #[error("Task {0} was cancelled")]
    TaskCancelled(Uuid),

    #[error("Timed out waiting for tasks to finish")]
    WaitTimeout,

    #[error("Scheduler is already started")]
    AlreadyStarted,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Render an error followed by every error in its `source()` chain, one per
/// line. This is the text reported back in a failed `task_result`.
pub fn report(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\n  caused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
