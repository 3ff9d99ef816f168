//! The executor: a long-running worker that connects to the scheduler,
//! runs the tasks it is sent one at a time, and reports their outcome.
//!
//! # Lifecycle
//!
//! 1. Connect to the scheduler and send `executor_register`
//! 2. Wait for `register_response`
//! 3. For each `task`: report RUNNING, load and execute the module, invoke
//!    (or prepare) the callable, report a `task_result`
//! 4. On `kill` or shutdown, return; on connection loss, wait
//!    `reconnect_delay` and start again

mod client;
pub mod heartbeat;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{ExecutorConfig, SandboxConfig};
use crate::error::{report, Result};
use crate::protocol::{TaskMessage, TaskResult};
use crate::sandbox::{runner_for, Registry, SandboxError};
use crate::scheduler::task::TaskId;
use client::SessionEnd;

pub use heartbeat::HeartbeatSender;

pub struct Executor {
    config: ExecutorConfig,
    registry: Arc<Registry>,
    current_task: Mutex<Option<TaskId>>,
}

impl Executor {
    /// An executor with the bundled SDK registry.
    pub fn new(config: ExecutorConfig) -> Self {
        Self::with_registry(config, Arc::new(Registry::with_sdk()))
    }

    pub fn with_registry(config: ExecutorConfig, registry: Arc<Registry>) -> Self {
        Self {
            config,
            registry,
            current_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn executor_id(&self) -> &str {
        &self.config.executor_id
    }

    /// The task being executed right now, if any.
    pub fn current_task(&self) -> Option<TaskId> {
        *self
            .current_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_current_task(&self, task_id: Option<TaskId>) {
        *self
            .current_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = task_id;
    }

    /// Serve the scheduler until it sends `kill` or `shutdown` fires.
    /// Lost or refused connections are retried after `reconnect_delay`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let url = self.config.scheduler_url.as_str();
        loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                connected = client::connect(url) => connected,
            };

            match connected {
                Ok(socket) => {
                    tracing::info!(executor_id = %self.config.executor_id, url, "Connected to scheduler");
                    match client::serve(self, socket, &shutdown).await {
                        Ok(SessionEnd::Killed) => {
                            tracing::info!(executor_id = %self.config.executor_id, "Executor killed by scheduler");
                            return Ok(());
                        }
                        Ok(SessionEnd::Shutdown) => return Ok(()),
                        Ok(SessionEnd::Lost) => {
                            tracing::warn!(url, "Lost connection to scheduler");
                        }
                        Err(e) => {
                            tracing::warn!(url, error = %report(&e), "Connection to scheduler failed");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(url, error = %e, "Could not connect to scheduler");
                }
            }

            tracing::info!(
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "Reconnecting to scheduler"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    /// Execute one task and turn the outcome into a `task_result`. Module
    /// execution is synchronous, so it runs on the blocking pool while the
    /// connection loop waits for it.
    pub async fn execute(&self, task: TaskMessage) -> TaskResult {
        let task_id = task.task_id;
        tracing::info!(
            task_id = %task_id,
            script = %task.script.display(),
            callable = %task.callable,
            prepare = task.is_prepare,
            sandbox = task.use_sandbox,
            "Executing task"
        );

        let registry = Arc::clone(&self.registry);
        let sandbox = self.config.sandbox.clone();
        let outcome =
            tokio::task::spawn_blocking(move || run_module(&task, registry, &sandbox)).await;

        match outcome {
            Ok(Ok(value)) => {
                tracing::info!(task_id = %task_id, "Task completed");
                TaskResult::completed(task_id, value)
            }
            Ok(Err(e)) => {
                let error = report(&e);
                tracing::error!(task_id = %task_id, error = %error, "Task failed");
                TaskResult::failed(task_id, error)
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Task panicked");
                TaskResult::failed(task_id, format!("task panicked: {e}"))
            }
        }
    }
}

fn run_module(
    task: &TaskMessage,
    registry: Arc<Registry>,
    sandbox: &SandboxConfig,
) -> std::result::Result<Value, SandboxError> {
    let mut runner = runner_for(task.use_sandbox, registry, sandbox);
    let bundle = runner.execute_file(&task.script)?;

    if task.is_prepare {
        return bundle.prepare(&task.callable, &task.details);
    }

    let timeout = (task.timeout > 0).then(|| Duration::from_secs(task.timeout));
    let invocation = bundle.invoke(&task.callable, &task.params, &task.details, timeout)?;
    for line in &invocation.printed {
        tracing::info!(task_id = %task.task_id, "{line}");
    }
    Ok(invocation.into_value())
}
