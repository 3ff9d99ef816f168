//! Task scheduler: owns the task table, the pending queue and the executor
//! roster, and hands work to executors over their WebSocket connections.
//!
//! All bookkeeping lives in one [`SchedulerState`] behind a `std` mutex that
//! is never held across an `.await`. Callers wait on per-task `watch`
//! channels that are subscribed under the lock and awaited outside it.

pub mod connection;
pub mod queue;
pub mod roster;
pub mod task;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{scheduler_url, SchedulerConfig};
use crate::error::{Error, Result};
use crate::protocol::{Message, RegisterResponse, TaskMessage, TaskResult, UpdateStatus};

pub use queue::TaskQueue;
pub use roster::{ExecutorInfo, Roster};
pub use task::{Details, ParamValue, Params, Task, TaskId, TaskStatus};

/// Default message for a failed result that arrived without an error text.
const UNKNOWN_FAILURE: &str = "task failed without an error message";

/// What [`Scheduler::wait_until_finished`] resolved to.
#[derive(Debug, Clone)]
pub enum Finished {
    Task(Task),
    All(Vec<Task>),
}

/// One attached executor connection.
///
/// A reconnect under the same id replaces the previous session; frames that
/// still arrive on the old one no longer count as proof of life.
#[derive(Debug, Clone)]
pub struct Session {
    executor_id: String,
    generation: u64,
    cancel: CancellationToken,
}

impl Session {
    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    /// Cancelled when the scheduler closes this connection.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug)]
struct ConnectionHandle {
    sender: mpsc::Sender<Message>,
    cancel: CancellationToken,
    generation: u64,
}

#[derive(Debug)]
struct SchedulerState {
    queue: TaskQueue,
    roster: Roster,
    connections: HashMap<String, ConnectionHandle>,
    completions: HashMap<TaskId, watch::Sender<bool>>,
    all_finished: watch::Sender<bool>,
    next_generation: u64,
}

impl SchedulerState {
    fn new(heartbeat_timeout: Duration) -> Self {
        let (all_finished, _) = watch::channel(true);
        Self {
            queue: TaskQueue::new(),
            roster: Roster::new(heartbeat_timeout),
            connections: HashMap::new(),
            completions: HashMap::new(),
            all_finished,
            next_generation: 0,
        }
    }

    fn is_current(&self, session: &Session) -> bool {
        self.connections
            .get(&session.executor_id)
            .is_some_and(|c| c.generation == session.generation)
    }

    /// One dequeue-and-assign attempt. Returns the assigned task, if any.
    ///
    /// An executor whose outbound channel refuses the task is taken out of
    /// the scan before the attempt moves on to the next one.
    fn try_assign(&mut self) -> Option<TaskId> {
        let executor_id = self.roster.first_available()?.to_string();
        let entry = self.queue.pop_pending()?;

        let Some(conn) = self.connections.get(&executor_id) else {
            tracing::warn!(executor_id, "Assignable executor has no connection");
            self.roster.mark_inactive(&executor_id);
            self.queue.requeue(entry);
            return None;
        };

        let task = self.queue.get_task_mut(&entry.task_id)?;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        task.executor_id = Some(executor_id.clone());
        let message = Message::Task(TaskMessage::from(&*task));
        self.roster.task_assigned(&executor_id);

        match conn.sender.try_send(message) {
            Ok(()) => {
                tracing::info!(
                    task_id = %entry.task_id,
                    executor_id,
                    priority = entry.priority,
                    "Task assigned"
                );
                Some(entry.task_id)
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %entry.task_id,
                    executor_id,
                    error = %e,
                    "Failed to hand task to executor, rolling back"
                );
                task.reset_assignment();
                self.roster.task_released(&executor_id);
                self.roster.mark_inactive(&executor_id);
                self.queue.requeue(entry);
                self.try_assign()
            }
        }
    }

    fn signal_finished(&mut self, task_id: &TaskId) {
        if let Some(tx) = self.completions.get(task_id) {
            tx.send_replace(true);
        }
        if self.queue.all_finished() {
            self.all_finished.send_replace(true);
        }
    }

    fn send_to(&self, executor_id: &str, message: Message) {
        if let Some(conn) = self.connections.get(executor_id) {
            if let Err(e) = conn.sender.try_send(message) {
                tracing::warn!(executor_id, error = %e, "Failed to queue outbound message");
            }
        }
    }

    /// Only the owner's RUNNING echo is accepted. Every other transition is
    /// driven by the scheduler itself or by `task_result`.
    fn update_status(&mut self, executor_id: &str, update: UpdateStatus) {
        let Some(task) = self.queue.get_task(&update.task_id) else {
            tracing::warn!(task_id = %update.task_id, "Status update for unknown task");
            return;
        };
        let accepted = update.status == TaskStatus::Running
            && task.status == TaskStatus::Running
            && task.executor_id.as_deref() == Some(executor_id);
        if !accepted {
            tracing::warn!(
                task_id = %update.task_id,
                executor_id,
                owner = ?task.executor_id,
                current = %task.status,
                requested = %update.status,
                "Ignoring status update"
            );
            return;
        }
        tracing::debug!(task_id = %update.task_id, executor_id, "Task running on executor");
        self.try_assign();
    }

    fn complete_task(&mut self, result: TaskResult) {
        let task_id = result.task_id;
        let Some(task) = self.queue.get_task_mut(&task_id) else {
            tracing::warn!(task_id = %task_id, "Result for unknown task ignored");
            return;
        };
        if task.is_finished() {
            tracing::warn!(task_id = %task_id, status = %task.status, "Result for finished task ignored");
            return;
        }

        match result.status {
            TaskStatus::Completed => {
                task.result = Some(result.result.unwrap_or(Value::Null));
                task.error = None;
            }
            TaskStatus::Failed => {
                let error = result
                    .error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| UNKNOWN_FAILURE.to_string());
                task.error = Some(error);
                task.result = None;
            }
            other => {
                tracing::warn!(task_id = %task_id, status = %other, "Result with non-final status ignored");
                return;
            }
        }
        task.status = result.status;
        task.completed_at = Some(Utc::now());
        let owner = task.executor_id.take();

        match task.status {
            TaskStatus::Failed => tracing::warn!(
                task_id = %task_id,
                executor_id = ?owner,
                error = task.error.as_deref().unwrap_or_default(),
                "Task failed"
            ),
            _ => tracing::info!(task_id = %task_id, executor_id = ?owner, "Task completed"),
        }

        if let Some(owner) = owner {
            self.roster.task_released(&owner);
        }
        self.signal_finished(&task_id);
        self.try_assign();
    }
}

#[derive(Debug, Default)]
struct Runtime {
    started: bool,
    local_addr: Option<SocketAddr>,
    handles: Vec<JoinHandle<()>>,
    child: Option<Child>,
}

#[derive(Debug)]
struct Inner {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    runtime: Mutex<Runtime>,
    shutdown: CancellationToken,
}

/// Handle to the scheduler. Cheap to clone; all clones share one state.
#[derive(Debug, Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let state = SchedulerState::new(config.heartbeat_timeout);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                runtime: Mutex::new(Runtime::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.inner
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the listener, start accepting executors and the heartbeat sweep,
    /// and launch the configured child executor.
    pub async fn start(&self) -> Result<SocketAddr> {
        {
            let mut rt = self.runtime();
            if rt.started {
                return Err(Error::AlreadyStarted);
            }
            rt.started = true;
        }

        let listener = match TcpListener::bind(self.inner.config.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.runtime().started = false;
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;

        let child = match &self.inner.config.executor {
            Some(spawn) => match spawn.command(&scheduler_url(local_addr)).spawn() {
                Ok(child) => {
                    tracing::info!(pid = ?child.id(), "Spawned executor process");
                    Some(child)
                }
                Err(e) => {
                    self.runtime().started = false;
                    return Err(e.into());
                }
            },
            None => None,
        };

        let accept = tokio::spawn(connection::accept_loop(
            self.clone(),
            listener,
            self.inner.shutdown.clone(),
        ));
        let sweep = tokio::spawn(self.clone().heartbeat_sweep());

        let mut rt = self.runtime();
        rt.local_addr = Some(local_addr);
        rt.handles.push(accept);
        rt.handles.push(sweep);
        rt.child = child;

        tracing::info!(addr = %local_addr, "Scheduler listening");
        Ok(local_addr)
    }

    /// Send `kill` to every executor, close all connections, stop the
    /// background loops and terminate the child executor. Safe to call more
    /// than once, and before `start`.
    pub async fn stop(&self) {
        let (handles, child) = {
            let mut rt = self.runtime();
            (std::mem::take(&mut rt.handles), rt.child.take())
        };

        let connections: Vec<ConnectionHandle> = {
            let mut state = self.lock();
            for (executor_id, conn) in &state.connections {
                if conn.sender.try_send(Message::Kill).is_err() {
                    tracing::debug!(executor_id, "Could not queue kill message");
                }
            }
            state.roster.clear();
            state.connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &connections {
            conn.cancel.cancel();
        }
        self.inner.shutdown.cancel();

        for handle in handles {
            let _ = handle.await;
        }

        if let Some(mut child) = child {
            match tokio::time::timeout(self.inner.config.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => tracing::info!(%status, "Executor process exited"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for executor process"),
                Err(_) => {
                    tracing::warn!("Executor process did not exit in time, killing it");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "Failed to kill executor process");
                    }
                }
            }
        }

        if !connections.is_empty() {
            tracing::info!(connections = connections.len(), "Closed executor connections");
        }
        tracing::info!("Scheduler stopped");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime().local_addr
    }

    /// Queue a task and make one assignment attempt. Never blocks.
    pub fn add_task(&self, task: Task) -> TaskId {
        let task_id = task.task_id;
        let mut state = self.lock();

        let (tx, _) = watch::channel(false);
        state.completions.insert(task_id, tx);
        state.all_finished.send_replace(false);

        tracing::info!(
            task_id = %task_id,
            script = %task.script.display(),
            callable = %task.callable,
            priority = task.priority,
            prepare = task.is_prepare,
            "Task queued"
        );
        state.queue.add_task(task);
        state.try_assign();
        task_id
    }

    /// Queue a task and wait for its outcome.
    pub async fn run_task(&self, task: Task) -> Result<Value> {
        let task_id = self.add_task(task);
        let task = self.wait_task(task_id, None).await?;
        task_outcome(task)
    }

    /// Build a task from its parts and run it.
    pub async fn submit(
        &self,
        script: impl Into<PathBuf>,
        callable: impl Into<String>,
        params: Params,
        details: Details,
        is_prepare: bool,
    ) -> Result<Value> {
        let mut task = Task::new(script, callable)
            .with_params(params)
            .with_details(details);
        task.is_prepare = is_prepare;
        self.run_task(task).await
    }

    /// Wait for one task, or for every task when `task_id` is `None`.
    ///
    /// A timeout only abandons the wait; the task keeps its current state.
    pub async fn wait_until_finished(
        &self,
        task_id: Option<TaskId>,
        timeout: Option<Duration>,
    ) -> Result<Finished> {
        match task_id {
            Some(id) => self.wait_task(id, timeout).await.map(Finished::Task),
            None => {
                let mut rx = {
                    let state = self.lock();
                    if state.queue.all_finished() {
                        return Ok(Finished::All(cloned(state.queue.all_tasks())));
                    }
                    state.all_finished.subscribe()
                };
                wait_signal(&mut rx, timeout).await?;
                Ok(Finished::All(self.all_tasks()))
            }
        }
    }

    async fn wait_task(&self, task_id: TaskId, timeout: Option<Duration>) -> Result<Task> {
        let mut rx = {
            let state = self.lock();
            state
                .completions
                .get(&task_id)
                .ok_or(Error::TaskNotFound(task_id))?
                .subscribe()
        };
        wait_signal(&mut rx, timeout).await?;
        self.get_task(&task_id).ok_or(Error::TaskNotFound(task_id))
    }

    /// Cancel a task that has not been assigned yet. Returns `false` when the
    /// task is already running or finished.
    pub fn cancel_task(&self, task_id: &TaskId) -> Result<bool> {
        let mut state = self.lock();
        let task = state
            .queue
            .get_task_mut(task_id)
            .ok_or(Error::TaskNotFound(*task_id))?;
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        tracing::info!(task_id = %task_id, "Task cancelled");
        state.signal_finished(task_id);
        Ok(true)
    }

    pub fn get_task(&self, task_id: &TaskId) -> Option<Task> {
        self.lock().queue.get_task(task_id).cloned()
    }

    /// All tasks, oldest first.
    pub fn all_tasks(&self) -> Vec<Task> {
        cloned(self.lock().queue.all_tasks())
    }

    pub fn all_executors(&self) -> Vec<ExecutorInfo> {
        self.lock()
            .roster
            .all_executors()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn executor(&self, executor_id: &str) -> Option<ExecutorInfo> {
        self.lock().roster.get(executor_id).cloned()
    }

    /// Attach a new executor connection. Any existing connection with the same
    /// id is closed first and the roster entry starts over, unregistered.
    pub fn connect_executor(
        &self,
        executor_id: impl Into<String>,
        sender: mpsc::Sender<Message>,
    ) -> Session {
        let executor_id = executor_id.into();
        let cancel = self.inner.shutdown.child_token();

        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        let handle = ConnectionHandle {
            sender,
            cancel: cancel.clone(),
            generation,
        };
        if let Some(old) = state.connections.insert(executor_id.clone(), handle) {
            tracing::info!(executor_id, "Closing previous connection for executor");
            old.cancel.cancel();
        }
        state.roster.connect(&executor_id);
        tracing::info!(executor_id, "Executor connected");

        Session {
            executor_id,
            generation,
            cancel,
        }
    }

    /// Dispatch one decoded inbound message.
    pub fn handle_message(&self, session: &Session, message: Message) {
        let mut state = self.lock();
        let current = state.is_current(session);
        let executor_id = session.executor_id.as_str();
        if current {
            state.roster.heartbeat(executor_id, true);
        }

        match message {
            Message::ExecutorRegister(reg) => {
                if !current {
                    tracing::warn!(executor_id, "Registration on a replaced connection ignored");
                    return;
                }
                state.roster.register(executor_id, &reg);
                state.send_to(
                    executor_id,
                    Message::RegisterResponse(RegisterResponse::success()),
                );
                state.try_assign();
            }
            Message::UpdateStatus(update) => state.update_status(executor_id, update),
            Message::TaskResult(result) => state.complete_task(result),
            other => {
                tracing::warn!(executor_id, kind = other.kind(), "Unexpected message from executor");
            }
        }
    }

    /// Record a payload-free frame (ping/pong) as proof of life.
    pub fn heartbeat(&self, session: &Session) {
        let mut state = self.lock();
        if state.is_current(session) {
            state.roster.heartbeat(&session.executor_id, true);
        }
    }

    /// Detach a connection. The roster entry goes inactive; tasks it owns stay
    /// RUNNING.
    pub fn disconnect_executor(&self, session: &Session) {
        session.cancel.cancel();
        let mut state = self.lock();
        if !state.is_current(session) {
            return;
        }
        state.connections.remove(&session.executor_id);
        state.roster.mark_inactive(&session.executor_id);

        let orphaned = state
            .queue
            .all_tasks()
            .iter()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && t.executor_id.as_deref() == Some(session.executor_id.as_str())
            })
            .count();
        if orphaned > 0 {
            tracing::warn!(
                executor_id = %session.executor_id,
                orphaned,
                "Executor disconnected with running tasks"
            );
        } else {
            tracing::info!(executor_id = %session.executor_id, "Executor disconnected");
        }
    }

    /// Mark executors inactive once their heartbeat expires.
    pub fn sweep_heartbeats(&self) -> Vec<String> {
        let expired = self.lock().roster.sweep();
        for executor_id in &expired {
            tracing::warn!(executor_id, "Executor heartbeat timed out");
        }
        expired
    }

    async fn heartbeat_sweep(self) {
        let mut interval = tokio::time::interval(self.inner.config.heartbeat_sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep_heartbeats();
                }
            }
        }
    }
}

fn cloned(tasks: Vec<&Task>) -> Vec<Task> {
    tasks.into_iter().cloned().collect()
}

fn task_outcome(task: Task) -> Result<Value> {
    match task.status {
        TaskStatus::Completed => Ok(task.result.unwrap_or(Value::Null)),
        TaskStatus::Failed => Err(Error::TaskFailed {
            task_id: task.task_id,
            error: task.error.unwrap_or_else(|| UNKNOWN_FAILURE.to_string()),
        }),
        TaskStatus::Cancelled => Err(Error::TaskCancelled(task.task_id)),
        status => Err(Error::Internal(format!(
            "task {} signalled finished while {}",
            task.task_id, status
        ))),
    }
}

async fn wait_signal(rx: &mut watch::Receiver<bool>, timeout: Option<Duration>) -> Result<()> {
    let wait = rx.wait_for(|done| *done);
    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| Error::WaitTimeout)?,
        None => wait.await,
    };
    outcome
        .map(|_| ())
        .map_err(|_| Error::Internal("completion signal closed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ExecutorRegister;

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulerConfig::default())
    }

    fn register(scheduler: &Scheduler, id: &str, capacity: usize) -> (Session, mpsc::Receiver<Message>) {
        let (tx, mut rx) = mpsc::channel(capacity.max(8));
        let session = scheduler.connect_executor(id, tx);
        scheduler.handle_message(
            &session,
            Message::ExecutorRegister(ExecutorRegister {
                executor_id: format!("label-{id}"),
                host: "localhost".to_string(),
                port: 0,
                max_tasks: 1,
                capabilities: vec![],
            }),
        );
        assert!(matches!(rx.try_recv(), Ok(Message::RegisterResponse(r)) if r.is_success()));
        (session, rx)
    }

    fn assigned(rx: &mut mpsc::Receiver<Message>) -> TaskMessage {
        match rx.try_recv() {
            Ok(Message::Task(task)) => task,
            other => panic!("expected task message, got {:?}", other),
        }
    }

    #[test]
    fn task_stays_pending_without_executors() {
        let s = scheduler();
        let id = s.add_task(Task::new("a.yaml", "main"));
        assert_eq!(s.get_task(&id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn unregistered_connection_gets_no_work() {
        let s = scheduler();
        let (tx, mut rx) = mpsc::channel(8);
        let _session = s.connect_executor("127.0.0.1:4000", tx);
        let id = s.add_task(Task::new("a.yaml", "main"));

        assert_eq!(s.get_task(&id).unwrap().status, TaskStatus::Pending);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn registration_triggers_assignment() {
        let s = scheduler();
        let id = s.add_task(Task::new("a.yaml", "main"));
        let (_session, mut rx) = register(&s, "127.0.0.1:4000", 1);

        assert_eq!(assigned(&mut rx).task_id, id);
        let task = s.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.executor_id.as_deref(), Some("127.0.0.1:4000"));
        assert!(task.started_at.is_some());
        assert_eq!(s.executor("127.0.0.1:4000").unwrap().current_tasks, 1);
    }

    #[test]
    fn result_completes_and_frees_capacity() {
        let s = scheduler();
        let (session, mut rx) = register(&s, "e:1", 1);
        let first = s.add_task(Task::new("a.yaml", "main"));
        let second = s.add_task(Task::new("a.yaml", "main"));
        assert_eq!(assigned(&mut rx).task_id, first);
        assert!(rx.try_recv().is_err());

        s.handle_message(
            &session,
            Message::TaskResult(TaskResult::completed(first, serde_json::json!([1]))),
        );
        let done = s.get_task(&first).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(serde_json::json!([1])));
        assert!(done.executor_id.is_none());
        assert!(done.completed_at.is_some());

        assert_eq!(assigned(&mut rx).task_id, second);
        assert_eq!(s.executor("e:1").unwrap().current_tasks, 1);
    }

    #[test]
    fn failed_result_without_error_gets_message() {
        let s = scheduler();
        let (session, mut rx) = register(&s, "e:1", 1);
        let id = s.add_task(Task::new("a.yaml", "main"));
        assigned(&mut rx);

        let mut result = TaskResult::failed(id, "");
        result.error = None;
        s.handle_message(&session, Message::TaskResult(result));

        let task = s.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(!task.error.unwrap().is_empty());
        assert!(task.result.is_none());
    }

    #[test]
    fn completed_without_result_stores_null() {
        let s = scheduler();
        let (session, mut rx) = register(&s, "e:1", 1);
        let id = s.add_task(Task::new("a.yaml", "main"));
        assigned(&mut rx);

        let mut result = TaskResult::completed(id, Value::Null);
        result.result = None;
        s.handle_message(&session, Message::TaskResult(result));
        assert_eq!(s.get_task(&id).unwrap().result, Some(Value::Null));
    }

    #[test]
    fn closed_channel_rolls_assignment_back() {
        let s = scheduler();
        let (session, rx) = register(&s, "e:1", 1);
        drop(rx);

        let id = s.add_task(Task::new("a.yaml", "main"));
        let task = s.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());
        assert!(task.executor_id.is_none());
        assert_eq!(s.executor("e:1").unwrap().current_tasks, 0);

        // Task is still queued: a fresh connection picks it up.
        s.disconnect_executor(&session);
        let (_session, mut rx) = register(&s, "e:2", 1);
        assert_eq!(assigned(&mut rx).task_id, id);
    }

    #[test]
    fn closed_channel_moves_task_to_next_executor() {
        let s = scheduler();
        let (_dead, rx_dead) = register(&s, "a:1", 1);
        let (_live, mut rx_live) = register(&s, "b:2", 1);
        drop(rx_dead);

        let id = s.add_task(Task::new("a.yaml", "main"));
        assert_eq!(assigned(&mut rx_live).task_id, id);

        let task = s.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.executor_id.as_deref(), Some("b:2"));

        let dead = s.executor("a:1").unwrap();
        assert!(!dead.is_active);
        assert_eq!(dead.current_tasks, 0);
    }

    #[test]
    fn full_channel_skips_busy_connection() {
        let s = scheduler();
        let (tx, mut rx_full) = mpsc::channel(1);
        let session = s.connect_executor("a:1", tx);
        s.handle_message(
            &session,
            Message::ExecutorRegister(ExecutorRegister {
                executor_id: "label-a".to_string(),
                host: "localhost".to_string(),
                port: 0,
                max_tasks: 1,
                capabilities: vec![],
            }),
        );
        // The unread register response fills the only slot.
        let (_live, mut rx_live) = register(&s, "b:2", 1);

        let id = s.add_task(Task::new("a.yaml", "main"));
        assert_eq!(assigned(&mut rx_live).task_id, id);
        assert!(matches!(rx_full.try_recv(), Ok(Message::RegisterResponse(_))));
        assert!(rx_full.try_recv().is_err());
        assert!(!s.executor("a:1").unwrap().is_active);
    }

    #[test]
    fn pending_status_from_owner_is_ignored() {
        let s = scheduler();
        let (session, mut rx) = register(&s, "a:1", 1);
        let id = s.add_task(Task::new("a.yaml", "main"));
        assigned(&mut rx);

        s.handle_message(
            &session,
            Message::UpdateStatus(UpdateStatus {
                task_id: id,
                status: TaskStatus::Pending,
            }),
        );
        let task = s.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.executor_id.as_deref(), Some("a:1"));
        assert_eq!(s.executor("a:1").unwrap().current_tasks, 1);

        s.handle_message(&session, Message::TaskResult(TaskResult::completed(id, Value::Null)));
        assert_eq!(s.get_task(&id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn running_status_from_other_executor_is_ignored() {
        let s = scheduler();
        let pending = s.add_task(Task::new("a.yaml", "main"));
        let (other, _rx_other) = register(&s, "b:2", 1);
        let (_free, mut rx_free) = register(&s, "c:3", 1);
        let queued = s.add_task(Task::new("a.yaml", "main"));
        assert_eq!(assigned(&mut rx_free).task_id, queued);
        assert_eq!(s.get_task(&pending).unwrap().executor_id.as_deref(), Some("b:2"));

        s.handle_message(
            &other,
            Message::UpdateStatus(UpdateStatus {
                task_id: queued,
                status: TaskStatus::Running,
            }),
        );
        let task = s.get_task(&queued).unwrap();
        assert_eq!(task.executor_id.as_deref(), Some("c:3"));
        assert_eq!(s.executor("b:2").unwrap().current_tasks, 1);
    }

    #[test]
    fn terminal_status_via_update_is_ignored() {
        let s = scheduler();
        let (session, mut rx) = register(&s, "e:1", 1);
        let id = s.add_task(Task::new("a.yaml", "main"));
        assigned(&mut rx);

        s.handle_message(
            &session,
            Message::UpdateStatus(UpdateStatus {
                task_id: id,
                status: TaskStatus::Completed,
            }),
        );
        assert_eq!(s.get_task(&id).unwrap().status, TaskStatus::Running);
    }

    #[test]
    fn result_for_unknown_or_finished_task_is_ignored() {
        let s = scheduler();
        let (session, mut rx) = register(&s, "e:1", 1);
        s.handle_message(
            &session,
            Message::TaskResult(TaskResult::completed(uuid::Uuid::new_v4(), Value::Null)),
        );

        let id = s.add_task(Task::new("a.yaml", "main"));
        assigned(&mut rx);
        s.handle_message(&session, Message::TaskResult(TaskResult::failed(id, "first")));
        s.handle_message(
            &session,
            Message::TaskResult(TaskResult::completed(id, serde_json::json!("late"))),
        );

        let task = s.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("first"));
        assert_eq!(s.executor("e:1").unwrap().current_tasks, 0);
    }

    #[test]
    fn cancel_only_affects_pending() {
        let s = scheduler();
        let pending = s.add_task(Task::new("a.yaml", "main"));
        assert!(s.cancel_task(&pending).unwrap());
        assert_eq!(s.get_task(&pending).unwrap().status, TaskStatus::Cancelled);

        let (_session, mut rx) = register(&s, "e:1", 1);
        // The cancelled task is skipped.
        assert!(rx.try_recv().is_err());

        let running = s.add_task(Task::new("a.yaml", "main"));
        assigned(&mut rx);
        assert!(!s.cancel_task(&running).unwrap());
        assert_eq!(s.get_task(&running).unwrap().status, TaskStatus::Running);

        assert!(matches!(
            s.cancel_task(&uuid::Uuid::new_v4()),
            Err(Error::TaskNotFound(_))
        ));
    }

    #[test]
    fn reconnect_replaces_session() {
        let s = scheduler();
        let (old, _rx_old) = register(&s, "e:1", 1);
        let (new, _rx_new) = register(&s, "e:1", 1);

        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert_eq!(s.all_executors().len(), 1);

        // The stale session going away does not touch the new entry.
        s.disconnect_executor(&old);
        assert!(s.executor("e:1").unwrap().is_active);

        s.disconnect_executor(&new);
        assert!(!s.executor("e:1").unwrap().is_active);
    }

    #[test]
    fn disconnect_leaves_task_running() {
        let s = scheduler();
        let (session, mut rx) = register(&s, "e:1", 1);
        let id = s.add_task(Task::new("a.yaml", "main"));
        assigned(&mut rx);

        s.disconnect_executor(&session);
        let task = s.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.executor_id.as_deref(), Some("e:1"));
    }

    #[tokio::test]
    async fn wait_for_all_with_no_tasks_returns_immediately() {
        let s = scheduler();
        match s.wait_until_finished(None, Some(Duration::from_millis(10))).await {
            Ok(Finished::All(tasks)) => assert!(tasks.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn wait_times_out_and_leaves_task_alone() {
        let s = scheduler();
        let id = s.add_task(Task::new("a.yaml", "main"));
        let err = s
            .wait_until_finished(Some(id), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WaitTimeout));
        assert_eq!(s.get_task(&id).unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn wait_for_unknown_task_fails() {
        let s = scheduler();
        let err = s
            .wait_until_finished(Some(uuid::Uuid::new_v4()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn run_task_surfaces_failure() {
        let s = scheduler();
        let (session, mut rx) = register(&s, "e:1", 1);

        let runner = {
            let s = s.clone();
            tokio::spawn(async move { s.run_task(Task::new("a.yaml", "main")).await })
        };
        let task = loop {
            if let Ok(Message::Task(task)) = rx.try_recv() {
                break task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        s.handle_message(&session, Message::TaskResult(TaskResult::failed(task.task_id, "boom")));

        match runner.await.unwrap() {
            Err(Error::TaskFailed { task_id, error }) => {
                assert_eq!(task_id, task.task_id);
                assert_eq!(error, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancelled_task_resolves_waiters() {
        let s = scheduler();
        let id = s.add_task(Task::new("a.yaml", "main"));
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.wait_until_finished(None, Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        s.cancel_task(&id).unwrap();

        match waiter.await.unwrap() {
            Ok(Finished::All(tasks)) => assert_eq!(tasks[0].status, TaskStatus::Cancelled),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn stop_twice_without_start() {
        let s = scheduler();
        let _ = register(&s, "e:1", 1);
        s.stop().await;
        assert!(s.all_executors().is_empty());
        s.stop().await;
        assert!(s.all_executors().is_empty());
    }
}
