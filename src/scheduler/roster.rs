use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::protocol::ExecutorRegister;

/// Roster entry for one executor connection.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorInfo {
    /// Remote endpoint of the connection, `host:port`.
    pub executor_id: String,
    /// The id the executor reported about itself at registration.
    pub label: Option<String>,
    pub host: String,
    pub port: u16,
    pub capabilities: Vec<String>,
    pub registered: bool,
    pub max_tasks: usize,
    pub current_tasks: usize,
    pub is_active: bool,
    pub connected_at: DateTime<Utc>,
    #[serde(skip)]
    pub last_heartbeat: Instant,
}

impl ExecutorInfo {
    pub fn new(executor_id: impl Into<String>) -> Self {
        Self {
            executor_id: executor_id.into(),
            label: None,
            host: String::new(),
            port: 0,
            capabilities: Vec::new(),
            registered: false,
            max_tasks: 1,
            current_tasks: 0,
            is_active: true,
            connected_at: Utc::now(),
            last_heartbeat: Instant::now(),
        }
    }

    pub fn update_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.last_heartbeat.elapsed() < timeout
    }

    pub fn is_assignable(&self) -> bool {
        self.is_active && self.registered && self.current_tasks < self.max_tasks
    }
}

/// Executor roster in connection order.
#[derive(Debug)]
pub struct Roster {
    executors: IndexMap<String, ExecutorInfo>,
    heartbeat_timeout: Duration,
}

impl Roster {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            executors: IndexMap::new(),
            heartbeat_timeout,
        }
    }

    /// Create a fresh entry for a new connection, replacing any entry with the
    /// same id. The entry becomes assignable once the executor registers.
    pub fn connect(&mut self, executor_id: &str) {
        // Remove first so a reconnect moves to the end of the scan order.
        self.executors.shift_remove(executor_id);
        self.executors
            .insert(executor_id.to_string(), ExecutorInfo::new(executor_id));
    }

    pub fn register(&mut self, executor_id: &str, reg: &ExecutorRegister) {
        let entry = self
            .executors
            .entry(executor_id.to_string())
            .or_insert_with(|| ExecutorInfo::new(executor_id));
        entry.label = Some(reg.executor_id.clone());
        entry.host = reg.host.clone();
        entry.port = reg.port;
        entry.capabilities = reg.capabilities.clone();
        entry.max_tasks = reg.max_tasks.max(1);
        entry.registered = true;
        entry.is_active = true;
        entry.update_heartbeat();
        tracing::info!(
            executor_id,
            label = %reg.executor_id,
            max_tasks = entry.max_tasks,
            "Executor registered"
        );
    }

    /// Record proof of life. `attached` says whether the connection is still
    /// live; only then is an inactive entry brought back.
    pub fn heartbeat(&mut self, executor_id: &str, attached: bool) {
        if let Some(entry) = self.executors.get_mut(executor_id) {
            entry.update_heartbeat();
            if attached && !entry.is_active {
                tracing::info!(executor_id, "Executor reactivated");
                entry.is_active = true;
            }
        }
    }

    pub fn mark_inactive(&mut self, executor_id: &str) {
        if let Some(entry) = self.executors.get_mut(executor_id) {
            entry.is_active = false;
        }
    }

    /// First assignable executor in roster order.
    pub fn first_available(&self) -> Option<&str> {
        self.executors
            .values()
            .find(|e| e.is_assignable())
            .map(|e| e.executor_id.as_str())
    }

    pub fn task_assigned(&mut self, executor_id: &str) {
        if let Some(entry) = self.executors.get_mut(executor_id) {
            entry.current_tasks += 1;
        }
    }

    pub fn task_released(&mut self, executor_id: &str) {
        if let Some(entry) = self.executors.get_mut(executor_id) {
            entry.current_tasks = entry.current_tasks.saturating_sub(1);
        }
    }

    /// Mark entries whose heartbeat expired as inactive and return their ids.
    pub fn sweep(&mut self) -> Vec<String> {
        let timeout = self.heartbeat_timeout;
        let mut expired = Vec::new();
        for entry in self.executors.values_mut() {
            if entry.is_active && !entry.is_alive(timeout) {
                entry.is_active = false;
                expired.push(entry.executor_id.clone());
            }
        }
        expired
    }

    pub fn get(&self, executor_id: &str) -> Option<&ExecutorInfo> {
        self.executors.get(executor_id)
    }

    pub fn all_executors(&self) -> Vec<&ExecutorInfo> {
        self.executors.values().collect()
    }

    pub fn clear(&mut self) {
        self.executors.clear();
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
