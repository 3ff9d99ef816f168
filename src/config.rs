use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Modules a sandboxed workflow may import unless configured otherwise.
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &["sdk"];

/// Capability limits for sandboxed workflow modules.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Registry modules a workflow may import. Submodules of an allowed
    /// module are allowed too.
    pub allowed_modules: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_modules: DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

impl SandboxConfig {
    pub fn allow_module(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.allowed_modules.contains(&name) {
            self.allowed_modules.push(name);
        }
        self
    }
}

/// How the scheduler launches its own executor process.
#[derive(Debug, Clone)]
pub struct ExecutorSpawn {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ExecutorSpawn {
    /// Re-run the current binary as `<exe> executor`.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec!["executor".to_string()],
        })
    }

    /// Forward an extra allowed module to the child's sandbox.
    pub fn allow_module(mut self, name: impl Into<String>) -> Self {
        self.args.push("--allow-module".to_string());
        self.args.push(name.into());
        self
    }

    /// Build the child command. The scheduler URL is appended once the
    /// listening address is known.
    pub fn command(&self, scheduler_url: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--scheduler")
            .arg(scheduler_url)
            .kill_on_drop(true);
        cmd
    }
}

pub fn scheduler_url(addr: SocketAddr) -> String {
    format!("ws://{}/", addr)
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub listen_addr: SocketAddr,
    /// An executor whose last inbound frame is older than this is inactive.
    pub heartbeat_timeout: Duration,
    pub heartbeat_sweep_interval: Duration,
    /// Capacity of each connection's outbound channel.
    pub outbound_capacity: usize,
    /// Child executor to launch on start. `None` by default, so an embedded
    /// scheduler only serves executors that connect on their own;
    /// [`SchedulerConfig::standalone`] fills it in.
    pub executor: Option<ExecutorSpawn>,
    /// How long `stop` waits for the child executor to exit after `kill`.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            heartbeat_timeout: Duration::from_secs(60),
            heartbeat_sweep_interval: Duration::from_secs(10),
            outbound_capacity: 64,
            executor: None,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl SchedulerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// A scheduler that launches the current binary as its own executor.
    pub fn standalone(listen_addr: SocketAddr) -> std::io::Result<Self> {
        Ok(Self::new(listen_addr).with_executor(ExecutorSpawn::current_exe()?))
    }

    pub fn with_executor(mut self, spawn: ExecutorSpawn) -> Self {
        self.executor = Some(spawn);
        self
    }

    pub fn with_heartbeat(mut self, timeout: Duration, sweep_interval: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self.heartbeat_sweep_interval = sweep_interval;
        self
    }

    /// The URL an executor uses to reach this scheduler.
    pub fn url(&self) -> String {
        scheduler_url(self.listen_addr)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub scheduler_url: String,
    /// Reported to the scheduler at registration.
    pub executor_id: String,
    pub host: String,
    pub port: u16,
    pub max_tasks: usize,
    pub capabilities: Vec<String>,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Interval between WebSocket pings while idle.
    pub heartbeat_interval: Duration,
    pub sandbox: SandboxConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            scheduler_url: "ws://localhost:5000/".to_string(),
            executor_id: uuid::Uuid::new_v4().to_string(),
            host: "localhost".to_string(),
            port: 0,
            max_tasks: 1,
            capabilities: Vec::new(),
            reconnect_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn new(scheduler_url: impl Into<String>) -> Self {
        Self {
            scheduler_url: scheduler_url.into(),
            ..Default::default()
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }
}
