use clap::{Parser, ValueEnum};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use nodeflow::config::{ExecutorConfig, SandboxConfig, SchedulerConfig};
use nodeflow::error::report;
use nodeflow::sandbox::{describe, find_project_root, Project, Registry};
use nodeflow::scheduler::{Details, ParamValue, Params, Task};
use nodeflow::shutdown::install_shutdown_handler;
use nodeflow::{Executor, Scheduler};

#[derive(Parser, Debug)]
#[command(name = "nodeflow")]
#[command(version)]
#[command(about = "Distributed workflow execution engine")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a scheduler with one child executor until interrupted
    Scheduler(SchedulerArgs),

    /// Run an executor worker connected to a scheduler
    Executor(ExecutorArgs),

    /// Run one workflow callable on a local scheduler and print the result
    Run(RunArgs),

    /// List a workflow module's entry points
    Inspect {
        /// Path to the workflow module
        script: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SchedulerArgs {
    /// Address to accept executor connections on
    #[arg(long, default_value = "127.0.0.1:5000")]
    listen: SocketAddr,

    /// Do not launch a child executor
    #[arg(long)]
    no_executor: bool,

    /// Extra modules the child executor's sandbox may import
    #[arg(long = "allow-module")]
    allow_modules: Vec<String>,
}

#[derive(Parser, Debug)]
struct ExecutorArgs {
    /// Scheduler WebSocket URL
    #[arg(long, default_value = "ws://localhost:5000/")]
    scheduler: String,

    /// Executor ID reported at registration (random if omitted)
    #[arg(long)]
    executor_id: Option<String>,

    /// Seconds to wait between reconnect attempts
    #[arg(long, default_value = "5")]
    reconnect_delay: u64,

    /// Extra modules the sandbox may import
    #[arg(long = "allow-module")]
    allow_modules: Vec<String>,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the workflow module
    script: PathBuf,

    /// Entry point to call
    callable: String,

    /// Parameter as name=json; values that are not JSON are taken as strings
    #[arg(long = "param", short = 'p')]
    params: Vec<String>,

    /// Per-node option overrides as a JSON object
    #[arg(long)]
    details: Option<String>,

    /// Describe the callable instead of running it
    #[arg(long)]
    prepare: bool,

    /// Run without the sandbox's import allow-list
    #[arg(long)]
    no_sandbox: bool,

    #[arg(long, default_value = "0")]
    priority: i64,

    /// Task timeout in seconds
    #[arg(long, default_value = "300")]
    timeout: u64,

    /// Extra modules the sandbox may import
    #[arg(long = "allow-module")]
    allow_modules: Vec<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_params(raw: &[String]) -> Result<Params, Box<dyn std::error::Error>> {
    let mut params = Params::new();
    for entry in raw {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("invalid --param `{}`, expected name=value", entry))?;
        let value = serde_json::from_str::<ParamValue>(value)
            .unwrap_or_else(|_| ParamValue::literal(value));
        params.insert(name.trim().to_string(), value);
    }
    Ok(params)
}

fn parse_details(raw: Option<&str>) -> Result<Details, Box<dyn std::error::Error>> {
    match raw {
        None => Ok(Details::new()),
        Some(text) => match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => Ok(map),
            _ => Err("--details must be a JSON object".into()),
        },
    }
}

fn scheduler_config(listen: SocketAddr, allow_modules: &[String]) -> std::io::Result<SchedulerConfig> {
    let mut config = SchedulerConfig::standalone(listen)?;
    config.executor = config.executor.map(|spawn| {
        allow_modules
            .iter()
            .fold(spawn, |spawn, module| spawn.allow_module(module.as_str()))
    });
    Ok(config)
}

fn sandbox_config(allow_modules: Vec<String>) -> SandboxConfig {
    allow_modules
        .into_iter()
        .fold(SandboxConfig::default(), |config, module| config.allow_module(module))
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_scheduler(args: SchedulerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = if args.no_executor {
        SchedulerConfig::new(args.listen)
    } else {
        scheduler_config(args.listen, &args.allow_modules)?
    };

    let shutdown = install_shutdown_handler();
    let scheduler = Scheduler::new(config);
    let addr = scheduler.start().await?;
    tracing::info!(addr = %addr, child_executor = !args.no_executor, "Scheduler running");

    shutdown.cancelled().await;
    scheduler.stop().await;
    Ok(())
}

async fn run_executor(args: ExecutorArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ExecutorConfig::new(args.scheduler)
        .with_reconnect_delay(Duration::from_secs(args.reconnect_delay))
        .with_sandbox(sandbox_config(args.allow_modules));
    if let Some(id) = args.executor_id {
        config.executor_id = id;
    }

    tracing::info!(
        executor_id = %config.executor_id,
        scheduler = %config.scheduler_url,
        "Starting executor"
    );

    let shutdown = install_shutdown_handler();
    Executor::new(config).run(shutdown).await?;
    Ok(())
}

async fn run_once(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut task = Task::new(args.script, args.callable)
        .with_params(parse_params(&args.params)?)
        .with_details(parse_details(args.details.as_deref())?)
        .with_priority(args.priority)
        .with_timeout(args.timeout);
    if args.prepare {
        task = task.prepare();
    }
    if args.no_sandbox {
        task = task.without_sandbox();
    }

    let config = scheduler_config(SocketAddr::from(([127, 0, 0, 1], 0)), &args.allow_modules)?;
    let scheduler = Scheduler::new(config);
    scheduler.start().await?;

    let shutdown = install_shutdown_handler();
    let outcome = tokio::select! {
        outcome = scheduler.run_task(task) => Some(outcome),
        _ = shutdown.cancelled() => None,
    };
    scheduler.stop().await;

    match outcome {
        Some(Ok(value)) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Some(Err(e)) => Err(report(&e).into()),
        None => Err("interrupted".into()),
    }
}

fn inspect(script: PathBuf, output: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let entry_points = describe(&script, Arc::new(Registry::with_sdk()))?;
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&entry_points)?);
        }
        OutputFormat::Table => {
            if let Some(root) = find_project_root(&script) {
                match Project::open(&root) {
                    Ok(project) => println!("Project: {} ({})", root.display(), project.version),
                    Err(e) => tracing::warn!(error = %e, "Failed to read project file"),
                }
            }
            if entry_points.is_empty() {
                println!("No entry points in {}", script.display());
            }
            for entry in entry_points {
                let params: Vec<String> = entry
                    .params
                    .iter()
                    .map(|(name, ty)| format!("{}: {}", name, ty))
                    .collect();
                println!(
                    "{}({}) -> [{}]",
                    entry.name,
                    params.join(", "),
                    entry.returns.join(", ")
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Scheduler(args) => run_scheduler(args).await,
        Commands::Executor(args) => run_executor(args).await,
        Commands::Run(args) => run_once(args).await,
        Commands::Inspect { script, output } => inspect(script, output),
    }
}
