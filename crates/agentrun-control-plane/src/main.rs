//! agentrun - run agent tasks through a local orchestrator.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use agentrun_control_plane::{
    render_prometheus, BuiltinAgentFactory, MemoryResultStore, Orchestrator, OrchestratorConfig,
    ResilientAgentFactory,
};
use agentrun_core::{Task, TaskId};
use agentrun_resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, RetryPolicy};

#[derive(Parser)]
#[command(name = "agentrun")]
#[command(about = "Run agent tasks through a local orchestrator", long_about = None)]
#[command(version)]
struct Args {
    /// Task to submit, as TYPE or TYPE=JSON. Repeatable.
    #[arg(long = "task", value_name = "TYPE[=JSON]")]
    tasks: Vec<String>,

    /// Maximum number of agents in the pool
    #[arg(long, env = "AGENTRUN_MAX_AGENTS", default_value_t = 10)]
    max_agents: usize,

    /// Upper bound on each agent's concurrent tasks
    #[arg(long, env = "AGENTRUN_MAX_TASKS_PER_AGENT", default_value_t = 5)]
    max_tasks_per_agent: u32,

    /// Per-task execution timeout in seconds
    #[arg(long, env = "AGENTRUN_TASK_TIMEOUT_SECS", default_value_t = 30)]
    task_timeout_secs: u64,

    /// Seconds between health sweeps
    #[arg(long, env = "AGENTRUN_HEALTH_CHECK_INTERVAL_SECS", default_value_t = 30)]
    health_check_interval_secs: u64,

    /// Seconds between metrics snapshots
    #[arg(long, env = "AGENTRUN_METRICS_INTERVAL_SECS", default_value_t = 30)]
    metrics_interval_secs: u64,

    /// Disable the periodic metrics loop
    #[arg(long, env = "AGENTRUN_NO_METRICS")]
    no_metrics: bool,

    /// Submission queue capacity
    #[arg(long, env = "AGENTRUN_QUEUE_CAPACITY", default_value_t = 1000)]
    queue_capacity: usize,

    /// Seconds a submission waits on a full queue before it is rejected
    #[arg(long, env = "AGENTRUN_SUBMIT_GRACE_SECS", default_value_t = 5)]
    submit_grace_secs: u64,

    /// Simulated work per task in milliseconds (defaults to each agent kind's own)
    #[arg(long, env = "AGENTRUN_WORK_MS")]
    work_ms: Option<u64>,

    /// Attempts per task inside each agent before it gives up
    #[arg(long, env = "AGENTRUN_RETRY_ATTEMPTS", default_value_t = 3)]
    retry_attempts: u32,

    /// Print Prometheus metrics before exiting
    #[arg(long)]
    prometheus: bool,

    /// Keep running until Ctrl-C instead of exiting once the tasks finish
    #[arg(long)]
    serve: bool,
}

impl Args {
    fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_max_agents(self.max_agents)
            .with_max_tasks_per_agent(self.max_tasks_per_agent)
            .with_task_timeout(Duration::from_secs(self.task_timeout_secs))
            .with_health_check_interval(Duration::from_secs(self.health_check_interval_secs))
            .with_metrics(
                !self.no_metrics,
                Duration::from_secs(self.metrics_interval_secs),
            )
            .with_queue_capacity(self.queue_capacity)
            .with_submit_grace(Duration::from_secs(self.submit_grace_secs))
    }
}

/// Parse `TYPE` or `TYPE=JSON` into a task.
fn parse_task(arg: &str) -> Result<Task, Box<dyn std::error::Error>> {
    let (task_type, input) = match arg.split_once('=') {
        Some((task_type, json)) => {
            let input: Value = serde_json::from_str(json)
                .map_err(|e| format!("Invalid JSON input for task '{}': {}", task_type, e))?;
            (task_type.trim(), input)
        }
        None => (arg.trim(), Value::Object(Default::default())),
    };
    if task_type.is_empty() {
        return Err(format!("Missing task type in '{}'", arg).into());
    }
    Ok(Task::new(task_type, input))
}

async fn wait_for_tasks(orchestrator: &Orchestrator, ids: &[TaskId]) {
    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    loop {
        ticker.tick().await;
        let mut pending = 0;
        for id in ids {
            if let Ok(task) = orchestrator.get_task(id).await {
                if !task.is_terminal() {
                    pending += 1;
                }
            }
        }
        if pending == 0 {
            return;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("agentrun=info".parse()?))
        .with_target(true)
        .init();

    let args = Args::parse();
    let config = args.config();
    let tasks = args
        .tasks
        .iter()
        .map(|arg| parse_task(arg))
        .collect::<Result<Vec<_>, _>>()?;

    let mut builtin = BuiltinAgentFactory::new().with_max_workload(config.max_tasks_per_agent);
    if let Some(ms) = args.work_ms {
        builtin = builtin.with_work_duration(Duration::from_millis(ms));
    }
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
    let factory = ResilientAgentFactory::new(
        builtin,
        breakers.clone(),
        RetryPolicy::fast_local().with_max_attempts(args.retry_attempts),
    );
    let store = Arc::new(MemoryResultStore::new(config.result_capacity));

    info!(
        max_agents = config.max_agents,
        tasks = tasks.len(),
        "Starting agentrun"
    );
    let orchestrator = Orchestrator::builder(config)
        .factory(factory)
        .store(store)
        .start();

    let mut ids = Vec::with_capacity(tasks.len());
    for task in tasks {
        let task_type = task.task_type.clone();
        match orchestrator.submit(task).await {
            Ok(id) => ids.push(id),
            Err(e) => error!(task_type = %task_type, error = %e, "Failed to submit task"),
        }
    }

    if args.serve {
        info!("Serving until Ctrl-C");
        tokio::signal::ctrl_c().await?;
    } else {
        tokio::select! {
            _ = wait_for_tasks(&orchestrator, &ids) => {}
            result = tokio::signal::ctrl_c() => result?,
        }
    }

    orchestrator.stop().await?;

    for id in &ids {
        match orchestrator.get_task(id).await {
            Ok(task) => println!("{}", serde_json::to_string_pretty(&task)?),
            Err(e) => error!(task_id = %id, error = %e, "Task disappeared"),
        }
    }

    for stats in breakers.stats() {
        info!(
            breaker = %stats.name,
            state = %stats.state,
            failures = stats.failures,
            "Circuit breaker"
        );
    }

    if args.prometheus {
        print!("{}", render_prometheus(&orchestrator.metrics().await));
    }

    Ok(())
}
