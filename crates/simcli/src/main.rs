use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use simcore::{
    ExecutionEvent, JoinMode, StepSpec, SuccessRoute, Target, TaskId, TaskSpec, WorkflowGraph,
};
use simruntime::{
    load_param_grid, load_task_list, load_workflow_graph, validate_graph, JobMonitor,
    ParallelStats, RuntimeConfig, SimRuntime, ToolRegistry, WorkflowOutcome,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_HISTORY: &str = "simflow_jobs.jsonl";

#[derive(Parser)]
#[command(name = "simflow")]
#[command(about = "Simulation workflow orchestrator", long_about = None)]
struct Cli {
    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Job history file (overrides SIMFLOW_HISTORY_PATH)
    #[arg(long, global = true)]
    history: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow graph
    Run {
        /// Path to workflow graph JSON file
        file: PathBuf,

        /// Extra workflow context as a JSON object
        #[arg(short, long)]
        context: Option<String>,
    },

    /// Validate a workflow graph
    Validate {
        file: PathBuf,
    },

    /// Submit a task list ([{tool, script, params}])
    SubmitWorkflow {
        file: PathBuf,

        /// Submit everything at once instead of one after another
        #[arg(long)]
        parallel: bool,

        /// Submit in groups of this size, waiting for each group
        #[arg(long, conflicts_with = "parallel")]
        batch: Option<usize>,
    },

    /// Run one task per combination of a parameter grid
    Sweep {
        #[arg(long)]
        tool: String,

        #[arg(long)]
        script: String,

        /// JSON object of name -> [values], or a file containing one
        #[arg(long)]
        grid: String,
    },

    /// Show recent jobs
    JobHistory {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Aggregate statistics over the job history
    JobStats,

    /// Show one job
    JobDetails {
        task_id: String,
    },

    /// List available tools
    Tools,

    /// Write an example workflow graph
    Init {
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    simtools::register_all(&mut registry);
    Arc::new(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = RuntimeConfig::from_env();
    if let Some(path) = cli.history {
        config.history_path = Some(path);
    }
    config
        .history_path
        .get_or_insert_with(|| PathBuf::from(DEFAULT_HISTORY));

    match cli.command {
        Commands::Run { file, context } => run_workflow(config, file, context).await,
        Commands::Validate { file } => validate_workflow(file),
        Commands::SubmitWorkflow {
            file,
            parallel,
            batch,
        } => submit_workflow(config, file, parallel, batch).await,
        Commands::Sweep { tool, script, grid } => sweep(config, tool, script, grid).await,
        Commands::JobHistory { limit } => job_history(&config, limit).await,
        Commands::JobStats => job_stats(&config).await,
        Commands::JobDetails { task_id } => job_details(&config, &task_id).await,
        Commands::Tools => {
            list_tools();
            Ok(())
        }
        Commands::Init { output } => create_example_workflow(output),
    }
}

async fn run_workflow(config: RuntimeConfig, file: PathBuf, context: Option<String>) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let graph = load_workflow_graph(&file)?;
    println!("📋 Workflow: {} ({} steps, start at '{}')", graph.name, graph.steps.len(), graph.start);
    println!();

    let context = match context {
        Some(raw) => match serde_json::from_str::<serde_json::Value>(&raw)? {
            serde_json::Value::Object(map) => map,
            _ => bail!("Context must be a JSON object"),
        },
        None => serde_json::Map::new(),
    };

    let runtime = SimRuntime::new(config, registry());
    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::WorkflowStarted { workflow, .. } => {
                    println!("▶️  Workflow '{}' started", workflow);
                }
                ExecutionEvent::StepStarted { step, attempt, task_id, .. } => match task_id {
                    Some(id) => println!("  ⚡ {} (attempt {}) → task {}", step, attempt, id),
                    None => println!("  ⚡ {} (attempt {}) → submission failed", step, attempt),
                },
                ExecutionEvent::StepCompleted { step, state, duration_ms, .. } => {
                    println!("  {} {} finished: {} in {}ms", if state.is_success() { "✅" } else { "❌" }, step, state, duration_ms);
                }
                ExecutionEvent::RouteDecided { step, strategy, next, reason, .. } => {
                    println!("     ↪ {} → {} [{:?}] {}", step, next, strategy, reason);
                }
                ExecutionEvent::WorkflowCompleted { success, iterations, duration_ms, .. } => {
                    if success {
                        println!("✨ Workflow completed in {}ms ({} steps)", duration_ms, iterations);
                    } else {
                        println!("💥 Workflow stopped after {}ms ({} steps)", duration_ms, iterations);
                    }
                }
                ExecutionEvent::TaskSubmitted { .. } | ExecutionEvent::TaskFinished { .. } => {}
            }
        }
    });

    let report = runtime
        .executor()
        .execute_with_context(&graph, context)
        .await?;

    // Let the listener drain before printing the summary
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", report.execution_id);
    println!("   Path: {}", report.path.join(" → "));
    println!("   Retries: {}  Breaker failures: {}", report.state.total_retries(), report.state.failure_count);
    if !report.state.results.is_empty() {
        println!();
        println!("📤 Results:");
        let mut steps: Vec<_> = report.state.results.iter().collect();
        steps.sort_by(|a, b| a.0.cmp(b.0));
        for (step, result) in steps {
            println!("   {}: {}", step, result);
        }
    }
    if !report.errors().is_empty() {
        println!();
        println!("⚠️  Errors:");
        for e in report.errors() {
            println!("   [{}] {} ({:?}): {}", e.severity, e.step, e.kind, e.message);
        }
    }

    match report.outcome {
        WorkflowOutcome::Completed => Ok(()),
        WorkflowOutcome::Failed { step, reason } => bail!("workflow failed at '{}': {}", step, reason),
        WorkflowOutcome::IterationCapReached => bail!("workflow hit the iteration cap"),
    }
}

fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());
    let contents = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let graph: WorkflowGraph = serde_json::from_str(&contents)?;
    let dag = validate_graph(&graph)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", graph.name);
    println!("   Steps: {}", dag.node_count());
    println!("   Edges: {}", dag.edge_count());
    Ok(())
}

async fn await_and_report(runtime: &SimRuntime, ids: &[TaskId]) -> Result<()> {
    let timeout = runtime.pipeline().config().task_timeout;
    let statuses = runtime.pipeline().wait_for_all(ids, timeout).await?;
    for (id, status) in ids.iter().zip(&statuses) {
        println!("  {} {}", id, status.state);
    }
    print_stats(&runtime.pipeline().get_parallel_execution_stats(ids).await?);
    Ok(())
}

fn print_stats(stats: &ParallelStats) {
    println!();
    println!("📊 {} of {} tasks finished", stats.completed, stats.task_count);
    println!("   total {:.2}s  avg {:.2}s  max {:.2}s", stats.total_duration_secs, stats.avg_duration_secs, stats.max_duration_secs);
    println!("   wall clock {:.2}s  speedup {:.2}  efficiency {:.2}", stats.wall_clock_secs, stats.speedup, stats.efficiency);
}

async fn submit_workflow(
    config: RuntimeConfig,
    file: PathBuf,
    parallel: bool,
    batch: Option<usize>,
) -> Result<()> {
    let tasks: Vec<TaskSpec> = load_task_list(&file)?;
    let runtime = SimRuntime::new(config, registry());
    let pipeline = runtime.pipeline();

    let ids = if let Some(size) = batch {
        pipeline
            .submit_batch_workflow(&tasks, Some(size), |progress| {
                println!(
                    "📦 Batch {}/{}: {}/{} submitted",
                    progress.batch_index + 1,
                    progress.batch_count,
                    progress.submitted,
                    progress.total
                );
            })
            .await?
    } else {
        pipeline.submit_workflow(&tasks, !parallel).await?
    };
    println!("🚀 Submitted {} task(s)", ids.len());
    await_and_report(&runtime, &ids).await
}

async fn sweep(config: RuntimeConfig, tool: String, script: String, grid: String) -> Result<()> {
    let grid = load_param_grid(&grid)?;
    if grid.is_empty() {
        bail!("parameter grid is empty");
    }
    let runtime = SimRuntime::new(config, registry());
    let ids = runtime.pipeline().parameter_sweep(&tool, &script, &grid).await?;
    println!("🚀 Sweep submitted {} task(s)", ids.len());
    await_and_report(&runtime, &ids).await
}

fn monitor(config: &RuntimeConfig) -> JobMonitor {
    JobMonitor::new(config.history_path.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_HISTORY)))
}

async fn job_history(config: &RuntimeConfig, limit: usize) -> Result<()> {
    let records = monitor(config).history(Some(limit)).await?;
    if records.is_empty() {
        println!("No jobs recorded yet");
        return Ok(());
    }
    for r in records {
        println!(
            "{}  {:<10} {:<10} {:>8.2}s  {} {}",
            r.start_time.format("%Y-%m-%d %H:%M:%S"),
            r.status,
            r.tool,
            r.duration_seconds,
            r.task_id,
            r.script
        );
    }
    Ok(())
}

async fn job_stats(config: &RuntimeConfig) -> Result<()> {
    let stats = monitor(config).stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn job_details(config: &RuntimeConfig, task_id: &str) -> Result<()> {
    let record = monitor(config).details(task_id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn list_tools() {
    println!("📦 Available tools:");
    println!();

    let registry = registry();
    for name in registry.list_tools() {
        if let Some(metadata) = registry.get_metadata(&name) {
            println!("  • {} ({})", name, metadata.category);
            println!("    {}", metadata.description);
            for param in metadata.params {
                let marker = if param.required { " (required)" } else { "" };
                println!("      - {}{}: {}", param.name, marker, param.description);
            }
        } else {
            println!("  • {}", name);
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let mesh = TaskSpec::new("sleep", "mesh").with_param("duration_ms", 500);
    let solve = |name: &str| TaskSpec::new("sleep", name).with_param("duration_ms", 1000);

    let graph = WorkflowGraph::new("example-study", "mesh")
        .with_max_retries(2)
        .with_step(StepSpec::new("mesh", mesh).on_success(SuccessRoute::Parallel {
            branches: vec!["solve_coarse".to_string(), "solve_fine".to_string()],
            join: "report".to_string(),
            mode: JoinMode::All,
        }))
        .with_step(StepSpec::new("solve_coarse", solve("solve_coarse")).fallback("report"))
        .with_step(StepSpec::new("solve_fine", solve("solve_fine")).fallback("report"))
        .with_step(
            StepSpec::new("report", TaskSpec::new("echo", "report")).on_success(SuccessRoute::Next {
                target: Target::Complete,
            }),
        );

    std::fs::write(&output, serde_json::to_string_pretty(&graph)?)?;
    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  simflow run {}", output.display());
    Ok(())
}
