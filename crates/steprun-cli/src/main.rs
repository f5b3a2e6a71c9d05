//! steprun CLI - run pipeline steps on a local worker pool.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use steprun_core::{Step, StepStatus, Task};
use steprun_engine::{
    builtin_registry, Coordinator, ExecutionMode, JsonManifest, PipelineConfig, RunConfig,
};

/// steprun - pipeline step runner
#[derive(Parser)]
#[command(name = "steprun")]
#[command(about = "Run pipeline steps on a pool of worker processes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one step of a pipeline file
    Run {
        /// Pipeline YAML file
        #[arg(short, long)]
        config: PathBuf,

        /// Step to run
        #[arg(short, long)]
        step: String,

        /// Number of worker processes (overrides the file)
        #[arg(long)]
        pool_size: Option<usize>,

        /// Work path (overrides the file)
        #[arg(long)]
        work_path: Option<PathBuf>,

        /// Worker executable (defaults to steprun-worker next to this binary)
        #[arg(long)]
        worker: Option<PathBuf>,

        /// Print the final step as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the steps declared in a pipeline file
    Steps {
        /// Pipeline YAML file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// List registered task types
    Tasks,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            config,
            step,
            pool_size,
            work_path,
            worker,
            json,
        } => {
            let pipeline = PipelineConfig::load(&config)?;
            let mut run_config = pipeline.apply(RunConfig::new(worker_program(worker)?));
            if let Some(pool_size) = pool_size {
                run_config.pool_size = pool_size;
            }
            if let Some(work_path) = work_path {
                run_config.work_path = work_path;
            }

            let finished = run_step(&pipeline, &step, run_config, json).await?;
            if finished.status() != StepStatus::Done {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Steps { config } => {
            let pipeline = PipelineConfig::load(&config)?;
            println!("{:<24}  {}", "STEP", "TASKS");
            println!("{}", "-".repeat(40));
            for name in pipeline.step_names() {
                let count = pipeline.steps.get(name).map_or(0, Vec::len);
                println!("{:<24}  {}", name, count);
            }
        }
        Commands::Tasks => {
            println!("{:<16}  {}", "TYPE", "MODE");
            println!("{}", "-".repeat(32));
            for (tag, mode) in builtin_registry().tags() {
                println!("{:<16}  {}", tag, mode_name(mode));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn run_step(
    pipeline: &PipelineConfig,
    name: &str,
    config: RunConfig,
    json: bool,
) -> Result<Step, Box<dyn std::error::Error>> {
    let step = pipeline.step(name)?;
    let manifest = JsonManifest::new(&config.work_path);
    let manifest_path = manifest.path().to_path_buf();

    let mut coordinator = Coordinator::new(config, builtin_registry(), manifest);
    let step = coordinator.run(step).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&step)?);
    } else {
        print_step(&step);
        println!("  Manifest:   {}", manifest_path.display());
    }
    Ok(step)
}

fn worker_program(explicit: Option<PathBuf>) -> std::io::Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => {
            let name = format!("steprun-worker{}", std::env::consts::EXE_SUFFIX);
            Ok(std::env::current_exe()?.with_file_name(name))
        }
    }
}

fn print_step(step: &Step) {
    let mut tasks: Vec<&Task> = step.tasks.iter().collect();
    tasks.sort_by(|a, b| a.declaration.cmp(&b.declaration));

    println!("Tasks ({}):", tasks.len());
    println!("{:<40}  {:<20}  {:>8}  {}", "NAME", "STATUS", "SECONDS", "REASON");
    println!("{}", "-".repeat(100));
    for task in tasks {
        let indent = "  ".repeat(task.declaration.depth().saturating_sub(1));
        let name = format!("{indent}{}", task.name);
        let reason = task
            .failure_reason
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        println!(
            "{:<40}  {:<20}  {:>8}  {}",
            name,
            task.status.as_str(),
            elapsed(task),
            reason
        );
    }

    if !step.diagnostics.is_empty() {
        println!("Diagnostics:");
        for diagnostic in &step.diagnostics {
            println!("  - {}", serde_json::to_string(diagnostic).unwrap_or_default());
        }
    }

    println!();
    println!("  Step:       {}", step.name);
    println!("  Status:     {}", step.status());
    println!("  Started:    {}", format_time(step.started_at));
    println!("  Finished:   {}", format_time(step.finished_at));
}

fn elapsed(task: &Task) -> String {
    match (task.started_at, task.finished_at) {
        (Some(start), Some(end)) => {
            format!("{:.2}", (end - start).num_milliseconds() as f64 / 1000.0)
        }
        _ => "-".to_string(),
    }
}

fn format_time(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn mode_name(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Blocking => "blocking",
        ExecutionMode::Cooperative => "cooperative",
    }
}
