//! steprun worker process.
//!
//! Started by the coordinator's worker pool. Speaks the line protocol on
//! stdin/stdout and logs to stderr. Runs everything on one thread: blocking
//! tasks run inline, cooperative tasks on a single-threaded event loop.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use steprun_core::WorkerId;
use steprun_engine::{builtin_registry, Worker, WorkerConfig};

/// steprun worker - executes tasks handed out by a coordinator
#[derive(Parser, Debug)]
#[command(name = "steprun-worker")]
#[command(about = "Worker process for steprun", long_about = None)]
struct Args {
    /// Pool slot this worker occupies
    #[arg(long, default_value = "worker-0")]
    worker_id: String,

    /// Directory relative task locations resolve against
    #[arg(long, default_value = ".")]
    work_path: PathBuf,
}

impl From<Args> for WorkerConfig {
    fn from(args: Args) -> Self {
        Self {
            worker_id: WorkerId::new(args.worker_id),
            work_path: args.work_path,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = WorkerConfig::from(args);
    info!(
        worker_id = %config.worker_id,
        work_path = %config.work_path.display(),
        pid = std::process::id(),
        "Starting steprun worker"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let worker = Worker::new(config, builtin_registry());
    let result = runtime.block_on(worker.run(tokio::io::stdin(), tokio::io::stdout()));
    // The stdin reader blocks on a thread that only returns at EOF; do not
    // wait for it.
    runtime.shutdown_background();

    if let Err(e) = result {
        error!(error = %e, "Worker loop failed");
        return Err(e.into());
    }
    Ok(())
}
