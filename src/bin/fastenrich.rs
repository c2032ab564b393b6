use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use fastenrich::checkpoint::CheckpointStore;
use fastenrich::controls::init_tracing;
use fastenrich::orchestrator::run_shard_worker;
use fastenrich::{
    BatchRunner, Checkpoint, JsonCheckpointStore, JsonlStore, ParallelOrchestrator, ProcessExecutor,
    ServiceArgs, Sink, Source,
};

#[derive(Parser, Debug)]
#[command(
    name = "fastenrich",
    about = "Resumable, rate-limited wallet enrichment over JSONL datasets"
)]
struct Cli {
    #[command(flatten)]
    service: ServiceArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enrich a dataset in this process, resuming from its checkpoint
    Run {
        /// Dataset id; reads `<data-dir>/<dataset>.jsonl`
        dataset: String,
        /// Items per checkpoint (overrides --batch-size)
        batch_size: Option<usize>,
        /// Index to resume from instead of the checkpoint
        start_index: Option<usize>,
    },
    /// Split a dataset across worker processes and merge their outputs
    RunParallel {
        /// Dataset id; reads `<data-dir>/<dataset>.jsonl`
        dataset: String,
        /// Number of worker processes
        #[arg(default_value_t = 4)]
        worker_count: usize,
    },
    /// Print checkpoint progress and output size for a dataset
    Status {
        /// Dataset id
        dataset: String,
    },
    /// Process one shard of a parallel run (launched by run-parallel)
    #[command(hide = true)]
    Worker {
        /// Work directory of the parallel run
        #[arg(long)]
        work_dir: PathBuf,
        /// Dataset id of the shard inside the work directory
        #[arg(long)]
        shard_dataset: String,
        /// Shard index, for logs
        #[arg(long)]
        shard: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let controls = cli
        .service
        .build_controls()
        .context("invalid configuration")?;
    let store = JsonlStore::new(controls.data_dir());
    let checkpoints = JsonCheckpointStore::new(controls.data_dir());

    match cli.command {
        Command::Run {
            dataset,
            batch_size,
            start_index,
        } => {
            let items = store
                .load_items(&dataset)
                .await
                .with_context(|| format!("failed to load dataset {dataset}"))?;
            let mut batch = controls.batch();
            if let Some(size) = batch_size {
                batch.batch_size = size.max(1);
            }
            let worker = controls
                .build_worker()
                .context("failed to build HTTP client")?;
            let outcome = BatchRunner::new(&worker, &store, &checkpoints, batch)
                .run(&dataset, &items, start_index)
                .await
                .with_context(|| format!("run for {dataset} failed"))?;
            if outcome.resumed_from > 0 {
                println!("resumed from item {}", outcome.resumed_from);
            }
            outcome.stats.report(&dataset);
            println!("output: {}", store.output_path(&dataset).display());
        }
        Command::RunParallel {
            dataset,
            worker_count,
        } => {
            let items = store
                .load_items(&dataset)
                .await
                .with_context(|| format!("failed to load dataset {dataset}"))?;
            let program = std::env::current_exe().context("failed to locate own executable")?;
            let orchestrator = ParallelOrchestrator::new(
                ProcessExecutor::new(program, cli.service.to_args()),
                controls.data_dir(),
            );
            let outcome = tokio::select! {
                outcome = orchestrator.run_all(&dataset, &items, worker_count, &store) => {
                    outcome.with_context(|| format!("parallel run for {dataset} failed"))?
                }
                _ = tokio::signal::ctrl_c() => {
                    return Err(anyhow!("interrupted; rerun to resume from shard checkpoints"));
                }
            };
            // The merged output replaces whatever a sequential run left behind.
            checkpoints
                .save(
                    &dataset,
                    &Checkpoint::new(outcome.records.len(), items.len()),
                )
                .await
                .with_context(|| format!("failed to checkpoint {dataset}"))?;
            println!(
                "merged {} records from {} shards {:?}",
                outcome.records.len(),
                outcome.shard_sizes.len(),
                outcome.shard_sizes
            );
            outcome.stats.report(&dataset);
            println!("output: {}", store.output_path(&dataset).display());
        }
        Command::Status { dataset } => {
            match checkpoints.load(&dataset).await? {
                Some(checkpoint) => println!(
                    "[{dataset}] checkpoint {}/{} ({:.1}%){}",
                    checkpoint.last_completed_index,
                    checkpoint.total_items,
                    checkpoint.percent(),
                    if checkpoint.is_complete() { " complete" } else { "" }
                ),
                None => println!("[{dataset}] no checkpoint"),
            }
            println!("[{dataset}] output records: {}", store.count(&dataset).await?);
        }
        Command::Worker {
            work_dir,
            shard_dataset,
            shard,
        } => {
            let worker = controls
                .build_worker()
                .context("failed to build HTTP client")?;
            let outcome = run_shard_worker(&work_dir, &shard_dataset, &worker, controls.batch())
                .await
                .with_context(|| format!("shard {shard} failed"))?;
            tracing::info!(
                shard,
                records = outcome.records.len(),
                resumed_from = outcome.resumed_from,
                "shard finished"
            );
        }
    }
    Ok(())
}
