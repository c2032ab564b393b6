//! Fan-out of shards to independent workers and the final merge.
//!
//! Every shard gets its own input, output and checkpoint files inside a per-run work directory.
//! Workers share nothing else. When all of them succeed the shard outputs are concatenated in
//! shard order, written to the sink, and the work directory is removed. If any worker fails the
//! remaining ones are cancelled and the work directory is left in place: the next run relaunches
//! every shard, and shards that already finished complete immediately from their checkpoints.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::process::Command;

use crate::batch::{BatchConfig, BatchRunner, RunOutcome};
use crate::checkpoint::{CheckpointStore, JsonCheckpointStore};
use crate::enrich::Enrich;
use crate::error::PipelineError;
use crate::record::{EnrichedRecord, EnrichmentStats, WorkItem};
use crate::shard::{self, Shard};
use crate::store::{JsonlStore, Sink, Source};

/// Everything a worker needs to process one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardJob {
    /// Shard bounds within the full input.
    pub shard: Shard,
    /// Dataset id naming the shard's files inside `work_dir`.
    pub shard_dataset: String,
    /// Directory holding every shard's files for this run.
    pub work_dir: PathBuf,
}

/// Runs one shard to completion.
#[async_trait]
pub trait ShardExecutor: Send + Sync {
    /// Processes `job`. Dropping the returned future must stop the work.
    async fn execute(&self, job: &ShardJob) -> Result<(), PipelineError>;
}

/// Runs each shard in a child process: `<program> <args..> worker --work-dir <dir>
/// --shard-dataset <id> --shard <index>`. Children are killed if the orchestration stops early.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessExecutor {
    /// Launches `program` with `args` placed before the `worker` subcommand.
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl ShardExecutor for ProcessExecutor {
    async fn execute(&self, job: &ShardJob) -> Result<(), PipelineError> {
        let index = job.shard.index;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("worker")
            .arg("--work-dir")
            .arg(&job.work_dir)
            .arg("--shard-dataset")
            .arg(&job.shard_dataset)
            .arg("--shard")
            .arg(index.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineError::Spawn {
                shard: index,
                source,
            })?;
        tracing::info!(shard = index, pid = child.id(), items = job.shard.len(), "worker started");

        let status = child
            .wait()
            .await
            .map_err(|err| PipelineError::WorkerFailed {
                shard: index,
                reason: err.to_string(),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(PipelineError::WorkerFailed {
                shard: index,
                reason: status.to_string(),
            })
        }
    }
}

/// Runs each shard as a task in the current process.
#[derive(Clone)]
pub struct InProcessExecutor {
    enricher: Arc<dyn Enrich>,
    config: BatchConfig,
}

impl InProcessExecutor {
    /// Uses `enricher` for every shard.
    pub fn new(enricher: Arc<dyn Enrich>, config: BatchConfig) -> Self {
        Self { enricher, config }
    }
}

#[async_trait]
impl ShardExecutor for InProcessExecutor {
    async fn execute(&self, job: &ShardJob) -> Result<(), PipelineError> {
        run_shard_worker(
            &job.work_dir,
            &job.shard_dataset,
            self.enricher.as_ref(),
            self.config,
        )
        .await
        .map(|_| ())
    }
}

/// Worker entry point: processes the shard stored under `work_dir` as `shard_dataset`,
/// resuming from the shard's own checkpoint.
pub async fn run_shard_worker(
    work_dir: &Path,
    shard_dataset: &str,
    enricher: &dyn Enrich,
    config: BatchConfig,
) -> Result<RunOutcome, PipelineError> {
    let store = JsonlStore::new(work_dir);
    let checkpoints = JsonCheckpointStore::new(work_dir);
    let items = store.load_items(shard_dataset).await?;
    BatchRunner::new(enricher, &store, &checkpoints, config)
        .run(shard_dataset, &items, None)
        .await
}

/// Merged result of a parallel run.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Records of every shard, in input order.
    pub records: Vec<EnrichedRecord>,
    /// Statistics over `records`.
    pub stats: EnrichmentStats,
    /// Item count per shard, in shard order.
    pub shard_sizes: Vec<usize>,
}

/// Plans shards, runs them through an executor, and merges their outputs.
pub struct ParallelOrchestrator<E> {
    executor: E,
    work_root: PathBuf,
}

impl<E: ShardExecutor> ParallelOrchestrator<E> {
    /// Keeps per-run work directories under `work_root`.
    pub fn new(executor: E, work_root: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            work_root: work_root.into(),
        }
    }

    /// Work directory used for `dataset` split across `worker_count` workers.
    pub fn work_dir(&self, dataset: &str, worker_count: usize) -> PathBuf {
        self.work_root
            .join(format!("{dataset}.w{}.shards", worker_count.max(1)))
    }

    /// Processes `items` across `worker_count` shards and writes the merged output to `sink`.
    pub async fn run_all(
        &self,
        dataset: &str,
        items: &[WorkItem],
        worker_count: usize,
        sink: &dyn Sink,
    ) -> Result<MergeOutcome, PipelineError> {
        let work_dir = self.work_dir(dataset, worker_count);
        let work = JsonlStore::new(&work_dir);
        let shards = shard::plan(items.len(), worker_count);
        tracing::info!(
            dataset,
            items = items.len(),
            shards = shards.len(),
            work_dir = %work_dir.display(),
            "starting parallel run"
        );

        let mut jobs = Vec::with_capacity(shards.len());
        for shard in shards {
            let shard_dataset = format!("{dataset}.shard-{:03}", shard.index);
            work.write_items(&shard_dataset, shard.slice(items)).await?;
            jobs.push(ShardJob {
                shard,
                shard_dataset,
                work_dir: work_dir.clone(),
            });
        }

        self.execute_all(&jobs).await?;

        let mut records = Vec::with_capacity(items.len());
        for job in &jobs {
            let output = work.load_partial(&job.shard_dataset).await?.unwrap_or_default();
            if output.len() != job.shard.len() {
                return Err(PipelineError::IncompleteShard {
                    shard: job.shard.index,
                    found: output.len(),
                    expected: job.shard.len(),
                });
            }
            records.extend(output);
        }

        sink.truncate(dataset, 0).await?;
        sink.append_results(dataset, &records).await?;

        let checkpoints = JsonCheckpointStore::new(&work_dir);
        for job in &jobs {
            work.remove(&job.shard_dataset).await?;
            checkpoints.clear(&job.shard_dataset).await?;
        }
        if let Err(err) = tokio::fs::remove_dir(&work_dir).await {
            tracing::warn!(work_dir = %work_dir.display(), error = %err, "could not remove work directory");
        }

        let stats = EnrichmentStats::from_records(&records);
        Ok(MergeOutcome {
            records,
            stats,
            shard_sizes: jobs.iter().map(|job| job.shard.len()).collect(),
        })
    }

    /// Waits for every job; the first failure cancels the rest.
    async fn execute_all(&self, jobs: &[ShardJob]) -> Result<(), PipelineError> {
        let mut running: FuturesUnordered<_> = jobs
            .iter()
            .map(|job| async move { (job.shard.index, self.executor.execute(job).await) })
            .collect();

        let mut failure = None;
        while let Some((index, result)) = running.next().await {
            match result {
                Ok(()) => tracing::info!(shard = index, "shard complete"),
                Err(err) => {
                    tracing::error!(shard = index, error = %err, "shard failed, stopping remaining workers");
                    failure = Some(err);
                    break;
                }
            }
        }
        drop(running);

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
