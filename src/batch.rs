//! Sequential, paced, checkpointed processing of one work list.
//!
//! Items are enriched one after another with a fixed delay between calls, grouped into batches.
//! After each batch the records are appended to the sink and only then is the checkpoint saved,
//! so a checkpoint never claims more than the sink holds. A rerun picks up from the checkpoint
//! and leaves the already-written prefix untouched.

use std::time::Duration;

use tokio::time::sleep;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::enrich::Enrich;
use crate::error::PipelineError;
use crate::record::{EnrichedRecord, EnrichmentStats, WorkItem};
use crate::store::Sink;

/// Batch sizing and pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Items per checkpoint.
    pub batch_size: usize,
    /// Delay between consecutive item enrichments.
    pub item_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            item_delay: Duration::from_millis(100),
        }
    }
}

/// Enriches `items` in order, sleeping `delay` between consecutive calls.
pub async fn enrich_paced(
    enricher: &dyn Enrich,
    items: &[WorkItem],
    delay: Duration,
) -> Vec<EnrichedRecord> {
    let mut records = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        if i > 0 && !delay.is_zero() {
            sleep(delay).await;
        }
        records.push(enricher.enrich(item).await);
    }
    records
}

/// Lifecycle of a [`BatchRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No run started yet.
    Idle,
    /// Enriching the batch starting at `batch_start`.
    Running {
        /// Index of the first item in the batch.
        batch_start: usize,
    },
    /// Batch results and checkpoint are durable up to `completed`.
    Checkpointed {
        /// Items completed so far.
        completed: usize,
    },
    /// Every item has been processed.
    Completed,
}

/// Result of a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Every output record, prefix from earlier runs included.
    pub records: Vec<EnrichedRecord>,
    /// Index the run resumed from.
    pub resumed_from: usize,
    /// Statistics over `records`.
    pub stats: EnrichmentStats,
}

/// Drives an [`Enrich`] implementation over a work list with checkpointing.
pub struct BatchRunner<'a> {
    enricher: &'a dyn Enrich,
    sink: &'a dyn Sink,
    checkpoints: &'a dyn CheckpointStore,
    config: BatchConfig,
    state: RunState,
}

impl<'a> BatchRunner<'a> {
    /// Creates an idle runner.
    pub fn new(
        enricher: &'a dyn Enrich,
        sink: &'a dyn Sink,
        checkpoints: &'a dyn CheckpointStore,
        config: BatchConfig,
    ) -> Self {
        Self {
            enricher,
            sink,
            checkpoints,
            config: BatchConfig {
                batch_size: config.batch_size.max(1),
                ..config
            },
            state: RunState::Idle,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Processes `items` for `dataset`, resuming from the stored checkpoint, or from
    /// `start_override` when given.
    pub async fn run(
        &mut self,
        dataset: &str,
        items: &[WorkItem],
        start_override: Option<usize>,
    ) -> Result<RunOutcome, PipelineError> {
        let total = items.len();
        let (start, mut records) = self.resume_point(dataset, total, start_override).await?;
        let resumed_from = start;
        if start > 0 {
            tracing::info!(dataset, start, total, "resuming from checkpoint");
        }

        let mut stats = EnrichmentStats::from_records(&records);
        let mut batch_start = start;
        while batch_start < total {
            let batch_end = (batch_start + self.config.batch_size).min(total);
            self.state = RunState::Running { batch_start };

            if batch_start > start && !self.config.item_delay.is_zero() {
                sleep(self.config.item_delay).await;
            }
            let batch = enrich_paced(
                self.enricher,
                &items[batch_start..batch_end],
                self.config.item_delay,
            )
            .await;

            self.sink.append_results(dataset, &batch).await?;
            self.checkpoints
                .save(dataset, &Checkpoint::new(batch_end, total))
                .await?;
            self.state = RunState::Checkpointed {
                completed: batch_end,
            };

            for record in &batch {
                stats.absorb(record);
            }
            records.extend(batch);
            print_progress(dataset, batch_end, total, &stats);
            batch_start = batch_end;
        }

        if total == 0 {
            self.checkpoints
                .save(dataset, &Checkpoint::new(0, 0))
                .await?;
        }
        self.state = RunState::Completed;
        Ok(RunOutcome {
            records,
            resumed_from,
            stats,
        })
    }

    /// Works out where to start and reconciles the stored output with the checkpoint.
    async fn resume_point(
        &self,
        dataset: &str,
        total: usize,
        start_override: Option<usize>,
    ) -> Result<(usize, Vec<EnrichedRecord>), PipelineError> {
        let partial = self.sink.load_partial(dataset).await?.unwrap_or_default();
        let written = partial.len();

        let start = match start_override {
            Some(start) if start > written => {
                return Err(PipelineError::InvalidStart { start, written });
            }
            Some(start) => start.min(total),
            None => match self.checkpoints.load(dataset).await? {
                Some(checkpoint) if checkpoint.total_items != total => {
                    tracing::warn!(
                        dataset,
                        checkpoint_total = checkpoint.total_items,
                        total,
                        "checkpoint was taken against a different input, starting over"
                    );
                    0
                }
                Some(checkpoint) => {
                    if checkpoint.last_completed_index > written {
                        tracing::warn!(
                            dataset,
                            checkpoint = checkpoint.last_completed_index,
                            written,
                            "output is behind the checkpoint, resuming from the output"
                        );
                    }
                    checkpoint.last_completed_index.min(written)
                }
                None => 0,
            },
        };

        let mut partial = partial;
        if written > start {
            if start > 0 {
                tracing::info!(dataset, dropped = written - start, "discarding records past the checkpoint");
            }
            self.sink.truncate(dataset, start).await?;
            partial.truncate(start);
        }
        Ok((start, partial))
    }
}

fn print_progress(dataset: &str, current: usize, total: usize, stats: &EnrichmentStats) {
    let percent = if total == 0 {
        100.0
    } else {
        current as f64 * 100.0 / total as f64
    };
    println!(
        "[{dataset}] {current}/{total} ({percent:.1}%) avatars {}/{} fallback {} | activity {}/{} fallback {}",
        stats.avatar.fetched,
        stats.total,
        stats.avatar.fallback + stats.avatar.missing,
        stats.activity.fetched,
        stats.total,
        stats.activity.fallback + stats.activity.missing,
    );
}
