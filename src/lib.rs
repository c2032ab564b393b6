#![warn(missing_docs)]
//! Core library entry points for the fastenrich wallet enrichment pipeline.

pub mod api;
pub mod batch;
pub mod checkpoint;
pub mod chunk;
pub mod controls;
pub mod enrich;
pub mod error;
pub mod fetch;
pub mod orchestrator;
pub mod rate_limit;
pub mod record;
pub mod shard;
pub mod store;

pub use batch::{BatchConfig, BatchRunner, RunOutcome, RunState};
pub use checkpoint::{Checkpoint, CheckpointStore, JsonCheckpointStore};
pub use chunk::{ChunkCursor, ChunkDescriptor, ChunkOutcome};
pub use controls::{EnrichControls, ServiceArgs};
pub use enrich::{Enrich, EnrichmentWorker, LookupEndpoint};
pub use error::{ChunkRequestError, ConfigError, PipelineError, StoreError};
pub use fetch::{RetryPolicy, RetryingFetcher};
pub use orchestrator::{
    InProcessExecutor, MergeOutcome, ParallelOrchestrator, ProcessExecutor, ShardExecutor, ShardJob,
};
pub use rate_limit::RateLimiter;
pub use record::{EnrichedRecord, EnrichmentStats, Field, FieldSource, WorkItem};
pub use shard::Shard;
pub use store::{JsonlStore, MemoryStore, Sink, Source};
