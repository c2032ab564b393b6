//! Caller-driven chunk cursor: one bounded slice of a dataset per call, no server-side state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::enrich_paced;
use crate::enrich::Enrich;
use crate::error::{ChunkRequestError, PipelineError};
use crate::store::{Sink, Source};

/// Bounds of one chunk, recomputed on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Requested chunk.
    pub chunk_index: usize,
    /// Items per chunk.
    pub chunk_size: usize,
    /// Chunks needed to cover the dataset.
    pub total_chunks: usize,
    /// First item of the chunk.
    pub start: usize,
    /// One past the last item of the chunk, clamped to the dataset length.
    pub end: usize,
}

impl ChunkDescriptor {
    /// Describes chunk `chunk_index` of a `total`-item dataset. A zero `chunk_size` is treated as 1.
    pub fn compute(total: usize, chunk_size: usize, chunk_index: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let start = chunk_index.saturating_mul(chunk_size);
        Self {
            chunk_index,
            chunk_size,
            total_chunks: total.div_ceil(chunk_size),
            start,
            end: start.saturating_add(chunk_size).min(total),
        }
    }

    /// Whether the chunk lies entirely past the end of the dataset.
    pub fn is_past_end(&self) -> bool {
        self.start >= self.end
    }

    /// Chunk the caller should request next, or `None` once the dataset is covered.
    pub fn next_chunk(&self) -> Option<usize> {
        let next = self.chunk_index.saturating_add(1);
        (next < self.total_chunks).then_some(next)
    }
}

/// Response body of a chunk call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkOutcome {
    /// Items enriched by this call.
    pub processed: usize,
    /// Chunk to request next, `null` when the job is done.
    pub next_chunk: Option<usize>,
}

/// Parses the `chunk` query parameter.
pub fn parse_chunk_index(raw: Option<&str>) -> Result<usize, ChunkRequestError> {
    let raw = raw.map(str::trim).ok_or(ChunkRequestError::Missing)?;
    if raw.is_empty() {
        return Err(ChunkRequestError::Missing);
    }
    match raw.parse::<i64>() {
        Ok(value) if value < 0 => Err(ChunkRequestError::Negative(value)),
        Ok(value) => {
            usize::try_from(value).map_err(|_| ChunkRequestError::NotANumber(raw.to_string()))
        }
        Err(_) => Err(ChunkRequestError::NotANumber(raw.to_string())),
    }
}

/// Processes exactly one chunk per call and appends its records to the sink.
pub struct ChunkCursor<'a> {
    enricher: &'a dyn Enrich,
    source: &'a dyn Source,
    sink: &'a dyn Sink,
    chunk_size: usize,
    item_delay: Duration,
}

impl<'a> ChunkCursor<'a> {
    /// Creates a cursor over the given collaborators.
    pub fn new(
        enricher: &'a dyn Enrich,
        source: &'a dyn Source,
        sink: &'a dyn Sink,
        chunk_size: usize,
        item_delay: Duration,
    ) -> Self {
        Self {
            enricher,
            source,
            sink,
            chunk_size: chunk_size.max(1),
            item_delay,
        }
    }

    /// Handles one call for `chunk_index` of `dataset`.
    ///
    /// A chunk past the end answers `{0, null}` without touching the sink. A chunk whose records
    /// the sink already holds is acknowledged with `processed = 0` and not enriched again. A chunk
    /// that starts past the stored records is rejected, since its records would land out of place.
    pub async fn handle(
        &self,
        dataset: &str,
        chunk_index: usize,
    ) -> Result<ChunkOutcome, PipelineError> {
        let items = self.source.load_items(dataset).await?;
        let chunk = ChunkDescriptor::compute(items.len(), self.chunk_size, chunk_index);
        if chunk.is_past_end() {
            return Ok(ChunkOutcome {
                processed: 0,
                next_chunk: None,
            });
        }
        let next_chunk = chunk.next_chunk();

        let stored = self.sink.count(dataset).await?;
        if stored >= chunk.end {
            tracing::info!(dataset, chunk = chunk_index, stored, "chunk already stored, skipping");
            return Ok(ChunkOutcome {
                processed: 0,
                next_chunk,
            });
        }
        if stored < chunk.start {
            return Err(PipelineError::ChunkOutOfOrder {
                chunk: chunk_index,
                start: chunk.start,
                stored,
            });
        }
        if stored > chunk.start {
            self.sink.truncate(dataset, chunk.start).await?;
        }

        let records = enrich_paced(self.enricher, &items[chunk.start..chunk.end], self.item_delay).await;
        self.sink.append_results(dataset, &records).await?;
        println!(
            "[{dataset}] chunk {}/{} items {}..{} done",
            chunk_index + 1,
            chunk.total_chunks,
            chunk.start,
            chunk.end
        );
        Ok(ChunkOutcome {
            processed: records.len(),
            next_chunk,
        })
    }
}
