//! Error types shared by the pipeline stages.

use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by the durable collaborators (input source, output sink, checkpoint store).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem access failed.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        /// File or directory being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A stored JSON document or JSONL line could not be decoded.
    #[error("invalid JSON in {path:?} at line {line}: {source}")]
    Decode {
        /// File being decoded.
        path: PathBuf,
        /// One-based line number (1 for whole-file documents).
        line: usize,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// A record could not be serialized for persistence.
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    /// The requested dataset has no input.
    #[error("dataset {0} not found")]
    MissingDataset(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Fatal errors that stop a batch run, a parallel orchestration, or a chunk call.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Output, checkpoint or input persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A requested start index would skip records that were never written.
    #[error("start index {start} is beyond the {written} records already written")]
    InvalidStart {
        /// Requested start index.
        start: usize,
        /// Records present in the output.
        written: usize,
    },

    /// A shard worker process could not be started.
    #[error("failed to launch worker for shard {shard}: {source}")]
    Spawn {
        /// Shard index.
        shard: usize,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A shard worker exited unsuccessfully.
    #[error("worker for shard {shard} failed: {reason}")]
    WorkerFailed {
        /// Shard index.
        shard: usize,
        /// Exit status or error description.
        reason: String,
    },

    /// A worker reported success but its output does not cover its shard.
    #[error("shard {shard} produced {found} records, expected {expected}")]
    IncompleteShard {
        /// Shard index.
        shard: usize,
        /// Records found in the shard output.
        found: usize,
        /// Shard length.
        expected: usize,
    },

    /// A chunk was requested before the chunks preceding it were stored.
    #[error("chunk {chunk} starts at item {start} but only {stored} records are stored")]
    ChunkOutOfOrder {
        /// Requested chunk.
        chunk: usize,
        /// First item of the chunk.
        start: usize,
        /// Records present in the output.
        stored: usize,
    },
}

/// Rejections for malformed chunk-cursor requests, raised before any processing starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkRequestError {
    /// No `chunk` parameter was supplied.
    #[error("missing chunk parameter")]
    Missing,

    /// The parameter is not an integer.
    #[error("chunk must be a non-negative integer, got {0:?}")]
    NotANumber(String),

    /// The parameter is a negative integer.
    #[error("chunk must be non-negative, got {0}")]
    Negative(i64),
}

/// Invalid configuration values detected while building [`crate::controls::EnrichControls`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A lookup method is not a valid HTTP method.
    #[error("invalid HTTP method {method:?} for the {lookup} lookup")]
    InvalidMethod {
        /// Lookup being configured.
        lookup: &'static str,
        /// Rejected value.
        method: String,
    },

    /// A lookup body template is not valid JSON.
    #[error("body template for the {lookup} lookup is not valid JSON: {source}")]
    InvalidBody {
        /// Lookup being configured.
        lookup: &'static str,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A lookup URL template does not parse once placeholders are filled.
    #[error("URL template for the {lookup} lookup is invalid: {source}")]
    InvalidUrl {
        /// Lookup being configured.
        lookup: &'static str,
        /// Underlying parse error.
        #[source]
        source: url::ParseError,
    },
}
