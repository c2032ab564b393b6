//! Input source and output sink collaborators, with JSONL file and in-memory backends.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::checkpoint::{remove_if_exists, write_atomic, Checkpoint, CheckpointStore};
use crate::error::StoreError;
use crate::record::{EnrichedRecord, WorkItem};

/// Read-only access to the input rows of a dataset.
#[async_trait]
pub trait Source: Send + Sync {
    /// Loads the full input list for `dataset`.
    async fn load_items(&self, dataset: &str) -> Result<Vec<WorkItem>, StoreError>;
}

/// Append-only destination for enriched rows.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Durably appends `records` after the ones already stored.
    async fn append_results(
        &self,
        dataset: &str,
        records: &[EnrichedRecord],
    ) -> Result<(), StoreError>;

    /// Loads every stored record, or `None` if nothing was ever written.
    async fn load_partial(&self, dataset: &str) -> Result<Option<Vec<EnrichedRecord>>, StoreError>;

    /// Keeps only the first `len` stored records.
    async fn truncate(&self, dataset: &str, len: usize) -> Result<(), StoreError>;

    /// Number of stored records.
    async fn count(&self, dataset: &str) -> Result<usize, StoreError> {
        Ok(self
            .load_partial(dataset)
            .await?
            .map_or(0, |records| records.len()))
    }
}

/// File-backed store: `<root>/<dataset>.jsonl` holds input rows and
/// `<root>/<dataset>.enriched.jsonl` holds output rows, one JSON object per line.
///
/// An output file whose last line is unterminated and does not parse was cut short by a crash
/// mid-append. That line counts as not written, and the next append or truncate drops it.
#[derive(Debug, Clone)]
pub struct JsonlStore {
    root: PathBuf,
}

impl JsonlStore {
    /// Stores datasets under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the dataset files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Input file for `dataset`.
    pub fn input_path(&self, dataset: &str) -> PathBuf {
        self.root.join(format!("{dataset}.jsonl"))
    }

    /// Output file for `dataset`.
    pub fn output_path(&self, dataset: &str) -> PathBuf {
        self.root.join(format!("{dataset}.enriched.jsonl"))
    }

    /// Replaces the input rows of `dataset`.
    pub async fn write_items(&self, dataset: &str, items: &[WorkItem]) -> Result<(), StoreError> {
        write_atomic(&self.input_path(dataset), &encode_lines(items)?).await
    }

    /// Deletes the input and output files of `dataset`.
    pub async fn remove(&self, dataset: &str) -> Result<(), StoreError> {
        remove_if_exists(&self.input_path(dataset)).await?;
        remove_if_exists(&self.output_path(dataset)).await
    }
}

fn encode_lines<T: Serialize>(rows: &[T]) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut buf, row)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

struct Lines<T> {
    rows: Vec<T>,
    unterminated: bool,
}

async fn read_lines<T: DeserializeOwned>(
    path: &Path,
    tolerate_torn_tail: bool,
) -> Result<Option<Lines<T>>, StoreError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    let unterminated = !text.is_empty() && !text.ends_with('\n');
    let last_line = text.lines().count();
    let mut rows = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(row) => rows.push(row),
            Err(source) if tolerate_torn_tail && unterminated && line_no + 1 == last_line => {
                tracing::warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %source,
                    "ignoring torn last line"
                );
            }
            Err(source) => {
                return Err(StoreError::Decode {
                    path: path.to_path_buf(),
                    line: line_no + 1,
                    source,
                })
            }
        }
    }
    Ok(Some(Lines { rows, unterminated }))
}

/// Rewrites the output file with at most `len` records, dropping an unterminated tail.
async fn rewrite_prefix(path: &Path, len: usize) -> Result<(), StoreError> {
    let Some(Lines {
        mut rows,
        unterminated,
    }) = read_lines::<EnrichedRecord>(path, true).await?
    else {
        return Ok(());
    };
    if !unterminated && rows.len() <= len {
        return Ok(());
    }
    rows.truncate(len);
    write_atomic(path, &encode_lines(&rows)?).await
}

async fn ends_unterminated(path: &Path) -> Result<bool, StoreError> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    let len = file
        .metadata()
        .await
        .map_err(|err| StoreError::io(path, err))?
        .len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))
        .await
        .map_err(|err| StoreError::io(path, err))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)
        .await
        .map_err(|err| StoreError::io(path, err))?;
    Ok(last[0] != b'\n')
}

#[async_trait]
impl Source for JsonlStore {
    async fn load_items(&self, dataset: &str) -> Result<Vec<WorkItem>, StoreError> {
        read_lines(&self.input_path(dataset), false)
            .await?
            .map(|lines| lines.rows)
            .ok_or_else(|| StoreError::MissingDataset(dataset.to_string()))
    }
}

#[async_trait]
impl Sink for JsonlStore {
    async fn append_results(
        &self,
        dataset: &str,
        records: &[EnrichedRecord],
    ) -> Result<(), StoreError> {
        let path = self.output_path(dataset);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StoreError::io(parent, err))?;
        }
        if ends_unterminated(&path).await? {
            tracing::warn!(path = %path.display(), "repairing unterminated output before append");
            rewrite_prefix(&path, usize::MAX).await?;
        }
        let bytes = encode_lines(records)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| StoreError::io(&path, err))?;
        file.write_all(&bytes)
            .await
            .map_err(|err| StoreError::io(&path, err))?;
        file.sync_data()
            .await
            .map_err(|err| StoreError::io(&path, err))
    }

    async fn load_partial(&self, dataset: &str) -> Result<Option<Vec<EnrichedRecord>>, StoreError> {
        Ok(read_lines(&self.output_path(dataset), true)
            .await?
            .map(|lines| lines.rows))
    }

    async fn truncate(&self, dataset: &str, len: usize) -> Result<(), StoreError> {
        let path = self.output_path(dataset);
        if len == 0 {
            return remove_if_exists(&path).await;
        }
        rewrite_prefix(&path, len).await
    }
}

/// Process-local store implementing every collaborator; state is lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, Vec<WorkItem>>>,
    results: Mutex<HashMap<String, Vec<EnrichedRecord>>>,
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers input rows for `dataset`.
    pub async fn insert_items(&self, dataset: &str, items: Vec<WorkItem>) {
        self.items.lock().await.insert(dataset.to_string(), items);
    }
}

#[async_trait]
impl Source for MemoryStore {
    async fn load_items(&self, dataset: &str) -> Result<Vec<WorkItem>, StoreError> {
        self.items
            .lock()
            .await
            .get(dataset)
            .cloned()
            .ok_or_else(|| StoreError::MissingDataset(dataset.to_string()))
    }
}

#[async_trait]
impl Sink for MemoryStore {
    async fn append_results(
        &self,
        dataset: &str,
        records: &[EnrichedRecord],
    ) -> Result<(), StoreError> {
        self.results
            .lock()
            .await
            .entry(dataset.to_string())
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }

    async fn load_partial(&self, dataset: &str) -> Result<Option<Vec<EnrichedRecord>>, StoreError> {
        Ok(self.results.lock().await.get(dataset).cloned())
    }

    async fn truncate(&self, dataset: &str, len: usize) -> Result<(), StoreError> {
        if let Some(records) = self.results.lock().await.get_mut(dataset) {
            records.truncate(len);
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn save(&self, dataset: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.checkpoints
            .lock()
            .await
            .insert(dataset.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, dataset: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.checkpoints.lock().await.get(dataset).cloned())
    }

    async fn clear(&self, dataset: &str) -> Result<(), StoreError> {
        self.checkpoints.lock().await.remove(dataset);
        Ok(())
    }
}
