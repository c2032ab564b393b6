//! Durable progress markers for resumable runs.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// How far a run has progressed. `last_completed_index` counts items whose records are
/// already durable in the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Items completed and written, counted from the start of the input.
    pub last_completed_index: usize,
    /// Input length the checkpoint was taken against.
    pub total_items: usize,
    /// Wall-clock time of the save, in epoch milliseconds.
    pub saved_at_epoch_ms: u64,
}

impl Checkpoint {
    /// Stamps a checkpoint with the current time.
    pub fn new(last_completed_index: usize, total_items: usize) -> Self {
        Self {
            last_completed_index,
            total_items,
            saved_at_epoch_ms: now_epoch_ms(),
        }
    }

    /// Whether every item has been processed.
    pub fn is_complete(&self) -> bool {
        self.last_completed_index >= self.total_items
    }

    /// Completion percentage.
    pub fn percent(&self) -> f64 {
        if self.total_items == 0 {
            return 100.0;
        }
        self.last_completed_index as f64 * 100.0 / self.total_items as f64
    }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Small durable key-value store for checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persists `checkpoint` for `dataset`, replacing any previous one.
    async fn save(&self, dataset: &str, checkpoint: &Checkpoint) -> Result<(), StoreError>;
    /// Loads the checkpoint for `dataset`, if one was saved.
    async fn load(&self, dataset: &str) -> Result<Option<Checkpoint>, StoreError>;
    /// Forgets the checkpoint for `dataset`.
    async fn clear(&self, dataset: &str) -> Result<(), StoreError>;
}

/// Keeps one `<dataset>.checkpoint.json` per dataset in a directory. Saves write a temporary
/// file and rename it over the old one, so a crash leaves either the old or the new checkpoint.
#[derive(Debug, Clone)]
pub struct JsonCheckpointStore {
    dir: PathBuf,
}

impl JsonCheckpointStore {
    /// Stores checkpoints under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the checkpoint file for `dataset`.
    pub fn path_for(&self, dataset: &str) -> PathBuf {
        self.dir.join(format!("{dataset}.checkpoint.json"))
    }
}

#[async_trait]
impl CheckpointStore for JsonCheckpointStore {
    async fn save(&self, dataset: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let path = self.path_for(dataset);
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        write_atomic(&path, &bytes).await
    }

    async fn load(&self, dataset: &str) -> Result<Option<Checkpoint>, StoreError> {
        let path = self.path_for(dataset);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                path,
                line: 1,
                source,
            })
    }

    async fn clear(&self, dataset: &str) -> Result<(), StoreError> {
        remove_if_exists(&self.path_for(dataset)).await
    }
}

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| StoreError::io(parent, err))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|err| StoreError::io(&tmp, err))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|err| StoreError::io(path, err))
}

pub(crate) async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saves_loads_and_clears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonCheckpointStore::new(dir.path().join("nested"));

        assert_eq!(store.load("wallets").await.expect("load"), None);

        let checkpoint = Checkpoint::new(50, 237);
        store.save("wallets", &checkpoint).await.expect("save");
        let loaded = store.load("wallets").await.expect("load").expect("present");
        assert_eq!(loaded, checkpoint);
        assert!(!loaded.is_complete());

        store
            .save("wallets", &Checkpoint::new(237, 237))
            .await
            .expect("overwrite");
        let loaded = store.load("wallets").await.expect("load").expect("present");
        assert!(loaded.is_complete());
        assert!(!store.path_for("wallets").with_extension("json.tmp").exists());

        store.clear("wallets").await.expect("clear");
        store.clear("wallets").await.expect("clear is idempotent");
        assert_eq!(store.load("wallets").await.expect("load"), None);
    }

    #[tokio::test]
    async fn corrupt_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonCheckpointStore::new(dir.path());
        std::fs::write(store.path_for("broken"), b"{not json").expect("write");
        assert!(matches!(
            store.load("broken").await,
            Err(StoreError::Decode { .. })
        ));
    }

    #[test]
    fn percent_handles_empty_input() {
        assert_eq!(Checkpoint::new(0, 0).percent(), 100.0);
        assert_eq!(Checkpoint::new(25, 100).percent(), 25.0);
    }
}
