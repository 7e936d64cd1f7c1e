// rust/service-core/src/storage/dataset_store.rs

//! Key-value store for registered dataset definitions.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::debug;

use super::local::LocalStorage;
use super::traits::StorageBackend;
use crate::dataset::DatasetDef;
use crate::error::{Result, ServiceError};

/// Subdirectory of the dispatcher work dir holding dataset files.
pub const DATASETS_DIR: &str = "datasets";

/// Store key for a registered dataset.
pub fn dataset_key(dataset_id: i64, fingerprint: u64) -> String {
    format!("id_{dataset_id}_fp_{fingerprint}")
}

pub trait DatasetStore: Send + Sync {
    /// Stores `dataset` under `key`, replacing any previous value.
    fn put(&self, key: &str, dataset: &DatasetDef) -> Result<()>;

    /// # Errors
    ///
    /// Returns `NotFound` if nothing is stored under `key`.
    fn get(&self, key: &str) -> Result<Arc<DatasetDef>>;
}

/// Dataset store used when the dispatcher has no work dir.
#[derive(Debug, Default)]
pub struct MemoryDatasetStore {
    datasets: RwLock<HashMap<String, Arc<DatasetDef>>>,
}

impl MemoryDatasetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DatasetStore for MemoryDatasetStore {
    fn put(&self, key: &str, dataset: &DatasetDef) -> Result<()> {
        let mut datasets = self
            .datasets
            .write()
            .map_err(|_| ServiceError::internal("dataset store lock poisoned"))?;
        datasets.insert(key.to_string(), Arc::new(dataset.clone()));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Arc<DatasetDef>> {
        let datasets = self
            .datasets
            .read()
            .map_err(|_| ServiceError::internal("dataset store lock poisoned"))?;
        datasets
            .get(key)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("Dataset key {key} not found")))
    }
}

/// One bincode file per key under a directory. Writes go to a temporary file
/// that is renamed into place.
pub struct FileSystemDatasetStore {
    storage: LocalStorage,
}

impl FileSystemDatasetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            storage: LocalStorage::new(dir)?,
        })
    }

    /// Path of the file holding `key`, for workers that read datasets directly.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.storage.base_path().join(key)
    }

    pub fn dir(&self) -> &Path {
        self.storage.base_path()
    }
}

impl DatasetStore for FileSystemDatasetStore {
    fn put(&self, key: &str, dataset: &DatasetDef) -> Result<()> {
        let bytes = bincode::serialize(dataset)?;
        let temp = PathBuf::from(format!(".{key}.{}.tmp", uuid::Uuid::new_v4()));

        let mut writer = self.storage.open_write(&temp)?;
        writer.write_all(&bytes).map_err(|e| {
            ServiceError::storage_with_source(self.path_for(key), "failed to write dataset", e)
        })?;
        writer.finish()?;
        self.storage.rename(&temp, Path::new(key))?;

        debug!("Wrote dataset {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Arc<DatasetDef>> {
        read_dataset_file(&self.path_for(key)).map(Arc::new)
    }
}

/// Reads a dataset file written by `FileSystemDatasetStore`.
///
/// # Errors
///
/// Returns `NotFound` if the file doesn't exist.
pub fn read_dataset_file(path: &Path) -> Result<DatasetDef> {
    if !path.is_file() {
        return Err(ServiceError::not_found(format!(
            "Dataset file {} not found",
            path.display()
        )));
    }
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut reader = LocalStorage::new(parent)?.open_read(path)?;
    let bytes = reader.read_all()?;
    Ok(bincode::deserialize(&bytes)?)
}
