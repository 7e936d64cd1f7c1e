// rust/service-core/src/storage/mod.rs

//! Storage used by the dispatcher's persistent state.
//!
//! `LocalStorage` implements the `StorageBackend` trait over a directory. The
//! journal appends to segment files through it and the filesystem dataset
//! store writes one file per dataset.

mod dataset_store;
mod local;
mod traits;

pub use dataset_store::{
    dataset_key, read_dataset_file, DatasetStore, FileSystemDatasetStore, MemoryDatasetStore,
    DATASETS_DIR,
};
pub use local::LocalStorage;
pub use traits::{StorageBackend, StorageReader, StorageWriter};

use tokio::runtime::{Handle, RuntimeFlavor};

/// Runs blocking storage work from async code.
///
/// On a multi-threaded runtime the current worker thread is handed off to
/// the blocking pool first, so other tasks keep running. On a current-thread
/// runtime, or outside any runtime, `f` runs inline.
pub fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
