// rust/service-core/src/storage/traits.rs

//! Storage abstraction used by the journal and the dataset store.

use std::io::{Read, Write};
use std::path::Path;

use crate::error::Result;

/// A handle for reading a whole object from storage.
pub trait StorageReader: Read + Send {
    /// Reads the remaining bytes of the object.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails.
    fn read_all(&mut self) -> Result<Vec<u8>>;
}

/// A handle for writing to storage.
pub trait StorageWriter: Write + Send {
    /// Flushes buffered bytes and makes them durable without closing the writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or the sync to disk fails.
    fn sync(&mut self) -> Result<()>;

    /// Finishes the write operation, ensuring all data is persisted.
    ///
    /// After calling `finish`, the writer should not be used again.
    ///
    /// # Errors
    ///
    /// Returns an error if the finalization fails (e.g. flush fails).
    fn finish(self: Box<Self>) -> Result<()>;
}

/// The core storage backend trait.
///
/// Paths are resolved relative to the backend's base directory.
pub trait StorageBackend: Send + Sync {
    /// Opens an object for reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the object doesn't exist or cannot be opened.
    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>>;

    /// Opens an object for writing, truncating it if it exists.
    /// Parent directories are created if they don't exist.
    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    /// Opens an object for appending, creating it if needed.
    fn open_append(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    /// Lists the entry names directly under `prefix`, sorted lexically.
    ///
    /// A missing directory lists as empty.
    fn list(&self, prefix: &Path) -> Result<Vec<String>>;

    /// Renames an object, replacing any object at the destination.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
}
