// rust/service-core/src/storage/local.rs

//! Local filesystem storage backend.
//!
//! Small files are read through a buffered reader, large ones are
//! memory-mapped.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::traits::{StorageBackend, StorageReader, StorageWriter};
use crate::error::{Result, ServiceError};

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_MMAP_THRESHOLD: u64 = 1024 * 1024;

/// Local filesystem storage backend rooted at a base directory.
pub struct LocalStorage {
    base_path: PathBuf,
    buffer_size: usize,
    // File size at or above which reads are memory-mapped.
    mmap_threshold: u64,
}

impl LocalStorage {
    /// Creates a new `LocalStorage`, creating `base_path` if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the base path cannot be created.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();

        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                ServiceError::storage_with_source(&base_path, "failed to create base directory", e)
            })?;
        }

        Ok(Self {
            base_path,
            buffer_size: DEFAULT_BUFFER_SIZE,
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
        })
    }

    #[must_use]
    pub fn with_mmap_threshold(mut self, threshold: u64) -> Self {
        self.mmap_threshold = threshold;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    ServiceError::storage_with_source(
                        parent,
                        "failed to create parent directories",
                        e,
                    )
                })?;
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalStorage {
    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let full_path = self.resolve_path(path);
        let file = File::open(&full_path)
            .map_err(|e| ServiceError::storage_with_source(&full_path, "failed to open file", e))?;

        let size = file
            .metadata()
            .map_err(|e| {
                ServiceError::storage_with_source(&full_path, "failed to read file metadata", e)
            })?
            .len();

        if size >= self.mmap_threshold {
            // SAFETY: The file is opened read-only and the Mmap lives as long
            // as the reader.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                ServiceError::storage_with_source(&full_path, "failed to memory-map file", e)
            })?;
            Ok(Box::new(MmapReader {
                mmap,
                position: 0,
                path: full_path,
            }))
        } else {
            Ok(Box::new(LocalReader {
                reader: BufReader::with_capacity(self.buffer_size, file),
                size,
                path: full_path,
            }))
        }
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let full_path = self.resolve_path(path);
        Self::ensure_parent(&full_path)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full_path)
            .map_err(|e| {
                ServiceError::storage_with_source(&full_path, "failed to create file", e)
            })?;

        Ok(Box::new(LocalWriter::new(file, full_path, self.buffer_size)))
    }

    fn open_append(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let full_path = self.resolve_path(path);
        Self::ensure_parent(&full_path)?;

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&full_path)
            .map_err(|e| {
                ServiceError::storage_with_source(&full_path, "failed to open file for append", e)
            })?;

        Ok(Box::new(LocalWriter::new(file, full_path, self.buffer_size)))
    }

    fn list(&self, prefix: &Path) -> Result<Vec<String>> {
        let full_path = self.resolve_path(prefix);

        if !full_path.exists() {
            return Ok(Vec::new());
        }

        if !full_path.is_dir() {
            return Err(ServiceError::storage(&full_path, "path is not a directory"));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&full_path).map_err(|e| {
            ServiceError::storage_with_source(&full_path, "failed to read directory", e)
        })? {
            let entry = entry.map_err(|e| {
                ServiceError::storage_with_source(&full_path, "failed to read directory entry", e)
            })?;

            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }

        entries.sort();
        Ok(entries)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        Self::ensure_parent(&to_path)?;

        fs::rename(&from_path, &to_path).map_err(|e| {
            ServiceError::storage_with_source(
                &from_path,
                format!("failed to rename to {}", to_path.display()),
                e,
            )
        })
    }
}

struct LocalReader {
    reader: BufReader<File>,
    size: u64,
    path: PathBuf,
}

impl Read for LocalReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl StorageReader for LocalReader {
    fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size as usize);
        self.reader
            .read_to_end(&mut buf)
            .map_err(|e| ServiceError::storage_with_source(&self.path, "failed to read file", e))?;
        Ok(buf)
    }
}

struct MmapReader {
    mmap: Mmap,
    position: usize,
    path: PathBuf,
}

impl Read for MmapReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = &self.mmap[self.position.min(self.mmap.len())..];
        let to_read = buf.len().min(remaining.len());
        buf[..to_read].copy_from_slice(&remaining[..to_read]);
        self.position += to_read;
        Ok(to_read)
    }
}

impl StorageReader for MmapReader {
    fn read_all(&mut self) -> Result<Vec<u8>> {
        if self.position > self.mmap.len() {
            return Err(ServiceError::storage(
                &self.path,
                format!(
                    "read position {} exceeds file size {}",
                    self.position,
                    self.mmap.len()
                ),
            ));
        }
        let bytes = self.mmap[self.position..].to_vec();
        self.position = self.mmap.len();
        Ok(bytes)
    }
}

struct LocalWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl LocalWriter {
    fn new(file: File, path: PathBuf, buffer_size: usize) -> Self {
        Self {
            writer: BufWriter::with_capacity(buffer_size, file),
            path,
        }
    }
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl StorageWriter for LocalWriter {
    fn sync(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| {
            ServiceError::storage_with_source(&self.path, "failed to flush writer", e)
        })?;
        self.writer.get_ref().sync_data().map_err(|e| {
            ServiceError::storage_with_source(&self.path, "failed to sync file to disk", e)
        })
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer.flush().map_err(|e| {
            ServiceError::storage_with_source(&self.path, "failed to flush writer", e)
        })?;
        self.writer.get_ref().sync_all().map_err(|e| {
            ServiceError::storage_with_source(&self.path, "failed to sync file to disk", e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (LocalStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        // Low threshold so the mmap path is exercised
        let storage = LocalStorage::new(temp_dir.path())
            .unwrap()
            .with_mmap_threshold(1024);
        (storage, temp_dir)
    }

    #[test]
    fn test_new_creates_base_dir() {
        let temp_dir = TempDir::new().unwrap();
        let new_base = temp_dir.path().join("nested").join("datasets");

        let storage = LocalStorage::new(&new_base).unwrap();
        assert!(new_base.is_dir());
        assert_eq!(storage.base_path(), new_base.as_path());
    }

    #[test]
    fn test_write_and_read_small_file() {
        let (storage, _temp) = create_test_storage();
        let path = Path::new("small.bin");

        let mut writer = storage.open_write(path).unwrap();
        writer.write_all(b"hello").unwrap();
        writer.finish().unwrap();

        let mut reader = storage.open_read(path).unwrap();
        assert_eq!(reader.read_all().unwrap(), b"hello");
    }

    #[test]
    fn test_read_large_file_uses_mmap() {
        let (storage, _temp) = create_test_storage();
        let path = Path::new("large.bin");
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();

        let mut writer = storage.open_write(path).unwrap();
        writer.write_all(&data).unwrap();
        writer.finish().unwrap();

        let mut reader = storage.open_read(path).unwrap();
        assert_eq!(reader.read_all().unwrap(), data);
    }

    #[test]
    fn test_append_keeps_existing_bytes() {
        let (storage, _temp) = create_test_storage();
        let path = Path::new("log");

        let mut writer = storage.open_append(path).unwrap();
        writer.write_all(b"ab").unwrap();
        writer.sync().unwrap();
        writer.finish().unwrap();

        let mut writer = storage.open_append(path).unwrap();
        writer.write_all(b"cd").unwrap();
        writer.finish().unwrap();

        let mut reader = storage.open_read(path).unwrap();
        assert_eq!(reader.read_all().unwrap(), b"abcd");
    }

    #[test]
    fn test_open_missing_file_is_not_found() {
        let (storage, _temp) = create_test_storage();
        let err = storage.open_read(Path::new("missing")).err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_list_sorted_and_missing_dir_empty() {
        let (storage, _temp) = create_test_storage();
        assert!(storage.list(Path::new("nope")).unwrap().is_empty());

        for name in ["b", "c", "a"] {
            storage
                .open_write(&Path::new("dir").join(name))
                .unwrap()
                .finish()
                .unwrap();
        }
        assert_eq!(storage.list(Path::new("dir")).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_rename_replaces_destination() {
        let (storage, temp) = create_test_storage();
        let mut writer = storage.open_write(Path::new("tmp")).unwrap();
        writer.write_all(b"new").unwrap();
        writer.finish().unwrap();
        storage.open_write(Path::new("final")).unwrap().finish().unwrap();

        storage.rename(Path::new("tmp"), Path::new("final")).unwrap();
        assert!(!temp.path().join("tmp").exists());
        let mut reader = storage.open_read(Path::new("final")).unwrap();
        assert_eq!(reader.read_all().unwrap(), b"new");
    }
}
