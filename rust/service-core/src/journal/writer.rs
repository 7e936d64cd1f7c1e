// rust/service-core/src/journal/writer.rs

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use super::{checksum, journal_dir, segment_index, segment_name};
use crate::error::{Result, ServiceError};
use crate::storage::{LocalStorage, StorageBackend, StorageWriter};

/// Appends records to a new journal segment.
///
/// Each `write` is flushed and synced before it returns. After a failed
/// write the segment may end in a torn record, so every later write is
/// refused.
pub struct JournalWriter {
    dir: PathBuf,
    segment: Option<Box<dyn StorageWriter>>,
    failed: bool,
}

impl JournalWriter {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            dir: journal_dir(work_dir),
            segment: None,
            failed: false,
        }
    }

    /// Creates this session's segment, numbered after any existing ones.
    ///
    /// Calling it again is a no-op.
    pub fn ensure_initialized(&mut self) -> Result<()> {
        if self.segment.is_some() {
            return Ok(());
        }
        let storage = LocalStorage::new(&self.dir)?;
        let next = storage
            .list(Path::new(""))?
            .iter()
            .filter_map(|name| segment_index(name))
            .max()
            .map_or(0, |max| max + 1);

        let name = segment_name(next);
        let mut segment = storage.open_append(Path::new(&name))?;
        segment.sync()?;
        info!("Opened journal segment {}", self.dir.join(&name).display());
        self.segment = Some(segment);
        Ok(())
    }

    /// Appends one record and makes it durable.
    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<()> {
        if self.failed {
            return Err(ServiceError::internal(format!(
                "journal in {} is unusable after a failed write",
                self.dir.display()
            )));
        }
        let result = self.append(record);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn append<T: Serialize>(&mut self, record: &T) -> Result<()> {
        self.ensure_initialized()?;
        let payload = bincode::serialize(record)?;
        let len = u32::try_from(payload.len()).map_err(|_| {
            ServiceError::internal(format!(
                "journal record of {} bytes is too large",
                payload.len()
            ))
        })?;

        let mut frame = Vec::with_capacity(super::RECORD_HEADER_LEN + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&checksum(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        let dir = &self.dir;
        let segment = self
            .segment
            .as_mut()
            .ok_or_else(|| ServiceError::internal("journal segment not open"))?;
        segment.write_all(&frame).map_err(|e| {
            ServiceError::storage_with_source(dir, "failed to append journal record", e)
        })?;
        segment.sync()?;

        debug!("Journaled {} byte record", payload.len());
        Ok(())
    }
}
