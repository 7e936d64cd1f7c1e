// rust/service-core/src/journal/reader.rs

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use super::{checksum, journal_dir, segment_index, RECORD_HEADER_LEN};
use crate::error::{Result, ServiceError};
use crate::storage::{LocalStorage, StorageBackend};

/// Reads journal records in the order they were written.
pub struct JournalReader {
    dir: PathBuf,
    state: Option<ReadState>,
}

struct ReadState {
    segments: Vec<String>,
    // Index into `segments` of the loaded segment.
    current: usize,
    buffer: Vec<u8>,
    offset: usize,
}

impl JournalReader {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            dir: journal_dir(work_dir),
            state: None,
        }
    }

    /// Returns the next record, or `None` once every segment is consumed.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no journal exists. A truncated or corrupt record
    /// is `Internal`.
    pub fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        if self.state.is_none() {
            self.state = Some(self.open()?);
        }
        let dir = &self.dir;
        let Some(state) = self.state.as_mut() else {
            return Ok(None);
        };

        loop {
            if state.offset < state.buffer.len() {
                let segment = &state.segments[state.current - 1];
                let payload = next_record(&state.buffer, &mut state.offset)
                    .map_err(|message| {
                        ServiceError::internal(format!(
                            "journal segment {} is corrupt: {message}",
                            dir.join(segment).display()
                        ))
                    })?;
                let record = bincode::deserialize(payload)?;
                return Ok(Some(record));
            }
            if state.current >= state.segments.len() {
                return Ok(None);
            }
            let storage = LocalStorage::new(dir)?;
            let name = &state.segments[state.current];
            state.buffer = storage.open_read(Path::new(name))?.read_all()?;
            state.offset = 0;
            state.current += 1;
        }
    }

    fn open(&self) -> Result<ReadState> {
        if !self.dir.is_dir() {
            return Err(ServiceError::not_found(format!(
                "No journal found at {}",
                self.dir.display()
            )));
        }
        let storage = LocalStorage::new(&self.dir)?;
        let segments: Vec<String> = storage
            .list(Path::new(""))?
            .into_iter()
            .filter(|name| segment_index(name).is_some())
            .collect();
        if segments.is_empty() {
            return Err(ServiceError::not_found(format!(
                "No journal segments in {}",
                self.dir.display()
            )));
        }
        Ok(ReadState {
            segments,
            current: 0,
            buffer: Vec::new(),
            offset: 0,
        })
    }
}

fn next_record<'a>(buffer: &'a [u8], offset: &mut usize) -> std::result::Result<&'a [u8], String> {
    let header_end = *offset + RECORD_HEADER_LEN;
    let Some(header) = buffer.get(*offset..header_end) else {
        return Err(format!("truncated record header at offset {offset}"));
    };
    let (len_bytes, sum_bytes) = header.split_at(4);
    let len = u32::from_le_bytes(len_bytes.try_into().map_err(|_| "bad length field")?) as usize;
    let expected = u64::from_le_bytes(sum_bytes.try_into().map_err(|_| "bad checksum field")?);

    let Some(payload) = buffer.get(header_end..header_end + len) else {
        return Err(format!(
            "truncated record at offset {offset}: expected {len} payload bytes"
        ));
    };
    if checksum(payload) != expected {
        return Err(format!("checksum mismatch for record at offset {offset}"));
    }
    *offset = header_end + len;
    Ok(payload)
}
