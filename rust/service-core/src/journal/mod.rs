// rust/service-core/src/journal/mod.rs

//! Append-only journal of dispatcher state updates.
//!
//! The journal is a directory of segment files read in lexical order. Each
//! writer session appends to a fresh segment. Records are framed as:
//!
//! ```text
//! +----------------+--------------------+------------------+
//! | len: u32 (LE)  | xxhash64: u64 (LE) | bincode payload  |
//! +----------------+--------------------+------------------+
//! ```

mod reader;
mod writer;

use std::hash::Hasher;
use std::path::{Path, PathBuf};

use twox_hash::XxHash64;

pub use reader::JournalReader;
pub use writer::JournalWriter;

/// Journal subdirectory of the dispatcher work dir.
pub const JOURNAL_DIR: &str = "tf_data_dispatcher_journal";

const SEGMENT_PREFIX: &str = "journal_";
const RECORD_HEADER_LEN: usize = 4 + 8;

pub fn journal_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(JOURNAL_DIR)
}

fn segment_name(index: u64) -> String {
    format!("{SEGMENT_PREFIX}{index:010}")
}

fn segment_index(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?.parse().ok()
}

fn checksum(payload: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(payload);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde::{Deserialize, Serialize};
    use std::io::Write;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Entry {
        Add(i64),
        Name(String),
    }

    #[test]
    fn test_segment_names_sort_lexically() {
        assert_eq!(segment_name(3), "journal_0000000003");
        assert!(segment_name(9) < segment_name(10));
        assert_eq!(segment_index("journal_0000000010"), Some(10));
        assert_eq!(segment_index("other"), None);
    }

    #[test]
    fn test_missing_journal_is_not_found() {
        let temp = TempDir::new().unwrap();
        let mut reader = JournalReader::new(temp.path());
        let err = reader.read::<Entry>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_write_then_read_in_order() {
        let temp = TempDir::new().unwrap();
        let entries = vec![
            Entry::Add(1),
            Entry::Name("a".to_string()),
            Entry::Add(-5),
        ];

        let mut writer = JournalWriter::new(temp.path());
        for entry in &entries {
            writer.write(entry).unwrap();
        }
        drop(writer);

        let mut reader = JournalReader::new(temp.path());
        let mut read = Vec::new();
        while let Some(entry) = reader.read::<Entry>().unwrap() {
            read.push(entry);
        }
        assert_eq!(read, entries);
        // Stays at EOF
        assert!(reader.read::<Entry>().unwrap().is_none());
    }

    #[test]
    fn test_sessions_append_new_segments() {
        let temp = TempDir::new().unwrap();

        let mut first = JournalWriter::new(temp.path());
        first.write(&Entry::Add(1)).unwrap();
        drop(first);

        let mut second = JournalWriter::new(temp.path());
        second.ensure_initialized().unwrap();
        second.write(&Entry::Add(2)).unwrap();
        drop(second);

        let segments: Vec<String> = std::fs::read_dir(journal_dir(temp.path()))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(segments.len(), 2);

        let mut reader = JournalReader::new(temp.path());
        assert_eq!(reader.read::<Entry>().unwrap(), Some(Entry::Add(1)));
        assert_eq!(reader.read::<Entry>().unwrap(), Some(Entry::Add(2)));
        assert_eq!(reader.read::<Entry>().unwrap(), None);
    }

    #[test]
    fn test_empty_session_reads_as_empty_journal() {
        let temp = TempDir::new().unwrap();
        JournalWriter::new(temp.path()).ensure_initialized().unwrap();

        let mut reader = JournalReader::new(temp.path());
        assert_eq!(reader.read::<Entry>().unwrap(), None);
    }

    #[test]
    fn test_truncated_tail_is_an_error() {
        let temp = TempDir::new().unwrap();
        let mut writer = JournalWriter::new(temp.path());
        writer.write(&Entry::Add(1)).unwrap();
        writer.write(&Entry::Add(2)).unwrap();
        drop(writer);

        let segment = journal_dir(temp.path()).join(segment_name(0));
        let len = std::fs::metadata(&segment).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&segment).unwrap();
        file.set_len(len - 3).unwrap();

        let mut reader = JournalReader::new(temp.path());
        assert_eq!(reader.read::<Entry>().unwrap(), Some(Entry::Add(1)));
        let err = reader.read::<Entry>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let temp = TempDir::new().unwrap();
        let mut writer = JournalWriter::new(temp.path());
        writer.write(&Entry::Name("payload".to_string())).unwrap();
        drop(writer);

        let segment = journal_dir(temp.path()).join(segment_name(0));
        let mut bytes = std::fs::read(&segment).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::File::create(&segment)
            .unwrap()
            .write_all(&bytes)
            .unwrap();

        let mut reader = JournalReader::new(temp.path());
        let err = reader.read::<Entry>().unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_writer_refuses_writes_after_failure() {
        let temp = TempDir::new().unwrap();
        // A plain file where the journal directory should be created
        let blocker = temp.path().join("work");
        std::fs::write(&blocker, b"").unwrap();

        let mut writer = JournalWriter::new(&blocker);
        assert!(writer.write(&Entry::Add(1)).is_err());

        std::fs::remove_file(&blocker).unwrap();
        let err = writer.write(&Entry::Add(2)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(err.to_string().contains("unusable"));
        assert!(!journal_dir(&blocker).exists());
    }
}
