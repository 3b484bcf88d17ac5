//! Durable journal for the offline mutation queue.
//!
//! Append-only file of framed records:
//!
//! ```text
//! ┌─────────────┬──────────────┬──────────────────────────┐
//! │ len: u32 LE │ fnv: u32 LE  │ LZ4(bincode(record))     │
//! └─────────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! The checksum covers the compressed payload. Recovery reads records
//! until the first frame that fails its length or checksum, treating
//! everything after it as a torn tail from a crash mid-append.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::offline::QueuedOp;

/// One journaled queue mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalRecord {
    /// An op was enqueued (coalescing is re-applied on recovery).
    Push(QueuedOp),
    /// The head op was removed after server ack.
    Shift,
    /// The whole queue was dropped.
    Clear,
}

/// Journal errors.
#[derive(Debug, Clone)]
pub enum JournalError {
    IoError(String),
    SerializationError(String),
}

impl std::fmt::Display for JournalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JournalError::IoError(e) => write!(f, "Journal I/O error: {e}"),
            JournalError::SerializationError(e) => write!(f, "Journal serialization error: {e}"),
        }
    }
}

impl std::error::Error for JournalError {}

impl From<std::io::Error> for JournalError {
    fn from(e: std::io::Error) -> Self {
        JournalError::IoError(e.to_string())
    }
}

/// FNV-1a folded over 4-byte words.
fn checksum(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for chunk in bytes.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        hash ^= u32::from_le_bytes(word);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Append-only queue journal.
pub struct QueueJournal {
    path: PathBuf,
    file: File,
}

impl QueueJournal {
    /// Open (or create) the journal at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    /// Append one record and flush it to the OS.
    pub fn append(&mut self, record: &JournalRecord) -> Result<(), JournalError> {
        let encoded = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| JournalError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut frame = Vec::with_capacity(8 + compressed.len());
        frame.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        frame.extend_from_slice(&checksum(&compressed).to_le_bytes());
        frame.extend_from_slice(&compressed);

        self.file.write_all(&frame)?;
        self.file.flush()?;
        Ok(())
    }

    /// Read every intact record in append order, plus a corrupt-record
    /// count.
    ///
    /// Framing is length-prefixed, so a bad frame makes every later
    /// boundary untrustworthy: recovery stops there and counts the
    /// remainder as one corrupt record. A torn tail from a crash
    /// mid-append is expected, not an error.
    pub fn recover(&mut self) -> (Vec<JournalRecord>, usize) {
        let mut bytes = Vec::new();
        match File::open(&self.path).and_then(|mut f| f.read_to_end(&mut bytes)) {
            Ok(_) => {}
            Err(e) => {
                log::warn!("Failed to read queue journal {}: {e}", self.path.display());
                return (Vec::new(), 0);
            }
        }

        let mut records = Vec::new();
        let mut corrupted = 0usize;
        let mut offset = 0usize;
        while offset + 8 <= bytes.len() {
            let mut len_buf = [0u8; 4];
            len_buf.copy_from_slice(&bytes[offset..offset + 4]);
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut sum_buf = [0u8; 4];
            sum_buf.copy_from_slice(&bytes[offset + 4..offset + 8]);
            let expected = u32::from_le_bytes(sum_buf);

            let start = offset + 8;
            let end = match start.checked_add(len) {
                Some(end) if end <= bytes.len() => end,
                _ => {
                    corrupted += 1;
                    break;
                }
            };
            let compressed = &bytes[start..end];
            if checksum(compressed) != expected {
                log::warn!("Queue journal checksum mismatch at offset {offset}, truncating");
                corrupted += 1;
                break;
            }

            let decompressed = match lz4_flex::decompress_size_prepended(compressed) {
                Ok(d) => d,
                Err(e) => {
                    log::warn!("Queue journal decompression failed at offset {offset}: {e}");
                    corrupted += 1;
                    break;
                }
            };
            match bincode::serde::decode_from_slice::<JournalRecord, _>(
                &decompressed,
                bincode::config::standard(),
            ) {
                Ok((record, _)) => records.push(record),
                Err(e) => {
                    log::warn!("Queue journal decode failed at offset {offset}: {e}");
                    corrupted += 1;
                    break;
                }
            }
            offset = end;
        }
        (records, corrupted)
    }

    /// Rewrite the journal to hold exactly `records`, dropping history.
    ///
    /// Called after mid-queue removals that the `Shift` vocabulary
    /// cannot express.
    pub fn compact(&mut self, records: &[JournalRecord]) -> Result<(), JournalError> {
        self.truncate()?;
        for record in records {
            self.append(record)?;
        }
        Ok(())
    }

    /// Truncate the journal file to empty.
    pub fn truncate(&mut self) -> Result<(), JournalError> {
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
