//! Persistent storage for harvested log records.
//!
//! Records are appended to a row-structured log file shared by every
//! session for the life of the process. The file gets a header row the
//! first time anything is written to it while empty.
//!
//! Layout:
//!   - Row 0 (written once): `OK,Unit,RSSI,TX Power,Start Time,Seconds Duration`
//!   - One row per harvested record, in harvest order per session.
//!   - A session's rows are written as one batch under the store lock, so
//!     batches from different sessions never interleave.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::ble::BdAddr;
use crate::config::LOG_FILE_HEADER;
use crate::error::StoreError;
use crate::proto::HarvestedRecord;

/// Append-only row store.
pub trait LogStore {
    /// True if nothing (not even a header) has been written yet.
    fn is_empty(&mut self) -> Result<bool, StoreError>;

    /// Append `lines` as one write. Each line is a complete row without
    /// terminator.
    fn append(&mut self, lines: &[String]) -> Result<(), StoreError>;
}

/// Log file on disk. Created on first append.
#[derive(Debug, Clone)]
pub struct CsvFileStore {
    path: PathBuf,
}

impl CsvFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> std::io::Result<File> {
        OpenOptions::new().create(true).append(true).open(&self.path)
    }
}

impl LogStore for CsvFileStore {
    fn is_empty(&mut self) -> Result<bool, StoreError> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len() == 0),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(err) => Err(err.into()),
        }
    }

    fn append(&mut self, lines: &[String]) -> Result<(), StoreError> {
        let mut batch = String::new();
        for line in lines {
            batch.push_str(line);
            batch.push_str("\r\n");
        }
        let mut file = self.open()?;
        file.write_all(batch.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

/// In-memory store for dry runs and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryLogStore {
    pub lines: Vec<String>,
}

impl LogStore for MemoryLogStore {
    fn is_empty(&mut self) -> Result<bool, StoreError> {
        Ok(self.lines.is_empty())
    }

    fn append(&mut self, lines: &[String]) -> Result<(), StoreError> {
        self.lines.extend_from_slice(lines);
        Ok(())
    }
}

/// Header row as written to the store.
pub fn header_row() -> String {
    LOG_FILE_HEADER.join(",")
}

/// Serialises close-time writes from every session into one store.
///
/// Cloning shares the underlying store.
pub struct LogSink<S: LogStore> {
    store: Arc<Mutex<S>>,
}

impl<S: LogStore> Clone for LogSink<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LogStore> LogSink<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// Append one session's records. Returns the number of record rows
    /// written (header excluded). Does nothing for an empty batch.
    pub fn flush(&self, peer: BdAddr, records: &[HarvestedRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            debug!(%peer, "nothing harvested, skipping flush");
            return Ok(0);
        }

        let mut store = self.store.lock().map_err(|_| StoreError::Poisoned)?;

        let mut lines = Vec::with_capacity(records.len() + 1);
        if store.is_empty()? {
            lines.push(header_row());
        }
        lines.extend(records.iter().map(HarvestedRecord::to_row));
        store.append(&lines)?;

        info!(%peer, rows = records.len(), "harvested records written");
        Ok(records.len())
    }

    /// Run `f` against the store while holding the lock.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut S) -> R) -> Result<R, StoreError> {
        let mut store = self.store.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut store))
    }
}
