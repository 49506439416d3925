//! Persistent event store.
//!
//! When a database directory is configured every event is appended to
//! `<db_dir>/mce.log`, one JSON object per line, before it is dispatched.
//! Records already in the file are counted on open so indices keep growing
//! across restarts.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use mced_core::NormalizedEvent;
use thiserror::Error;
use tracing::info;

/// Name of the log file inside the database directory.
pub const STORE_FILE_NAME: &str = "mce.log";

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event store {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("event store is closed")]
    Closed,
}

/// Append-only destination for events.
pub trait EventStore {
    /// Append one event, returning its zero-based index.
    fn append(&mut self, event: &NormalizedEvent) -> Result<u64, StoreError>;

    /// Flush and release the store. Further appends fail.
    fn close(&mut self) -> Result<(), StoreError>;
}

/// Store used when persistence is disabled. Counts events, keeps nothing.
#[derive(Debug, Default)]
pub struct NullEventStore {
    appended: u64,
}

impl EventStore for NullEventStore {
    fn append(&mut self, _event: &NormalizedEvent) -> Result<u64, StoreError> {
        self.appended += 1;
        Ok(self.appended - 1)
    }

    fn close(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// JSON-lines file store.
#[derive(Debug)]
pub struct JsonlEventStore {
    path: PathBuf,
    file: Option<File>,
    records: u64,
}

impl JsonlEventStore {
    /// Open (creating if needed) the store in `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(STORE_FILE_NAME);
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(io_err)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(io_err)?;

        let mut records = 0;
        for line in BufReader::new(&file).lines() {
            if !line.map_err(io_err)?.trim().is_empty() {
                records += 1;
            }
        }

        info!(path = %path.display(), records, "event store opened");
        Ok(Self {
            path,
            file: Some(file),
            records,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records in the store, including those from earlier runs.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.records
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.records == 0
    }
}

impl EventStore for JsonlEventStore {
    fn append(&mut self, event: &NormalizedEvent) -> Result<u64, StoreError> {
        let file = self.file.as_mut().ok_or(StoreError::Closed)?;
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        file.write_all(&line).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.records += 1;
        Ok(self.records - 1)
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if let Some(file) = self.file.take() {
            file.sync_all().map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
