//! Durable, file-backed fallback store.
//!
//! `FemtoFallbackStore` holds events that could not be delivered to the
//! broker. Each event occupies exactly one line of JSON, so operators can
//! inspect the file with ordinary tools during an outage.
//!
//! A single mutex guards the file. [`FemtoFallbackStore::drain_all`] holds it
//! across both the read and the truncate, so an append either lands before the
//! drain (and is returned by it) or after (and stays for the next drain).

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use log::warn;
use parking_lot::Mutex;

use crate::{
    codec::{decode_line, encode_line},
    error::RelayError,
    level::FemtoLevel,
    log_event::FemtoLogEvent,
};

/// Append-only store of undelivered events.
///
/// The file is reopened for every write so a store whose file was removed or
/// rotated by an operator recreates it instead of writing to an unlinked
/// inode.
pub struct FemtoFallbackStore {
    path: PathBuf,
    lock: Mutex<()>,
    sync_on_append: bool,
}

fn open_append(path: &Path) -> io::Result<File> {
    #[expect(
        clippy::ineffective_open_options,
        reason = "Be explicit about write intent alongside append"
    )]
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(true)
        .open(path)?;
    Ok(file)
}

impl FemtoFallbackStore {
    /// Open (creating if needed) the store at `path`.
    ///
    /// Missing parent directories are created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RelayError> {
        let path = path.as_ref().to_path_buf();
        Self::prepare(&path).map_err(|source| RelayError::StoreUnavailable {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            lock: Mutex::new(()),
            sync_on_append: false,
        })
    }

    /// Call `fsync` after every append. Off by default.
    pub fn with_sync_on_append(mut self, sync: bool) -> Self {
        self.sync_on_append = sync;
        self
    }

    fn prepare(path: &Path) -> io::Result<File> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        open_append(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, source: io::Error) -> RelayError {
        RelayError::StoreUnavailable {
            path: self.path.clone(),
            source,
        }
    }

    /// Append one event.
    pub fn append(&self, event: &FemtoLogEvent) -> Result<(), RelayError> {
        let line = encode_line(event).map_err(|e| self.unavailable(e))?;
        self.write_locked(line.as_bytes())
    }

    /// Append `events` in order as one write under one lock acquisition.
    ///
    /// The batch is never interleaved with concurrent appends.
    pub fn append_all(&self, events: &[FemtoLogEvent]) -> Result<(), RelayError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for event in events {
            buf.push_str(&encode_line(event).map_err(|e| self.unavailable(e))?);
        }
        self.write_locked(buf.as_bytes())
    }

    /// Put `events` back at the head of the store, ahead of anything appended
    /// since they were drained.
    ///
    /// The current contents are copied after `events` into a sibling file
    /// which then replaces the store, all under the store lock.
    pub fn requeue_front(&self, events: &[FemtoLogEvent]) -> Result<(), RelayError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for event in events {
            buf.extend_from_slice(encode_line(event).map_err(|e| self.unavailable(e))?.as_bytes());
        }
        let _guard = self.lock.lock();
        match fs::read(&self.path) {
            Ok(existing) => buf.extend_from_slice(&existing),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(self.unavailable(e)),
        }
        self.replace_file(&buf).map_err(|e| self.unavailable(e))
    }

    fn replace_file(&self, bytes: &[u8]) -> io::Result<()> {
        let mut staging = self.path.clone().into_os_string();
        staging.push(".requeue");
        let staging = PathBuf::from(staging);
        let written = self.write_staged(&staging, bytes);
        if written.is_err() {
            let _ = fs::remove_file(&staging);
        }
        written
    }

    fn write_staged(&self, staging: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut file = File::create(staging)?;
        file.write_all(bytes)?;
        file.flush()?;
        if self.sync_on_append {
            file.sync_data()?;
        }
        fs::rename(staging, &self.path)
    }

    fn write_locked(&self, bytes: &[u8]) -> Result<(), RelayError> {
        let _guard = self.lock.lock();
        self.write_file(bytes).map_err(|e| self.unavailable(e))
    }

    fn write_file(&self, bytes: &[u8]) -> io::Result<()> {
        let mut file = Self::prepare(&self.path)?;
        file.write_all(bytes)?;
        file.flush()?;
        if self.sync_on_append {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Return every stored event in append order and empty the store.
    ///
    /// If truncation fails nothing is returned, so no event is ever handed
    /// out by two drains.
    pub fn drain_all(&self) -> Result<Vec<FemtoLogEvent>, RelayError> {
        let _guard = self.lock.lock();
        let contents = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.unavailable(e)),
        };
        if contents.is_empty() {
            return Ok(Vec::new());
        }
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| self.unavailable(e))?;
        Ok(parse_lines(&contents))
    }

    /// Number of stored events.
    pub fn len(&self) -> Result<usize, RelayError> {
        let _guard = self.lock.lock();
        match fs::read(&self.path) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes)
                .lines()
                .filter(|line| !line.trim().is_empty())
                .count()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(self.unavailable(e)),
        }
    }

    pub fn is_empty(&self) -> Result<bool, RelayError> {
        Ok(self.len()? == 0)
    }
}

/// Decode drained contents. Lines that are not valid events (legacy plain
/// text, hand edits) are kept as Information events carrying the raw line.
fn parse_lines(contents: &[u8]) -> Vec<FemtoLogEvent> {
    let text = String::from_utf8_lossy(contents);
    let mut undecodable = 0usize;
    let events = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            decode_line(line).unwrap_or_else(|_| {
                undecodable += 1;
                FemtoLogEvent::new(FemtoLevel::Information, line)
            })
        })
        .collect();
    if undecodable > 0 {
        warn!(
            "FemtoFallbackStore: {undecodable} lines were not encoded events; forwarding them as raw text"
        );
    }
    events
}

impl std::fmt::Debug for FemtoFallbackStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FemtoFallbackStore")
            .field("path", &self.path)
            .field("sync_on_append", &self.sync_on_append)
            .finish()
    }
}
