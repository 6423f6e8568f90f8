//! Persistent key to digest tables.
//!
//! A [`DigestStore`] keeps all live entries in memory and, if persisted, mirrors every mutation
//! into an append-only log file. Stores are obtained through the [`StoreLoader`], which recovers
//! or migrates existing files on startup.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::codec::CodecError;
use crate::digest::AgentDigest;
use crate::key::HistogramKey;

mod loader;
mod log;
mod settings;

pub use self::loader::*;
pub use self::settings::*;

use self::log::{Header, StoreLog};

/// Growth beyond the declared capacity is tolerated up to this factor.
pub const MAX_BLOAT_FACTOR: u64 = 1000;

/// Initial allocations are capped at this many entries regardless of the declared capacity.
const MAX_PREALLOCATED_ENTRIES: usize = 1 << 16;

/// Returns `<path>.<suffix>`.
pub(crate) fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// An error returned by [`DigestStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the store file failed.
    #[error("failed to perform I/O operation")]
    Io(#[from] io::Error),
    /// Another owner holds the store file.
    #[error("store file {} is locked by another process", .0.display())]
    Locked(PathBuf),
    /// A key or digest could not be encoded or decoded.
    #[error("failed to encode or decode an entry")]
    Codec(#[from] CodecError),
    /// The store file does not start with a valid header.
    #[error("invalid store header: {0}")]
    InvalidHeader(String),
    /// The store file holds different key or value types.
    #[error("store holds {found} but {expected} was expected")]
    IncompatibleTypes {
        /// The expected key and value types.
        expected: String,
        /// The key and value types found in the file.
        found: String,
    },
    /// The store file contains an unreadable record.
    #[error("store corruption detected: {0}")]
    Corruption(String),
    /// The store grew past the bloat limit.
    #[error("store exceeded its limit of {limit} entries")]
    CapacityExceeded {
        /// The maximum number of entries.
        limit: u64,
    },
    /// A settings migration was interrupted and the settings of the old store are unknown.
    #[error("interrupted migration left the old store at {}", .0.display())]
    InterruptedMigration(PathBuf),
    /// The store was closed.
    #[error("store is closed")]
    Closed,
}

#[derive(Debug)]
struct StoreInner {
    entries: HashMap<HistogramKey, AgentDigest>,
    log: Option<StoreLog>,
    closed: bool,
}

impl StoreInner {
    fn ensure_open(&self) -> Result<(), StoreError> {
        match self.closed {
            true => Err(StoreError::Closed),
            false => Ok(()),
        }
    }
}

/// A key to digest table, optionally backed by a file.
///
/// All reads are served from memory. Writes to a persisted store are appended to its log and
/// become durable on the next [`sync`](Self::sync).
///
/// The store does not serialize operations on the same key beyond the individual call. Callers
/// that read, modify, and write back an entry must hold their own per-key lock, which is what
/// [`Accumulator`](crate::Accumulator) does.
#[derive(Debug)]
pub struct DigestStore {
    inner: Mutex<StoreInner>,
    path: Option<PathBuf>,
    capacity: u64,
}

impl DigestStore {
    /// Creates a store that lives only in memory.
    pub fn in_memory(capacity: u64) -> Self {
        Self::from_parts(HashMap::with_capacity(preallocate(capacity)), None, None, capacity)
    }

    /// Creates an empty persisted store at `path`, replacing any existing file.
    pub fn create(path: &Path, settings: &StoreSettings) -> Result<Self, StoreError> {
        let log = StoreLog::create(path, header(settings), buffer_size(settings))?;
        let entries = HashMap::with_capacity(preallocate(settings.entries));
        Ok(Self::from_parts(
            entries,
            Some(log),
            Some(path.to_path_buf()),
            settings.entries,
        ))
    }

    /// Recovers a persisted store from an existing file at `path`.
    pub fn recover(path: &Path, settings: &StoreSettings) -> Result<Self, StoreError> {
        let (log, entries) = StoreLog::open(
            path,
            header(settings),
            buffer_size(settings),
            preallocate(settings.entries),
        )?;
        Ok(Self::from_parts(
            entries,
            Some(log),
            Some(path.to_path_buf()),
            settings.entries,
        ))
    }

    /// Recovers the entries of a store file into an in-memory store, leaving the file untouched.
    pub fn read_only(path: &Path, settings: &StoreSettings) -> Result<Self, StoreError> {
        let entries = StoreLog::read(path, &header(settings), preallocate(settings.entries))?;
        Ok(Self::from_parts(entries, None, None, settings.entries))
    }

    fn from_parts(
        entries: HashMap<HistogramKey, AgentDigest>,
        log: Option<StoreLog>,
        path: Option<PathBuf>,
        capacity: u64,
    ) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entries,
                log,
                closed: false,
            }),
            path,
            capacity,
        }
    }

    /// The file backing this store, if persisted.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns `true` if the store is backed by a file.
    pub fn is_persisted(&self) -> bool {
        self.path.is_some()
    }

    /// The number of entries the store was sized for.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns `true` if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the store holds more than 1.5 times its declared capacity.
    pub fn is_oversized(&self) -> bool {
        self.len() as u64 * 2 > self.capacity * 3
    }

    /// Returns a copy of the digest stored for `key`.
    pub fn get(&self, key: &HistogramKey) -> Option<AgentDigest> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Returns `true` if the store holds a digest for `key`.
    pub fn contains_key(&self, key: &HistogramKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Stores `digest` under `key`, replacing any previous value.
    pub fn insert(&self, key: HistogramKey, mut digest: AgentDigest) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        let limit = self.capacity.saturating_mul(MAX_BLOAT_FACTOR);
        if !inner.entries.contains_key(&key) && inner.entries.len() as u64 >= limit {
            return Err(StoreError::CapacityExceeded { limit });
        }

        digest.compress();
        if let Some(log) = inner.log.as_mut() {
            log.append_put(&key, &digest)?;
        }
        inner.entries.insert(key, digest);

        Ok(())
    }

    /// Removes and returns the digest stored for `key`.
    pub fn remove(&self, key: &HistogramKey) -> Result<Option<AgentDigest>, StoreError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        if !inner.entries.contains_key(key) {
            return Ok(None);
        }

        if let Some(log) = inner.log.as_mut() {
            log.append_remove(key)?;
        }
        Ok(inner.entries.remove(key))
    }

    /// Returns the dispatch time of every entry.
    pub fn dispatch_times(&self) -> Vec<(HistogramKey, i64)> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .map(|(key, digest)| (key.clone(), digest.dispatch_time()))
            .collect()
    }

    /// Returns a copy of all entries.
    pub fn entries(&self) -> Vec<(HistogramKey, AgentDigest)> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .map(|(key, digest)| (key.clone(), digest.clone()))
            .collect()
    }

    /// Makes all previous writes durable and compacts the log if it is mostly dead records.
    pub fn sync(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        let StoreInner { entries, log, .. } = &mut *inner;
        let Some(log) = log.as_mut() else {
            return Ok(());
        };

        log.sync()?;
        if log.should_compact(entries.len()) {
            log.compact(entries.iter())?;
        }

        Ok(())
    }

    /// Syncs and releases the store file.
    ///
    /// Subsequent writes fail with [`StoreError::Closed`]. Closing twice is a noop.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }

        inner.closed = true;
        match inner.log.take() {
            Some(mut log) => {
                let result = log.sync();
                sluice_log::debug!(path = %log.path().display(), "closed accumulator store");
                result
            }
            None => Ok(()),
        }
    }
}

fn header(settings: &StoreSettings) -> Header {
    Header {
        key_type: settings.key_type.clone(),
        value_type: settings.value_type.clone(),
    }
}

fn buffer_size(settings: &StoreSettings) -> usize {
    (settings.entry_size() * 64).clamp(8 * 1024, 1024 * 1024)
}

fn preallocate(capacity: u64) -> usize {
    usize::try_from(capacity).map_or(MAX_PREALLOCATED_ENTRIES, |c| c.min(MAX_PREALLOCATED_ENTRIES))
}
