//! Durable grab state
//!
//! The state file records, per device identity key, every file fingerprint
//! whose copy has been verified and committed, plus a short session history.
//!
//! Storage is a JSON document plus an append-only journal:
//!
//! - `mark_completed` appends one line to `<file>.journal` and syncs it, so a
//!   completion costs the same no matter how large the state has grown.
//! - Session records, `forget` and `flush` compact: the whole document is
//!   rewritten crash-safely (`<file>.tmp`, fsync, rename, fsync of the parent
//!   directory) under a new generation and the journal is discarded.
//! - `open` replays journal lines whose generation is not older than the
//!   document's.
//!
//! The store holds an exclusive lock on `<file>.lock` for its whole lifetime,
//! so a second grabby process cannot work on the same state. Inside the
//! process a single `GrabStateStore` is shared by all sessions behind an
//! `Arc`.

use crate::core::error::{GrabError, Result};
use crate::device::DeviceIdentity;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Version of the state file format
pub const STATE_VERSION: u32 = 1;

/// Session history kept per device
pub const MAX_SESSIONS_PER_DEVICE: usize = 50;

/// Journal lines after which a completion also compacts the document
const COMPACT_AFTER: usize = 1024;

/// State store errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to read state file '{}': {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("Failed to write state file '{}': {message}", path.display())]
    Write { path: PathBuf, message: String },

    #[error("Grab state '{}' is in use by another grabby process", path.display())]
    Locked { path: PathBuf },
}

/// A committed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEntry {
    /// Source path relative to the mount root
    pub source: String,
    /// Final target path
    pub target: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// When the copy was committed
    pub completed_at: DateTime<Utc>,
}

/// Summary of one finished session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub copied: u64,
    pub skipped: u64,
    pub failed: u64,
    pub deleted: u64,
    pub bytes_copied: u64,
    pub aborted: bool,
}

/// Everything known about one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    /// Last known device name
    pub name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Completed fingerprints
    #[serde(default)]
    pub completed: BTreeMap<String, CompletionEntry>,
    /// Most recent sessions, oldest first
    #[serde(default)]
    pub sessions: Vec<SessionRecord>,
}

impl DeviceState {
    fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            first_seen: now,
            last_seen: now,
            completed: BTreeMap::new(),
            sessions: Vec::new(),
        }
    }
}

/// The persisted document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrabState {
    pub version: u32,
    /// Bumped on every compaction; older journal lines are already included
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceState>,
}

impl Default for GrabState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            generation: 0,
            devices: BTreeMap::new(),
        }
    }
}

/// One line of the completion journal
#[derive(Debug, Serialize, Deserialize)]
struct JournalRecord {
    generation: u64,
    key: String,
    name: String,
    fingerprint: String,
    entry: CompletionEntry,
}

impl JournalRecord {
    fn apply(self, state: &mut GrabState) {
        let device = state
            .devices
            .entry(self.key)
            .or_insert_with(|| DeviceState::new(&self.name));
        device.last_seen = device.last_seen.max(self.entry.completed_at);
        device.completed.insert(self.fingerprint, self.entry);
    }
}

/// Per-device overview for listings
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub key: String,
    pub name: String,
    pub completed: usize,
    pub sessions: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_session: Option<SessionRecord>,
}

struct Inner {
    state: GrabState,
    /// Changes not yet compacted into the document
    dirty: bool,
    /// Journal lines written since the last compaction
    journaled: usize,
}

/// Shared, durable grab state
pub struct GrabStateStore {
    path: PathBuf,
    journal_path: PathBuf,
    inner: Mutex<Inner>,
    active: Arc<Mutex<HashSet<String>>>,
    // Released when the store is dropped
    _lock: File,
}

/// Exclusive right to run a session for one device identity.
///
/// Released when dropped.
#[derive(Debug)]
pub struct DeviceClaim {
    key: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl DeviceClaim {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.key);
        trace!("Released claim on {}", self.key);
    }
}

impl GrabStateStore {
    /// Open the state file, starting empty if it does not exist.
    ///
    /// Fails with `StateError::Locked` while another store (in this or any
    /// other process) has the same file open. A document that cannot be
    /// parsed is moved aside to `<file>.corrupt`.
    pub fn open(path: impl Into<PathBuf>) -> std::result::Result<Self, StateError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StateError::Write {
                path: parent.to_path_buf(),
                message: e.to_string(),
            })?;
        }

        let lock = acquire_lock(&path)?;
        let (mut state, mut dirty) = Self::load(&path)?;
        let journal_path = sibling(&path, "journal");
        let replayed = replay_journal(&journal_path, &mut state)?;
        if replayed > 0 {
            dirty = true;
        }

        debug!(
            "Opened grab state {} ({} devices, {} journaled completions)",
            path.display(),
            state.devices.len(),
            replayed
        );

        Ok(Self {
            path,
            journal_path,
            inner: Mutex::new(Inner {
                state,
                dirty,
                journaled: replayed,
            }),
            active: Arc::new(Mutex::new(HashSet::new())),
            _lock: lock,
        })
    }

    fn load(path: &Path) -> std::result::Result<(GrabState, bool), StateError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok((GrabState::default(), false));
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        match serde_json::from_reader::<_, GrabState>(BufReader::new(file)) {
            Ok(state) => Ok((state, false)),
            Err(e) => {
                let aside = sibling(path, "corrupt");
                warn!(
                    "Grab state {} is unreadable ({}); moving it to {} and starting fresh",
                    path.display(),
                    e,
                    aside.display()
                );
                fs::rename(path, &aside).map_err(|e| StateError::Write {
                    path: aside.clone(),
                    message: e.to_string(),
                })?;
                Ok((GrabState::default(), true))
            }
        }
    }

    /// Path of the state file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a fingerprint is recorded as completed for a device
    pub fn is_completed(&self, key: &str, fingerprint: &str) -> bool {
        self.lock()
            .state
            .devices
            .get(key)
            .is_some_and(|d| d.completed.contains_key(fingerprint))
    }

    /// Target path a completed fingerprint was committed to
    pub fn completed_target(&self, key: &str, fingerprint: &str) -> Option<PathBuf> {
        self.lock()
            .state
            .devices
            .get(key)
            .and_then(|d| d.completed.get(fingerprint))
            .map(|e| e.target.clone())
    }

    #[cfg(test)]
    pub(crate) fn completed_count(&self, key: &str) -> usize {
        self.lock()
            .state
            .devices
            .get(key)
            .map_or(0, |d| d.completed.len())
    }

    /// Record a committed file. Returns only once the journal line is on disk.
    pub fn mark_completed(
        &self,
        identity: &DeviceIdentity,
        fingerprint: &str,
        entry: CompletionEntry,
    ) -> std::result::Result<(), StateError> {
        let mut inner = self.lock();

        let record = JournalRecord {
            generation: inner.state.generation,
            key: identity.key.clone(),
            name: identity.name.clone(),
            fingerprint: fingerprint.to_string(),
            entry,
        };
        self.append_journal(&record)?;

        record.apply(&mut inner.state);
        inner.dirty = true;
        inner.journaled += 1;
        trace!("Completed {} on {}", fingerprint, identity.key);

        if inner.journaled >= COMPACT_AFTER {
            // The completion is already durable in the journal
            if let Err(e) = self.compact(&mut inner) {
                warn!("Failed to compact grab state: {}", e);
            }
        }
        Ok(())
    }

    /// Drop everything recorded for a device. Returns whether it was known.
    pub fn forget(&self, key: &str) -> std::result::Result<bool, StateError> {
        let mut inner = self.lock();

        let Some(removed) = inner.state.devices.remove(key) else {
            return Ok(false);
        };

        if let Err(e) = self.compact(&mut inner) {
            inner.state.devices.insert(key.to_string(), removed);
            return Err(e);
        }

        info!(
            "Forgot device {} ({} completed files)",
            key,
            removed.completed.len()
        );
        Ok(true)
    }

    /// Append a finished session to the device's history
    pub fn record_session(
        &self,
        identity: &DeviceIdentity,
        record: SessionRecord,
    ) -> std::result::Result<(), StateError> {
        let mut inner = self.lock();

        let is_new_device = !inner.state.devices.contains_key(&identity.key);
        let device = inner
            .state
            .devices
            .entry(identity.key.clone())
            .or_insert_with(|| DeviceState::new(&identity.name));
        let previous_name = std::mem::replace(&mut device.name, identity.name.clone());
        let previous_seen = device.last_seen;
        let previous_sessions = device.sessions.clone();

        device.last_seen = record.ended_at;
        device.sessions.push(record);
        if device.sessions.len() > MAX_SESSIONS_PER_DEVICE {
            let excess = device.sessions.len() - MAX_SESSIONS_PER_DEVICE;
            device.sessions.drain(..excess);
        }

        if let Err(e) = self.compact(&mut inner) {
            if is_new_device {
                inner.state.devices.remove(&identity.key);
            } else if let Some(device) = inner.state.devices.get_mut(&identity.key) {
                device.name = previous_name;
                device.last_seen = previous_seen;
                device.sessions = previous_sessions;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Overview of all known devices, most recently seen first
    pub fn devices(&self) -> Vec<DeviceSummary> {
        let inner = self.lock();
        let mut devices: Vec<DeviceSummary> = inner
            .state
            .devices
            .iter()
            .map(|(key, d)| DeviceSummary {
                key: key.clone(),
                name: d.name.clone(),
                completed: d.completed.len(),
                sessions: d.sessions.len(),
                first_seen: d.first_seen,
                last_seen: d.last_seen,
                last_session: d.sessions.last().cloned(),
            })
            .collect();
        devices.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        devices
    }

    /// Take the exclusive session claim for a device
    pub fn claim(&self, identity: &DeviceIdentity) -> Result<DeviceClaim> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(identity.key.clone()) {
            return Err(GrabError::DeviceBusy(identity.key.clone()));
        }
        trace!("Claimed {}", identity.key);
        Ok(DeviceClaim {
            key: identity.key.clone(),
            active: Arc::clone(&self.active),
        })
    }

    #[cfg(test)]
    pub(crate) fn is_claimed(&self, key: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    /// Compact the journal into the state file if there are unsaved changes
    pub fn flush(&self) -> std::result::Result<(), StateError> {
        let mut inner = self.lock();
        if !inner.dirty {
            trace!("State not modified, skipping flush");
            return Ok(());
        }
        self.compact(&mut inner)?;
        debug!("Flushed grab state to {}", self.path.display());
        Ok(())
    }

    /// Rewrite the document under a new generation and drop the journal.
    ///
    /// The generation stays bumped when the write fails: journal lines written
    /// afterwards carry the new number and are replayed against either the old
    /// or the new document.
    fn compact(&self, inner: &mut Inner) -> std::result::Result<(), StateError> {
        inner.state.generation += 1;
        self.persist(&inner.state)?;
        inner.dirty = false;
        inner.journaled = 0;

        match fs::remove_file(&self.journal_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!(
                "Could not remove {} (its lines are stale now): {}",
                self.journal_path.display(),
                e
            ),
        }
        Ok(())
    }

    fn append_journal(&self, record: &JournalRecord) -> std::result::Result<(), StateError> {
        let write_err = |e: &dyn std::fmt::Display| StateError::Write {
            path: self.journal_path.clone(),
            message: e.to_string(),
        };

        let mut line = serde_json::to_vec(record).map_err(|e| write_err(&e))?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .map_err(|e| write_err(&e))?;
        let start = file.metadata().map_err(|e| write_err(&e))?.len();

        let result = file.write_all(&line).and_then(|()| file.sync_data());
        if let Err(e) = result {
            // Keep a torn line from swallowing the next record
            let _ = file.set_len(start);
            return Err(write_err(&e));
        }
        Ok(())
    }

    fn persist(&self, state: &GrabState) -> std::result::Result<(), StateError> {
        let write_err = |path: &Path, e: &dyn std::fmt::Display| StateError::Write {
            path: path.to_path_buf(),
            message: e.to_string(),
        };

        let tmp = sibling(&self.path, "tmp");
        let json = serde_json::to_vec_pretty(state).map_err(|e| write_err(&tmp, &e))?;

        let result = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)?;
            sync_parent(&self.path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(write_err(&self.path, &e));
        }
        Ok(())
    }

    /// Drop the store without compacting, as a crash would
    #[cfg(test)]
    pub(crate) fn abandon(self) {
        self.lock().dirty = false;
    }
}

impl Drop for GrabStateStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush grab state on close: {}", e);
        }
    }
}

/// Take the process lock on `<file>.lock`
fn acquire_lock(path: &Path) -> std::result::Result<File, StateError> {
    let lock_path = sibling(path, "lock");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|source| StateError::Read {
            path: lock_path.clone(),
            source,
        })?;

    // Fully qualified: newer std has an inherent `File::try_lock_exclusive`
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            trace!("Locked {}", lock_path.display());
            Ok(file)
        }
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
            Err(StateError::Locked {
                path: path.to_path_buf(),
            })
        }
        Err(source) => Err(StateError::Read {
            path: lock_path,
            source,
        }),
    }
}

/// Apply journal lines that are not older than the document
fn replay_journal(path: &Path, state: &mut GrabState) -> std::result::Result<usize, StateError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(StateError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut applied = 0;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| StateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let record: JournalRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    "Skipping unreadable line {} of {}: {}",
                    index + 1,
                    path.display(),
                    e
                );
                continue;
            }
        };
        if record.generation < state.generation {
            continue;
        }
        record.apply(state);
        applied += 1;
    }

    if applied > 0 {
        debug!("Replayed {} completions from {}", applied, path.display());
    }
    Ok(applied)
}

/// `<file>.<suffix>` next to `path`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => File::open(parent)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}
