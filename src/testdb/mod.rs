//! Test Database Module
//!
//! Fixtures for exercising the grab pipeline without real removable media:
//!
//! - `VolumeFixture` - a temporary directory standing in for a mounted card,
//!   with controlled file contents and modification times
//! - `FaultyVolumeIo` - a `VolumeIo` that injects read failures, stalls,
//!   delete failures and disconnects
//! - `ScriptedProbe` - a `MetadataProbe` with per-file canned answers
//! - `CollectingNotifier` - keeps every session summary it receives
//! - `StaticMountSource` - an in-memory `MountSource`
//! - `RecordingMounter` - a `MountHelper` that edits a fake mount table
//!
//! End-to-end scenarios live in `integration`.

#![allow(dead_code)]

pub mod integration;

use crate::core::error::Result;
use crate::core::notifier::{EventNotifier, NotificationEvent, NotifyError};
use crate::core::rename::{MediaMetadata, MediaTrack, MetadataProbe, ProbeError};
use crate::device::{DeviceIdentity, MountHelper, MountSource, MountedVolume, VolumeIo};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, UNIX_EPOCH};
use tempfile::TempDir;

/// Longest a stalled read blocks before giving up on its own
const MAX_STALL: Duration = Duration::from_secs(30);

// =============================================================================
// Volume fixture
// =============================================================================

/// A fake mounted volume rooted in a temporary directory
pub struct VolumeFixture {
    _dir: TempDir,
    root: PathBuf,
    label: String,
}

impl VolumeFixture {
    /// Empty volume with the given label
    pub fn new(label: &str) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let root = dir.path().join(label);
        fs::create_dir_all(&root).expect("create volume root");
        Self {
            _dir: dir,
            root,
            label: label.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a file on the volume
    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Write a file with the given modification time (seconds since epoch)
    pub fn add_file(&self, rel: &str, content: &[u8], mtime_secs: u64) -> PathBuf {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dirs");
        }
        fs::write(&path, content).expect("write fixture file");
        File::options()
            .write(true)
            .open(&path)
            .and_then(|f| f.set_modified(UNIX_EPOCH + Duration::from_secs(mtime_secs)))
            .expect("set mtime");
        path
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path(rel).exists()
    }

    /// Identity keyed by label, as a labelled card would be
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(Some(self.label.clone()), None, None, &self.root)
    }

    pub fn volume(&self) -> MountedVolume {
        MountedVolume::new(self.identity(), &self.root)
    }

    /// Move the volume root away so it is no longer readable at its mount path
    pub fn unplug(&self) {
        let parked = self.root.with_extension("unplugged");
        fs::rename(&self.root, parked).expect("park volume root");
    }

    /// Undo `unplug`
    pub fn replug(&self) {
        let parked = self.root.with_extension("unplugged");
        fs::rename(parked, &self.root).expect("restore volume root");
    }
}

// =============================================================================
// Fault injection
// =============================================================================

/// Failures a `FaultyVolumeIo` injects, keyed by absolute source path
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Reads of these files fail after this many bytes
    pub read_errors: HashMap<PathBuf, u64>,
    /// Reads of these files block until released
    pub stall_files: HashSet<PathBuf>,
    /// Deleting these files fails
    pub remove_errors: HashSet<PathBuf>,
    /// The volume disappears on the open after this many successful opens
    pub disconnect_after_opens: Option<usize>,
}

/// Local file access with injected failures
pub struct FaultyVolumeIo {
    config: FaultConfig,
    opens: AtomicUsize,
    disconnected: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
    removed: Mutex<Vec<PathBuf>>,
}

impl FaultyVolumeIo {
    pub fn new(config: FaultConfig) -> Self {
        Self {
            config,
            opens: AtomicUsize::new(0),
            disconnected: Arc::new(AtomicBool::new(false)),
            released: Arc::new(AtomicBool::new(false)),
            removed: Mutex::new(Vec::new()),
        }
    }

    /// Fail reads of `path` after `after_bytes`
    pub fn failing_read(path: impl Into<PathBuf>, after_bytes: u64) -> Self {
        let mut config = FaultConfig::default();
        config.read_errors.insert(path.into(), after_bytes);
        Self::new(config)
    }

    /// Block reads of `path`
    pub fn stalling(path: impl Into<PathBuf>) -> Self {
        let mut config = FaultConfig::default();
        config.stall_files.insert(path.into());
        Self::new(config)
    }

    /// Let stalled reads fail immediately
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    /// Make the volume unreachable
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Paths successfully removed so far, in order
    pub fn removed(&self) -> Vec<PathBuf> {
        self.removed.lock().unwrap().clone()
    }
}

impl Drop for FaultyVolumeIo {
    fn drop(&mut self) {
        self.release();
    }
}

impl VolumeIo for FaultyVolumeIo {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "device disconnected"));
        }
        if let Some(limit) = self.config.disconnect_after_opens {
            if self.opens.load(Ordering::SeqCst) >= limit {
                self.disconnect();
                return Err(io::Error::new(io::ErrorKind::NotFound, "device disconnected"));
            }
        }
        self.opens.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(FaultyReader {
            inner: File::open(path)?,
            remaining: self.config.read_errors.get(path).copied(),
            stall: self
                .config
                .stall_files
                .contains(path)
                .then(|| Arc::clone(&self.released)),
        }))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        if self.config.remove_errors.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "simulated delete failure",
            ));
        }
        fs::remove_file(path)?;
        self.removed.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    fn is_accessible(&self, root: &Path) -> bool {
        !self.disconnected.load(Ordering::SeqCst) && fs::read_dir(root).is_ok()
    }
}

struct FaultyReader {
    inner: File,
    remaining: Option<u64>,
    stall: Option<Arc<AtomicBool>>,
}

impl Read for FaultyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(released) = &self.stall {
            let started = Instant::now();
            while !released.load(Ordering::SeqCst) && started.elapsed() < MAX_STALL {
                std::thread::sleep(Duration::from_millis(10));
            }
            return Err(io::Error::new(io::ErrorKind::TimedOut, "simulated stall"));
        }

        match self.remaining {
            Some(0) => Err(io::Error::new(io::ErrorKind::Other, "simulated read error")),
            Some(left) => {
                let max = buf.len().min(left as usize);
                let n = self.inner.read(&mut buf[..max])?;
                self.remaining = Some(left - n as u64);
                Ok(n)
            }
            None => self.inner.read(buf),
        }
    }
}

// =============================================================================
// Probe, notifier, mount source
// =============================================================================

/// `MetadataProbe` answering from a script; unscripted files fail to probe
#[derive(Clone, Default)]
pub struct ScriptedProbe {
    answers: Arc<Mutex<HashMap<PathBuf, MediaMetadata>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer probes of `path` with a single field in `group`
    pub fn with_field(self, path: impl Into<PathBuf>, group: &str, name: &str, value: &str) -> Self {
        let track = MediaTrack {
            kind: group.to_string(),
            fields: HashMap::from([(name.to_string(), value.to_string())]),
        };
        self.answers.lock().unwrap().insert(
            path.into(),
            MediaMetadata {
                tracks: vec![track],
            },
        );
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MetadataProbe for ScriptedProbe {
    fn probe(&self, path: &Path) -> std::result::Result<MediaMetadata, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| ProbeError::Spawn {
                program: "mediainfo".to_string(),
                message: format!("not scripted: {}", path.display()),
            })
    }
}

/// Keeps every summary it is sent
#[derive(Clone, Default)]
pub struct CollectingNotifier {
    events: Arc<Mutex<Vec<NotificationEvent>>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventNotifier for CollectingNotifier {
    fn name(&self) -> &str {
        "collecting"
    }

    fn notify(&self, event: &NotificationEvent) -> std::result::Result<(), NotifyError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// `MountSource` whose snapshot is set by the test
#[derive(Clone, Default)]
pub struct StaticMountSource {
    volumes: Arc<Mutex<Vec<MountedVolume>>>,
}

impl StaticMountSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, volumes: Vec<MountedVolume>) {
        *self.volumes.lock().unwrap() = volumes;
    }
}

impl MountSource for StaticMountSource {
    fn scan(&self) -> Result<Vec<MountedVolume>> {
        Ok(self.volumes.lock().unwrap().clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// `MountHelper` that records calls and keeps a fake mount table in sync
#[derive(Clone)]
pub struct RecordingMounter {
    mounts_file: PathBuf,
    fail: bool,
    attempts: Arc<AtomicUsize>,
    mounted: Arc<Mutex<Vec<PathBuf>>>,
    unmounted: Arc<Mutex<Vec<PathBuf>>>,
}

impl RecordingMounter {
    pub fn new(mounts_file: impl Into<PathBuf>) -> Self {
        Self {
            mounts_file: mounts_file.into(),
            fail: false,
            attempts: Arc::new(AtomicUsize::new(0)),
            mounted: Arc::new(Mutex::new(Vec::new())),
            unmounted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every mount attempt fails
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Mount targets, in order
    pub fn mounted(&self) -> Vec<PathBuf> {
        self.mounted.lock().unwrap().clone()
    }

    /// Unmount targets, in order
    pub fn unmounted(&self) -> Vec<PathBuf> {
        self.unmounted.lock().unwrap().clone()
    }
}

impl MountHelper for RecordingMounter {
    fn mount(&self, device: &Path, target: &Path) -> io::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated mount failure"));
        }
        let mut table = fs::read_to_string(&self.mounts_file).unwrap_or_default();
        table.push_str(&format!("{} {} vfat rw 0 0\n", device.display(), target.display()));
        fs::write(&self.mounts_file, table)?;
        self.mounted.lock().unwrap().push(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        let table = fs::read_to_string(&self.mounts_file).unwrap_or_default();
        let suffix = format!(" {} vfat rw 0 0", target.display());
        let kept: String = table
            .lines()
            .filter(|line| !line.ends_with(&suffix))
            .map(|line| format!("{}\n", line))
            .collect();
        fs::write(&self.mounts_file, kept)?;
        self.unmounted.lock().unwrap().push(target.to_path_buf());
        Ok(())
    }
}
