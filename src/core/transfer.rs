//! Transfer executor
//!
//! Copies the files of a device session into the destination tree:
//! copy to a hidden temp file, verify, rename into place, record completion,
//! and only then (optionally) delete the source.
//!
//! The byte copy of each file runs on a helper thread so that a stalled
//! device read can be bounded by the I/O timeout and a detach can interrupt
//! it. A helper stuck in a read that never returns is left behind; its temp
//! file is removed by whichever side notices the abort first.

use crate::core::config::{ChownIds, Config};
use crate::core::error::{GrabError, Result};
use crate::core::rename::{Renamer, SequenceNumbers, TargetReservations};
use crate::core::rules::{PathRules, SourceFile, TemplateContext};
use crate::core::session::{CancelToken, DeviceSession, FileRecord, FileStatus};
use crate::core::state::{CompletionEntry, GrabStateStore};
use crate::device::{DeviceIdentity, VolumeIo};
use chrono::{DateTime, Local, NaiveDate, Utc};
use crossbeam_channel::{unbounded, RecvTimeoutError};
use log::{debug, error, info, trace, warn};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Poll interval while waiting on the copy helper
const WAIT_TICK: Duration = Duration::from_millis(100);

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

// =============================================================================
// Configuration
// =============================================================================

/// Settings of the transfer executor
pub struct TransferOptions {
    /// Root of the destination tree
    pub destination_base: PathBuf,
    /// Re-hash copies and compare against the bytes read
    pub verify_checksum: bool,
    /// Maximum time without progress on one file
    pub io_timeout: Duration,
    /// Copy buffer size
    pub buffer_size: usize,
    /// Carry the source mtime over to the copy
    pub preserve_mtime: bool,
    /// Owner applied to copies and created directories
    pub chown: Option<ChownIds>,
    /// Callback for progress updates
    pub progress_callback: Option<Arc<dyn Fn(ProgressUpdate) + Send + Sync>>,
}

impl std::fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOptions")
            .field("destination_base", &self.destination_base)
            .field("verify_checksum", &self.verify_checksum)
            .field("io_timeout", &self.io_timeout)
            .field("buffer_size", &self.buffer_size)
            .field("preserve_mtime", &self.preserve_mtime)
            .field("chown", &self.chown)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl Clone for TransferOptions {
    fn clone(&self) -> Self {
        Self {
            destination_base: self.destination_base.clone(),
            verify_checksum: self.verify_checksum,
            io_timeout: self.io_timeout,
            buffer_size: self.buffer_size,
            preserve_mtime: self.preserve_mtime,
            chown: self.chown,
            progress_callback: self.progress_callback.clone(),
        }
    }
}

impl TransferOptions {
    /// Options for a destination tree with default transfer settings
    pub fn with_destination<P: AsRef<Path>>(destination_base: P) -> Self {
        let defaults = crate::core::config::TransferConfig::default();
        Self {
            destination_base: destination_base.as_ref().to_path_buf(),
            verify_checksum: defaults.verify_checksum,
            io_timeout: defaults.io_timeout(),
            buffer_size: defaults.buffer_size,
            preserve_mtime: defaults.preserve_mtime,
            chown: None,
            progress_callback: None,
        }
    }

    /// Options taken from a configuration snapshot
    pub fn from_config(config: &Config) -> Self {
        Self {
            destination_base: config.destination_base.clone(),
            verify_checksum: config.transfer.verify_checksum,
            io_timeout: config.transfer.io_timeout(),
            buffer_size: config.transfer.buffer_size.max(4096),
            preserve_mtime: config.transfer.preserve_mtime,
            chown: config.chown,
            progress_callback: None,
        }
    }

    /// Set checksum verification
    pub fn verify_checksum(mut self, value: bool) -> Self {
        self.verify_checksum = value;
        self
    }

    /// Set the stall timeout
    pub fn io_timeout(mut self, value: Duration) -> Self {
        self.io_timeout = value;
        self
    }

    /// Set the copy buffer size
    pub fn buffer_size(mut self, value: usize) -> Self {
        self.buffer_size = value.max(1);
        self
    }

    /// Set progress callback
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }
}

// =============================================================================
// Progress tracking
// =============================================================================

/// Progress update information
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Current file being processed
    pub current_file: String,
    /// Current file index (1-based)
    pub current_index: usize,
    /// Total number of files
    pub total_files: usize,
    /// Bytes copied so far in this session
    pub bytes_processed: u64,
    /// Current phase
    pub phase: TransferPhase,
}

/// Current phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Walking the device
    Scanning,
    /// Copying files
    Copying,
    /// Done (or aborted)
    Complete,
}

// =============================================================================
// Executor
// =============================================================================

/// Per-session values threaded through file processing
struct SessionContext<'a> {
    identity: DeviceIdentity,
    mount_path: PathBuf,
    profile: String,
    started_at: DateTime<Local>,
    delete_after_copy: bool,
    rules: &'a PathRules,
    renamer: &'a Renamer,
}

impl SessionContext<'_> {
    fn device_lost(&self) -> GrabError {
        GrabError::DeviceUnavailable {
            identity: self.identity.key.clone(),
            mount_path: self.mount_path.clone(),
        }
    }
}

/// Result of the helper-thread copy
struct Copied {
    bytes: u64,
    digest: Option<Vec<u8>>,
}

enum CopyMsg {
    Progress,
    Done(io::Result<Copied>),
}

/// Copies, verifies, commits and deletes the files of device sessions
pub struct TransferExecutor {
    options: TransferOptions,
    store: Arc<GrabStateStore>,
    io: Arc<dyn VolumeIo>,
    reservations: TargetReservations,
}

impl TransferExecutor {
    pub fn new(
        options: TransferOptions,
        store: Arc<GrabStateStore>,
        io: Arc<dyn VolumeIo>,
        reservations: TargetReservations,
    ) -> Self {
        Self {
            options,
            store,
            io,
            reservations,
        }
    }

    fn report_progress(&self, update: ProgressUpdate) {
        if let Some(ref callback) = self.options.progress_callback {
            callback(update);
        }
    }

    /// Discover and process every file of a session.
    ///
    /// Per-file failures are recorded on the file and do not stop the run.
    /// Returns an error only when the session was aborted: the device became
    /// unreachable (`DeviceUnavailable`) or the token was cancelled
    /// (`Cancelled`).
    pub fn run(
        &self,
        session: &mut DeviceSession,
        rules: &PathRules,
        renamer: &Renamer,
        cancel: &CancelToken,
    ) -> Result<()> {
        let ctx = SessionContext {
            identity: session.volume.identity.clone(),
            mount_path: session.volume.mount_path.clone(),
            profile: session.profile.name.clone(),
            started_at: session.started_at,
            delete_after_copy: session.delete_after_copy,
            rules,
            renamer,
        };

        if !self.io.is_accessible(&ctx.mount_path) {
            return Err(ctx.device_lost());
        }

        self.report_progress(ProgressUpdate {
            current_file: "Scanning...".to_string(),
            current_index: 0,
            total_files: 0,
            bytes_processed: 0,
            phase: TransferPhase::Scanning,
        });

        let total = session.discover(rules);
        if !self.io.is_accessible(&ctx.mount_path) {
            return Err(ctx.device_lost());
        }

        info!(
            "Grabbing {} candidate files from {} with profile '{}'",
            total, ctx.identity, ctx.profile
        );

        let mut bytes_processed = 0;
        let mut sequence = SequenceNumbers::new();
        for (i, record) in session.records.iter_mut().enumerate() {
            if cancel.is_cancelled() {
                info!("Grab of {} cancelled", ctx.identity);
                return Err(GrabError::Cancelled {
                    path: ctx.mount_path.clone(),
                });
            }

            self.report_progress(ProgressUpdate {
                current_file: record.source.rel_path.display().to_string(),
                current_index: i + 1,
                total_files: total,
                bytes_processed,
                phase: TransferPhase::Copying,
            });

            self.process_file(&ctx, record, &mut sequence, cancel)?;

            if record.status.is_copied() {
                bytes_processed += record.source.size;
            }
        }

        self.report_progress(ProgressUpdate {
            current_file: "Complete".to_string(),
            current_index: total,
            total_files: total,
            bytes_processed,
            phase: TransferPhase::Complete,
        });

        Ok(())
    }

    fn process_file(
        &self,
        ctx: &SessionContext<'_>,
        record: &mut FileRecord,
        sequence: &mut SequenceNumbers,
        cancel: &CancelToken,
    ) -> Result<()> {
        let key = &ctx.identity.key;

        if self.store.is_completed(key, &record.fingerprint) {
            trace!("Already grabbed: {}", record.source.rel_path.display());
            record.target = self.store.completed_target(key, &record.fingerprint);
            record.advance(FileStatus::Skipped);
            return Ok(());
        }

        let parent = record.source.relative_parent();
        let target_dir_for = |date: NaiveDate| {
            ctx.rules.target_dir(
                &self.options.destination_base,
                &TemplateContext {
                    label: ctx.identity.label_or_name(),
                    identity: key,
                    profile: &ctx.profile,
                    session_start: ctx.started_at,
                    source_dir: &record.source.source_dir,
                    date,
                    parent: &parent,
                },
            )
        };

        // Skipped files take no sequence number
        let plan = ctx
            .renamer
            .plan_with(&record.source, |date| sequence.next(&target_dir_for(date), date));
        if let Some(message) = &plan.probe_failure {
            // Noted on the file; a later failure replaces it
            record.error = Some(GrabError::ProbeFailure {
                path: record.source.abs_path.clone(),
                message: message.clone(),
            });
        }
        let target_dir = target_dir_for(plan.date);

        if let Err(e) = self.create_target_dir(&target_dir) {
            let err = GrabError::CopyFailure {
                path: target_dir,
                message: e.to_string(),
            };
            return self.fail_copy(ctx, record, err);
        }

        let reservation = self.reservations.reserve(&target_dir, &plan.file_name);
        let final_path = reservation.path().to_path_buf();

        record.advance(FileStatus::Copying);
        if let Err(err) = self.copy_into_place(&record.source, &final_path, cancel) {
            return self.fail_copy(ctx, record, err);
        }
        record.advance(FileStatus::Verified);
        record.target = Some(final_path.clone());
        drop(reservation);

        debug!(
            "Copied {} -> {}",
            record.source.abs_path.display(),
            final_path.display()
        );

        let entry = CompletionEntry {
            source: record.source.rel_path.to_string_lossy().into_owned(),
            target: final_path,
            size: record.source.size,
            completed_at: Utc::now(),
        };
        if let Err(e) = self
            .store
            .mark_completed(&ctx.identity, &record.fingerprint, entry)
        {
            error!(
                "[{}] Could not record {}; keeping source: {}",
                ctx.identity.key,
                record.source.rel_path.display(),
                e
            );
            record.fail(GrabError::StateStoreFailure {
                path: record.source.abs_path.clone(),
                message: e.to_string(),
            });
            return Ok(());
        }

        if !ctx.delete_after_copy {
            record.advance(FileStatus::Retained);
            return Ok(());
        }

        match self.io.remove(&record.source.abs_path) {
            Ok(()) => {
                trace!("Deleted source {}", record.source.abs_path.display());
                record.advance(FileStatus::Deleted);
            }
            Err(e) => {
                warn!(
                    "[{}] Could not delete {}: {}",
                    ctx.identity.key,
                    record.source.abs_path.display(),
                    e
                );
                record.advance(FileStatus::Retained);
                record.error = Some(GrabError::DeleteFailure {
                    path: record.source.abs_path.clone(),
                    message: e.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Record a failed copy, escalating to a session abort if the device is gone
    fn fail_copy(
        &self,
        ctx: &SessionContext<'_>,
        record: &mut FileRecord,
        err: GrabError,
    ) -> Result<()> {
        if !matches!(err, GrabError::Cancelled { .. }) && !self.io.is_accessible(&ctx.mount_path)
        {
            debug!("Copy error before device loss: {}", err);
            error!(
                "[{}] Device lost while copying {}",
                ctx.identity.key,
                record.source.rel_path.display()
            );
            record.fail(ctx.device_lost());
            return Err(ctx.device_lost());
        }

        warn!("[{}] {}", ctx.identity.key, err);
        record.fail(err);
        Ok(())
    }

    fn create_target_dir(&self, dir: &Path) -> io::Result<()> {
        let missing: Vec<PathBuf> = dir
            .ancestors()
            .take_while(|d| !d.as_os_str().is_empty() && !d.exists())
            .map(Path::to_path_buf)
            .collect();

        fs::create_dir_all(dir)?;

        if let Some(ids) = self.options.chown {
            for created in missing.iter().rev() {
                apply_owner(created, ids)?;
            }
        }
        Ok(())
    }

    /// Copy to a temp file, verify it and rename it to `final_path`
    fn copy_into_place(
        &self,
        source: &SourceFile,
        final_path: &Path,
        cancel: &CancelToken,
    ) -> Result<()> {
        let temp = temp_path(final_path);
        let copied = self.copy_with_timeout(source, &temp, cancel)?;

        if let Err(err) = self.verify(source, &temp, &copied) {
            let _ = fs::remove_file(&temp);
            return Err(err);
        }

        fs::rename(&temp, final_path).map_err(|e| {
            let _ = fs::remove_file(&temp);
            GrabError::CopyFailure {
                path: source.abs_path.clone(),
                message: format!("rename to {} failed: {}", final_path.display(), e),
            }
        })?;

        #[cfg(unix)]
        if let Some(parent) = final_path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }

    fn copy_with_timeout(
        &self,
        source: &SourceFile,
        temp: &Path,
        cancel: &CancelToken,
    ) -> Result<Copied> {
        let (tx, rx) = unbounded();
        let abort = Arc::new(AtomicBool::new(false));

        let helper = {
            let io = Arc::clone(&self.io);
            let abort = Arc::clone(&abort);
            let src = source.abs_path.clone();
            let modified = source.modified;
            let temp = temp.to_path_buf();
            let buffer_size = self.options.buffer_size;
            let hash = self.options.verify_checksum;
            let preserve_mtime = self.options.preserve_mtime;
            let owner = self.options.chown;

            thread::Builder::new()
                .name("grab-copy".to_string())
                .spawn(move || {
                    let result = copy_file(
                        io.as_ref(),
                        &src,
                        &temp,
                        CopySettings {
                            buffer_size,
                            hash,
                            modified: preserve_mtime.then_some(modified),
                            owner,
                        },
                        &abort,
                        &|| {
                            let _ = tx.send(CopyMsg::Progress);
                        },
                    );
                    if result.is_err() {
                        let _ = fs::remove_file(&temp);
                    }
                    let _ = tx.send(CopyMsg::Done(result));
                })
                .map_err(|e| GrabError::CopyFailure {
                    path: source.abs_path.clone(),
                    message: format!("failed to start copy thread: {}", e),
                })?
        };

        let timeout = self.options.io_timeout;
        let tick = WAIT_TICK.min(timeout);
        let mut last_progress = Instant::now();

        let abort_with = |err: GrabError| {
            abort.store(true, Ordering::SeqCst);
            let _ = fs::remove_file(temp);
            Err(err)
        };

        loop {
            match rx.recv_timeout(tick) {
                Ok(CopyMsg::Progress) => last_progress = Instant::now(),
                Ok(CopyMsg::Done(result)) => {
                    let _ = helper.join();
                    return result.map_err(|e| GrabError::CopyFailure {
                        path: source.abs_path.clone(),
                        message: e.to_string(),
                    });
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return abort_with(GrabError::CopyFailure {
                        path: source.abs_path.clone(),
                        message: "copy thread exited unexpectedly".to_string(),
                    });
                }
            }

            if cancel.is_cancelled() {
                return abort_with(GrabError::Cancelled {
                    path: source.abs_path.clone(),
                });
            }
            if last_progress.elapsed() >= timeout {
                return abort_with(GrabError::Stalled {
                    path: source.abs_path.clone(),
                    secs: timeout.as_secs(),
                });
            }
        }
    }

    fn verify(&self, source: &SourceFile, temp: &Path, copied: &Copied) -> Result<()> {
        let mismatch = |message: String| GrabError::VerifyMismatch {
            path: source.abs_path.clone(),
            message,
        };

        let on_disk = fs::metadata(temp)
            .map_err(|e| mismatch(format!("cannot stat copy: {}", e)))?
            .len();

        if copied.bytes != source.size || on_disk != source.size {
            return Err(mismatch(format!(
                "expected {} bytes, read {}, wrote {}",
                source.size, copied.bytes, on_disk
            )));
        }

        if let Some(expected) = &copied.digest {
            let actual = hash_file(temp, self.options.buffer_size)
                .map_err(|e| mismatch(format!("cannot re-read copy: {}", e)))?;
            if &actual != expected {
                return Err(mismatch("checksum differs from source".to_string()));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// `.<name>.<pid>.<n>.grabpart` next to the final path
fn temp_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    final_path.with_file_name(format!(".{}.{}.{}.grabpart", name, std::process::id(), n))
}

struct CopySettings {
    buffer_size: usize,
    hash: bool,
    modified: Option<std::time::SystemTime>,
    owner: Option<ChownIds>,
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "copy aborted")
}

/// Stream `src` into a new file at `temp`, calling `progress` after each chunk
fn copy_file(
    io: &dyn VolumeIo,
    src: &Path,
    temp: &Path,
    settings: CopySettings,
    abort: &AtomicBool,
    progress: &dyn Fn(),
) -> io::Result<Copied> {
    let mut reader = io.open(src)?;
    if abort.load(Ordering::SeqCst) {
        return Err(aborted());
    }

    let mut out = OpenOptions::new().write(true).create_new(true).open(temp)?;
    let mut hasher = settings.hash.then(Sha256::new);
    let mut buffer = vec![0u8; settings.buffer_size];
    let mut bytes = 0u64;

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if abort.load(Ordering::SeqCst) {
            return Err(aborted());
        }
        out.write_all(&buffer[..n])?;
        if let Some(h) = hasher.as_mut() {
            h.update(&buffer[..n]);
        }
        bytes += n as u64;
        progress();
    }

    out.flush()?;
    if let Some(modified) = settings.modified {
        out.set_modified(modified)?;
    }
    if let Some(ids) = settings.owner {
        apply_owner(temp, ids)?;
    }
    out.sync_all()?;

    if abort.load(Ordering::SeqCst) {
        return Err(aborted());
    }

    Ok(Copied {
        bytes,
        digest: hasher.map(|h| h.finalize().to_vec()),
    })
}

/// Compute SHA256 of a file using streaming
fn hash_file(path: &Path, buffer_size: usize) -> io::Result<Vec<u8>> {
    let mut reader = BufReader::with_capacity(buffer_size, File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; buffer_size.min(1024 * 1024)];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize().to_vec())
}

#[cfg(unix)]
fn apply_owner(path: &Path, ids: ChownIds) -> io::Result<()> {
    std::os::unix::fs::chown(path, Some(ids.user), Some(ids.group))
}

#[cfg(not(unix))]
fn apply_owner(_path: &Path, _ids: ChownIds) -> io::Result<()> {
    Ok(())
}
