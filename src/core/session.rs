//! Device sessions and file records
//!
//! A `DeviceSession` binds one grab profile to one mounted volume for the
//! duration of a grab. It owns the `FileRecord`s discovered on the volume;
//! only the transfer executor changes their status.

use crate::core::config::GrabProfile;
use crate::core::error::GrabError;
use crate::core::rules::{PathRules, SourceFile};
use crate::device::{DeviceIdentity, MountedVolume};
use chrono::{DateTime, Local};
use log::debug;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Processing status of a discovered file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileStatus {
    Pending,
    Copying,
    Verified,
    /// Copied and removed from the device
    Deleted,
    /// Copied and left on the device
    Retained,
    /// Already completed in an earlier session
    Skipped,
    Failed,
}

impl FileStatus {
    /// Whether `next` is a legal transition from this status
    pub fn can_advance_to(self, next: FileStatus) -> bool {
        use FileStatus::*;
        matches!(
            (self, next),
            (Pending, Copying)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Copying, Verified)
                | (Copying, Failed)
                | (Verified, Deleted)
                | (Verified, Retained)
                | (Verified, Failed)
        )
    }

    /// No further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FileStatus::Deleted | FileStatus::Retained | FileStatus::Skipped | FileStatus::Failed
        )
    }

    /// The file's bytes are committed at the destination
    pub fn is_copied(self) -> bool {
        matches!(
            self,
            FileStatus::Verified | FileStatus::Deleted | FileStatus::Retained
        )
    }
}

/// Stable identifier of a source file: SHA256 of `relpath|size|mtime_ns`
pub fn fingerprint(file: &SourceFile) -> String {
    let mtime_ns = file
        .modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut hasher = Sha256::new();
    hasher.update(file.rel_path.to_string_lossy().as_bytes());
    hasher.update(b"|");
    hasher.update(file.size.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(mtime_ns.to_string().as_bytes());

    let result = hasher.finalize();
    result.iter().map(|b| format!("{:02x}", b)).collect()
}

/// One discovered source file and what happened to it
#[derive(Debug)]
pub struct FileRecord {
    pub source: SourceFile,
    pub fingerprint: String,
    pub target: Option<PathBuf>,
    pub status: FileStatus,
    pub error: Option<GrabError>,
}

impl FileRecord {
    pub fn new(source: SourceFile) -> Self {
        let fingerprint = fingerprint(&source);
        Self {
            source,
            fingerprint,
            target: None,
            status: FileStatus::Pending,
            error: None,
        }
    }

    pub(crate) fn advance(&mut self, next: FileStatus) {
        debug_assert!(
            self.status.can_advance_to(next),
            "illegal transition {:?} -> {:?} for {}",
            self.status,
            next,
            self.source.rel_path.display()
        );
        self.status = next;
    }

    pub(crate) fn fail(&mut self, error: GrabError) {
        self.advance(FileStatus::Failed);
        self.error = Some(error);
    }
}

/// Cancellation flag for a session, chained to the process shutdown flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    own: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also reports cancelled once `shutdown` is set
    pub fn child_of(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            own: Arc::new(AtomicBool::new(false)),
            parent: Some(shutdown),
        }
    }

    pub fn cancel(&self) {
        self.own.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.own.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .is_some_and(|p| p.load(Ordering::SeqCst))
    }
}

/// Counts derived from a session's records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounts {
    pub discovered: u64,
    pub copied: u64,
    pub skipped: u64,
    pub failed: u64,
    pub deleted: u64,
    pub bytes_copied: u64,
}

/// Runtime binding of a profile to a mounted volume
#[derive(Debug)]
pub struct DeviceSession {
    pub profile: GrabProfile,
    pub volume: MountedVolume,
    pub started_at: DateTime<Local>,
    pub delete_after_copy: bool,
    pub records: Vec<FileRecord>,
}

impl DeviceSession {
    pub fn new(profile: GrabProfile, volume: MountedVolume, global_delete: bool) -> Self {
        let delete_after_copy = profile.effective_delete(global_delete);
        Self {
            profile,
            volume,
            started_at: Local::now(),
            delete_after_copy,
            records: Vec::new(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.volume.identity
    }

    /// Walk the volume and create a Pending record per accepted file
    pub fn discover(&mut self, rules: &PathRules) -> usize {
        self.records = rules
            .candidates(&self.volume.mount_path)
            .map(FileRecord::new)
            .collect();
        debug!(
            "Discovered {} files on {} for profile '{}'",
            self.records.len(),
            self.volume.identity,
            self.profile.name
        );
        self.records.len()
    }

    pub fn counts(&self) -> SessionCounts {
        let mut counts = SessionCounts {
            discovered: self.records.len() as u64,
            ..Default::default()
        };
        for record in &self.records {
            match record.status {
                FileStatus::Skipped => counts.skipped += 1,
                FileStatus::Failed => counts.failed += 1,
                status if status.is_copied() => {
                    counts.copied += 1;
                    counts.bytes_copied += record.source.size;
                    if status == FileStatus::Deleted {
                        counts.deleted += 1;
                    }
                }
                _ => {}
            }
        }
        counts
    }

    /// Records that ended in Failed
    pub fn failures(&self) -> impl Iterator<Item = &FileRecord> {
        self.records
            .iter()
            .filter(|r| r.status == FileStatus::Failed)
    }
}
