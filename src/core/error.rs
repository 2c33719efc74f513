//! Error types for the grab pipeline
//!
//! `GrabError` is the pipeline taxonomy. Per-file variants are collected into
//! the session summary; only `DeviceUnavailable` aborts a session.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the grab pipeline
#[derive(Error, Debug)]
pub enum GrabError {
    /// The mount root disappeared or became unreadable
    #[error("Device '{identity}' is no longer accessible at {}", mount_path.display())]
    DeviceUnavailable {
        identity: String,
        mount_path: PathBuf,
    },

    /// Media metadata could not be extracted (naming falls back to mtime)
    #[error("Metadata probe failed for '{}': {message}", path.display())]
    ProbeFailure { path: PathBuf, message: String },

    /// I/O error while copying a file
    #[error("Copy failed for '{}': {message}", path.display())]
    CopyFailure { path: PathBuf, message: String },

    /// Size or checksum mismatch after copy
    #[error("Verification failed for '{}': {message}", path.display())]
    VerifyMismatch { path: PathBuf, message: String },

    /// No progress within the configured I/O timeout
    #[error("Copy of '{}' stalled for more than {secs}s", path.display())]
    Stalled { path: PathBuf, secs: u64 },

    /// Detach or shutdown while the file was being copied
    #[error("Copy of '{}' was cancelled", path.display())]
    Cancelled { path: PathBuf },

    /// Completion could not be persisted; the source is kept
    #[error("Failed to record completion of '{}': {message}", path.display())]
    StateStoreFailure { path: PathBuf, message: String },

    /// Source could not be removed after a committed copy
    #[error("Failed to delete source '{}': {message}", path.display())]
    DeleteFailure { path: PathBuf, message: String },

    /// Another session already owns this device
    #[error("Device '{0}' already has an active grab session")]
    DeviceBusy(String),

    /// No profile matched the device (informational)
    #[error("No usable grab profile: {0}")]
    ConfigMismatch(String),

    /// General I/O error
    #[error("IO error: {0}")]
    IoError(String),
}

impl GrabError {
    /// Short machine-readable kind, used in notification payloads
    pub fn kind(&self) -> &'static str {
        match self {
            GrabError::DeviceUnavailable { .. } => "device_unavailable",
            GrabError::ProbeFailure { .. } => "probe_failure",
            GrabError::CopyFailure { .. } => "copy_failure",
            GrabError::VerifyMismatch { .. } => "verify_mismatch",
            GrabError::Stalled { .. } => "stalled",
            GrabError::Cancelled { .. } => "cancelled",
            GrabError::StateStoreFailure { .. } => "state_store_failure",
            GrabError::DeleteFailure { .. } => "delete_failure",
            GrabError::DeviceBusy(_) => "device_busy",
            GrabError::ConfigMismatch(_) => "config_mismatch",
            GrabError::IoError(_) => "io_error",
        }
    }

    /// Whether this error ends the whole session rather than one file
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, GrabError::DeviceUnavailable { .. })
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, GrabError>;

impl From<std::io::Error> for GrabError {
    fn from(err: std::io::Error) -> Self {
        GrabError::IoError(err.to_string())
    }
}
