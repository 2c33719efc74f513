//! Session completion events and their sinks
//!
//! Every finished session (successful, partial or aborted) produces one
//! `NotificationEvent`. Sinks never fail the pipeline: delivery errors are
//! logged by the caller and dropped.

use crate::core::config::NotifierConfig;
use crate::core::error::GrabError;
use crate::core::session::DeviceSession;
use crate::core::state::SessionRecord;
use chrono::{DateTime, Local, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Notifier delivery errors
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One error reported in a session summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Source file, absent for session-level errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub kind: String,
    pub message: String,
}

impl ErrorEntry {
    fn from_error(path: Option<&Path>, err: &GrabError) -> Self {
        Self {
            path: path.map(Path::to_path_buf),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Immutable summary of a finished session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub identity: String,
    pub label: String,
    pub profile: String,
    pub mount_path: PathBuf,
    pub copied: u64,
    pub skipped: u64,
    pub failed: u64,
    pub deleted: u64,
    pub bytes_copied: u64,
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub duration_ms: u64,
    pub aborted: bool,
    pub errors: Vec<ErrorEntry>,
}

impl NotificationEvent {
    /// Summarize a session. `outcome` is the error that aborted it, if any.
    pub fn from_session(session: &DeviceSession, outcome: Option<&GrabError>) -> Self {
        let ended_at = Local::now();
        let counts = session.counts();

        let mut errors: Vec<ErrorEntry> = session
            .records
            .iter()
            .filter_map(|r| {
                r.error
                    .as_ref()
                    .map(|e| ErrorEntry::from_error(Some(&r.source.rel_path), e))
            })
            .collect();
        if let Some(err) = outcome {
            errors.push(ErrorEntry::from_error(None, err));
        }

        Self {
            identity: session.volume.identity.key.clone(),
            label: session.volume.identity.name.clone(),
            profile: session.profile.name.clone(),
            mount_path: session.volume.mount_path.clone(),
            copied: counts.copied,
            skipped: counts.skipped,
            failed: counts.failed,
            deleted: counts.deleted,
            bytes_copied: counts.bytes_copied,
            started_at: session.started_at,
            ended_at,
            duration_ms: (ended_at - session.started_at).num_milliseconds().max(0) as u64,
            aborted: outcome.is_some(),
            errors,
        }
    }

    /// History entry for the state store
    pub fn session_record(&self) -> SessionRecord {
        SessionRecord {
            profile: self.profile.clone(),
            started_at: self.started_at.with_timezone(&Utc),
            ended_at: self.ended_at.with_timezone(&Utc),
            copied: self.copied,
            skipped: self.skipped,
            failed: self.failed,
            deleted: self.deleted,
            bytes_copied: self.bytes_copied,
            aborted: self.aborted,
        }
    }
}

impl std::fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}]: copied {}, skipped {}, failed {}, deleted {} in {:.1}s{}",
            self.label,
            self.profile,
            self.copied,
            self.skipped,
            self.failed,
            self.deleted,
            self.duration_ms as f64 / 1000.0,
            if self.aborted { " (aborted)" } else { "" }
        )
    }
}

/// Receives session summaries
pub trait EventNotifier: Send + Sync {
    /// Sink name for logs
    fn name(&self) -> &str;

    fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// Writes summaries to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

impl EventNotifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        if event.failed > 0 || event.aborted {
            warn!("Grab finished with errors: {}", event);
            for err in &event.errors {
                match &err.path {
                    Some(path) => warn!("  {} ({}): {}", path.display(), err.kind, err.message),
                    None => warn!("  {}: {}", err.kind, err.message),
                }
            }
        } else {
            info!("Grab finished: {}", event);
        }
        Ok(())
    }
}

/// Appends one JSON object per summary to a file
#[derive(Debug)]
pub struct JsonLinesNotifier {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl EventNotifier for JsonLinesNotifier {
    fn name(&self) -> &str {
        "json-lines"
    }

    fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Delivers to several sinks; one failing sink does not stop the others
#[derive(Default)]
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn EventNotifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log sink plus whatever the configuration enables
    pub fn from_config(config: &NotifierConfig) -> Self {
        let mut fanout = Self::new().with(Arc::new(LogNotifier));
        if let Some(path) = &config.json_lines {
            fanout = fanout.with(Arc::new(JsonLinesNotifier::new(path)));
        }
        fanout
    }

    pub fn with(mut self, sink: Arc<dyn EventNotifier>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventNotifier for FanoutNotifier {
    fn name(&self) -> &str {
        "fanout"
    }

    fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        for sink in &self.sinks {
            if let Err(e) = sink.notify(event) {
                warn!("Notifier '{}' failed: {}", sink.name(), e);
            }
        }
        Ok(())
    }
}
