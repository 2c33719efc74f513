//! Device abstraction traits for testability
//!
//! This module defines the types and traits that sit between the grab
//! pipeline and the operating system, so that real mounts and in-memory
//! fixtures can be used interchangeably.
//!
//! # Architecture
//!
//! - `DeviceIdentity` / `MountedVolume` - what the monitor reports
//! - `DeviceEvent` - Attach/Detach notifications
//! - `MountSource` - enumerates currently mounted volumes
//! - `DeviceMonitor` - turns mount snapshots into a stream of events
//! - `VolumeIo` - file access on a mounted volume (read, delete, liveness)

use crate::core::error::Result;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Stable identity of a removable volume
///
/// The `key` is what grab state is stored under. It prefers the filesystem
/// UUID, then the label, then the device node, then the mount path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// State key, e.g. `uuid:1234-abcd` or `label:EOS_DIGITAL`
    pub key: String,
    /// Human-readable device name
    pub name: String,
    /// Filesystem label
    pub label: Option<String>,
    /// Filesystem UUID
    pub uuid: Option<String>,
    /// Block device node, e.g. `/dev/sdb1`
    pub device_node: Option<String>,
}

impl DeviceIdentity {
    /// Build an identity from whatever attributes are known about a volume
    pub fn new(
        label: Option<String>,
        uuid: Option<String>,
        device_node: Option<String>,
        mount_path: &Path,
    ) -> Self {
        let label = label.filter(|s| !s.trim().is_empty());
        let uuid = uuid.filter(|s| !s.trim().is_empty());
        let device_node = device_node.filter(|s| !s.trim().is_empty());

        let key = if let Some(uuid) = &uuid {
            format!("uuid:{}", uuid.to_lowercase())
        } else if let Some(label) = &label {
            format!("label:{}", label)
        } else if let Some(node) = &device_node {
            format!("dev:{}", node)
        } else {
            format!("path:{}", mount_path.display())
        };

        let name = label
            .clone()
            .or_else(|| uuid.clone())
            .or_else(|| {
                device_node
                    .as_deref()
                    .and_then(|n| Path::new(n).file_name())
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .or_else(|| {
                mount_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "device".to_string());

        Self {
            key,
            name,
            label,
            uuid,
            device_node,
        }
    }

    /// Label used for matching and templates (falls back to the device name)
    pub fn label_or_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

impl Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.key)
    }
}

/// A volume that is currently mounted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedVolume {
    pub identity: DeviceIdentity,
    pub mount_path: PathBuf,
    pub fs_type: Option<String>,
}

impl MountedVolume {
    pub fn new(identity: DeviceIdentity, mount_path: impl Into<PathBuf>) -> Self {
        Self {
            identity,
            mount_path: mount_path.into(),
            fs_type: None,
        }
    }
}

/// Events emitted by a device monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A volume appeared
    Attach(MountedVolume),
    /// A volume went away (or its session lost access to it)
    Detach(DeviceIdentity),
}

/// Enumerates currently mounted removable volumes
pub trait MountSource: Send + Sync {
    /// Take a snapshot of mounted volumes
    fn scan(&self) -> Result<Vec<MountedVolume>>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Produces Attach/Detach events on its own thread
pub trait DeviceMonitor: Send {
    /// Backend name for logs ("poll" or "watch")
    fn backend(&self) -> &'static str;

    /// Start monitoring. Events are sent until `stop` is called or the
    /// receiver is dropped.
    fn start(&mut self, events: Sender<DeviceEvent>) -> Result<()>;

    /// Channel for reporting a device whose mount became unreadable. The
    /// monitor forgets it, and attaches it again on a later scan if it is
    /// still mounted.
    fn lost_devices(&self) -> Sender<DeviceIdentity>;

    /// Stop monitoring and join the monitor thread
    fn stop(&mut self);
}

/// File access on a mounted volume
///
/// The transfer executor only touches source files through this trait so that
/// read failures, stalls and delete failures can be injected in tests.
pub trait VolumeIo: Send + Sync {
    /// Open a source file for reading
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Delete a source file
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Whether the mount root is still readable
    fn is_accessible(&self, root: &Path) -> bool;
}

/// `VolumeIo` backed by the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalVolumeIo;

impl VolumeIo for LocalVolumeIo {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn is_accessible(&self, root: &Path) -> bool {
        fs::read_dir(root).is_ok()
    }
}
