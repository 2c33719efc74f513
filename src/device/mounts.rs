//! Mount discovery
//!
//! `ProcMounts` reads the kernel mount table and keeps block devices mounted
//! under the configured roots, resolving their label and UUID through the
//! `/dev/disk/by-*` symlinks. `DirectoryMounts` treats every subdirectory of
//! a base directory as a mounted volume.

use crate::core::error::{GrabError, Result};
use crate::device::traits::{DeviceIdentity, MountSource, MountedVolume};
use log::{debug, trace};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Filesystem locations consulted by `ProcMounts`
#[derive(Debug, Clone)]
pub struct ProcMountsPaths {
    pub mounts_file: PathBuf,
    pub by_label: PathBuf,
    pub by_uuid: PathBuf,
    /// Only mount sources below this directory are block devices
    pub device_dir: PathBuf,
}

impl Default for ProcMountsPaths {
    fn default() -> Self {
        Self {
            mounts_file: PathBuf::from("/proc/self/mounts"),
            by_label: PathBuf::from("/dev/disk/by-label"),
            by_uuid: PathBuf::from("/dev/disk/by-uuid"),
            device_dir: PathBuf::from("/dev"),
        }
    }
}

/// One line of the mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
}

/// Decode the octal escapes (`\040` etc.) used in the mount table
pub fn unescape_mount_field(field: &str) -> String {
    decode_escapes(field, |s| {
        let digits = s.get(..3)?;
        if !digits.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
            return None;
        }
        u8::from_str_radix(digits, 8).ok().map(|b| (b, 3))
    })
}

/// Decode the `\xHH` escapes udev uses in by-label link names
pub fn unescape_udev_name(name: &str) -> String {
    decode_escapes(name, |s| {
        let hex = s.strip_prefix('x')?.get(..2)?;
        u8::from_str_radix(hex, 16).ok().map(|b| (b, 3))
    })
}

/// Replace `\` escapes; `decode` gets the text after the backslash and returns
/// the byte plus how many characters it consumed.
fn decode_escapes(input: &str, decode: impl Fn(&str) -> Option<(u8, usize)>) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('\\') {
        out.extend_from_slice(rest[..pos].as_bytes());
        let after = &rest[pos + 1..];
        match decode(after) {
            Some((byte, used)) => {
                out.push(byte);
                rest = &after[used..];
            }
            None => {
                out.push(b'\\');
                rest = after;
            }
        }
    }
    out.extend_from_slice(rest.as_bytes());

    String::from_utf8_lossy(&out).into_owned()
}

/// Parse the contents of `/proc/self/mounts`
pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                device: unescape_mount_field(device),
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

/// Map each device a by-* directory points at to the (decoded) link name
fn link_index(dir: &Path) -> HashMap<PathBuf, String> {
    let Ok(entries) = fs::read_dir(dir) else {
        trace!("{} not readable", dir.display());
        return HashMap::new();
    };

    entries
        .flatten()
        .filter_map(|entry| {
            let target = fs::canonicalize(entry.path()).ok()?;
            let name = unescape_udev_name(&entry.file_name().to_string_lossy());
            Some((target, name))
        })
        .collect()
}

/// Block devices mounted under the configured roots
#[derive(Debug, Clone)]
pub struct ProcMounts {
    roots: Vec<PathBuf>,
    paths: ProcMountsPaths,
}

impl ProcMounts {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self::with_paths(roots, ProcMountsPaths::default())
    }

    pub fn with_paths(roots: Vec<PathBuf>, paths: ProcMountsPaths) -> Self {
        Self { roots, paths }
    }

    fn under_roots(&self, mount_point: &Path) -> bool {
        self.roots
            .iter()
            .any(|root| mount_point != root && mount_point.starts_with(root))
    }
}

impl MountSource for ProcMounts {
    fn scan(&self) -> Result<Vec<MountedVolume>> {
        let content = fs::read_to_string(&self.paths.mounts_file).map_err(|e| {
            GrabError::IoError(format!(
                "Failed to read {}: {}",
                self.paths.mounts_file.display(),
                e
            ))
        })?;

        let labels = link_index(&self.paths.by_label);
        let uuids = link_index(&self.paths.by_uuid);

        let volumes = parse_mount_table(&content)
            .into_iter()
            .filter(|m| Path::new(&m.device).starts_with(&self.paths.device_dir))
            .filter(|m| self.under_roots(&m.mount_point))
            .map(|m| {
                let device = fs::canonicalize(&m.device).unwrap_or_else(|_| PathBuf::from(&m.device));
                let identity = DeviceIdentity::new(
                    labels.get(&device).cloned(),
                    uuids.get(&device).cloned(),
                    Some(device.to_string_lossy().into_owned()),
                    &m.mount_point,
                );
                MountedVolume {
                    identity,
                    mount_path: m.mount_point,
                    fs_type: Some(m.fs_type),
                }
            })
            .collect();

        Ok(volumes)
    }

    fn name(&self) -> &'static str {
        "proc-mounts"
    }
}

/// Every subdirectory of `base` is a volume labelled by its name
#[derive(Debug, Clone)]
pub struct DirectoryMounts {
    base: PathBuf,
}

impl DirectoryMounts {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl MountSource for DirectoryMounts {
    fn scan(&self) -> Result<Vec<MountedVolume>> {
        let entries = match fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Mount base {} does not exist", self.base.display());
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(GrabError::IoError(format!(
                    "Failed to read {}: {}",
                    self.base.display(),
                    e
                )))
            }
        };

        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        Ok(dirs
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                let identity = DeviceIdentity::new(Some(name), None, None, &path);
                Some(MountedVolume::new(identity, path))
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "directory"
    }
}
