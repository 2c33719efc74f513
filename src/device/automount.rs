//! Mounting removable partitions
//!
//! With `mount.auto_mount`, removable partitions that nothing has mounted are
//! mounted at `mount_base/<device name>` so the mount source can report them.
//! Each partition is mounted at most once while it stays present; after it is
//! unplugged and inserted again it is mounted again. With `mount.unmount_after`
//! the grabber unmounts a volume once its session ends.
//!
//! Removable partitions are found through sysfs: every `/sys/block/<disk>`
//! whose `removable` flag is 1 contributes its partitions, or the disk itself
//! when it has none.

use crate::core::config::MountConfig;
use crate::core::error::Result;
use crate::device::mounts::parse_mount_table;
use crate::device::traits::{MountSource, MountedVolume};
use log::{debug, info, trace, warn};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

/// Mounts and unmounts block devices
pub trait MountHelper: Send + Sync {
    fn mount(&self, device: &Path, target: &Path) -> io::Result<()>;

    fn unmount(&self, target: &Path) -> io::Result<()>;
}

/// `MountHelper` running the system `mount` and `umount` commands
#[derive(Debug, Clone, Default)]
pub struct CommandMounter {
    /// Passed to `mount -o`
    options: Option<String>,
}

impl CommandMounter {
    pub fn new(options: Option<String>) -> Self {
        Self { options }
    }

    pub fn from_config(config: &MountConfig) -> Self {
        Self::new(config.options.clone())
    }
}

fn run(command: &mut Command, program: &str) -> io::Result<()> {
    let output = command
        .output()
        .map_err(|e| io::Error::new(e.kind(), format!("failed to run {}: {}", program, e)))?;
    if output.status.success() {
        return Ok(());
    }
    Err(io::Error::new(
        io::ErrorKind::Other,
        format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    ))
}

impl MountHelper for CommandMounter {
    fn mount(&self, device: &Path, target: &Path) -> io::Result<()> {
        let mut command = Command::new("mount");
        if let Some(options) = &self.options {
            command.arg("-o").arg(options);
        }
        command.arg(device).arg(target);
        run(&mut command, "mount")
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        run(Command::new("umount").arg(target), "umount")
    }
}

/// Filesystem locations consulted by `AutoMountSource`
#[derive(Debug, Clone)]
pub struct AutoMountPaths {
    pub sys_block: PathBuf,
    pub device_dir: PathBuf,
    pub mounts_file: PathBuf,
}

impl Default for AutoMountPaths {
    fn default() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
            device_dir: PathBuf::from("/dev"),
            mounts_file: PathBuf::from("/proc/self/mounts"),
        }
    }
}

/// Device nodes of all partitions on removable disks, sorted
pub fn removable_partitions(sys_block: &Path, device_dir: &Path) -> Vec<PathBuf> {
    let Ok(disks) = fs::read_dir(sys_block) else {
        trace!("{} not readable", sys_block.display());
        return Vec::new();
    };

    let mut nodes = Vec::new();
    for disk in disks.flatten() {
        let disk_path = disk.path();
        let removable = fs::read_to_string(disk_path.join("removable"))
            .map(|s| s.trim() == "1")
            .unwrap_or(false);
        if !removable {
            continue;
        }

        let mut partitions: Vec<String> = fs::read_dir(&disk_path)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.path().join("partition").is_file())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        if partitions.is_empty() {
            partitions.push(disk.file_name().to_string_lossy().into_owned());
        }
        nodes.extend(partitions.into_iter().map(|name| device_dir.join(name)));
    }

    nodes.sort();
    nodes
}

/// A mount source that first mounts removable partitions nobody has mounted
pub struct AutoMountSource {
    inner: Arc<dyn MountSource>,
    helper: Arc<dyn MountHelper>,
    mount_base: PathBuf,
    paths: AutoMountPaths,
    /// Partitions seen mounted or already mounted once; cleared on removal
    handled: Mutex<HashSet<PathBuf>>,
}

impl AutoMountSource {
    pub fn new(
        inner: Arc<dyn MountSource>,
        helper: Arc<dyn MountHelper>,
        mount_base: impl Into<PathBuf>,
    ) -> Self {
        Self::with_paths(inner, helper, mount_base, AutoMountPaths::default())
    }

    pub fn with_paths(
        inner: Arc<dyn MountSource>,
        helper: Arc<dyn MountHelper>,
        mount_base: impl Into<PathBuf>,
        paths: AutoMountPaths,
    ) -> Self {
        Self {
            inner,
            helper,
            mount_base: mount_base.into(),
            paths,
            handled: Mutex::new(HashSet::new()),
        }
    }

    fn mounted_devices(&self) -> HashSet<PathBuf> {
        let content = fs::read_to_string(&self.paths.mounts_file).unwrap_or_default();
        parse_mount_table(&content)
            .into_iter()
            .map(|m| fs::canonicalize(&m.device).unwrap_or_else(|_| PathBuf::from(m.device)))
            .collect()
    }

    /// Mount what needs mounting. Returns whether anything was mounted.
    fn mount_new_partitions(&self) -> bool {
        let present = removable_partitions(&self.paths.sys_block, &self.paths.device_dir);
        let mounted = self.mounted_devices();
        let mut handled = self.handled.lock().unwrap_or_else(|e| e.into_inner());

        // A partition that went away is mounted again when it comes back
        handled.retain(|node| present.contains(node));

        let mut mounted_any = false;
        for node in present {
            let canonical = fs::canonicalize(&node).unwrap_or_else(|_| node.clone());
            if mounted.contains(&canonical) || mounted.contains(&node) {
                handled.insert(node);
                continue;
            }
            if !handled.insert(node.clone()) {
                continue;
            }

            let Some(name) = node.file_name() else {
                continue;
            };
            let target = self.mount_base.join(name);
            if let Err(e) = fs::create_dir_all(&target) {
                warn!("Failed to create mount point {}: {}", target.display(), e);
                continue;
            }

            match self.helper.mount(&node, &target) {
                Ok(()) => {
                    info!("Mounted {} at {}", node.display(), target.display());
                    mounted_any = true;
                }
                Err(e) => {
                    warn!("Failed to mount {}: {}", node.display(), e);
                    // Leave no empty mount point behind
                    let _ = fs::remove_dir(&target);
                }
            }
        }
        mounted_any
    }
}

impl MountSource for AutoMountSource {
    fn scan(&self) -> Result<Vec<MountedVolume>> {
        if self.mount_new_partitions() {
            debug!("Re-reading mounts after mounting new partitions");
        }
        self.inner.scan()
    }

    fn name(&self) -> &'static str {
        "proc-mounts+auto-mount"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mounts::{ProcMounts, ProcMountsPaths};
    use crate::testdb::RecordingMounter;
    use tempfile::TempDir;

    struct FakeSystem {
        _tmp: TempDir,
        root: PathBuf,
        paths: AutoMountPaths,
    }

    impl FakeSystem {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let root = fs::canonicalize(tmp.path()).unwrap();
            let paths = AutoMountPaths {
                sys_block: root.join("sys/block"),
                device_dir: root.join("dev"),
                mounts_file: root.join("mounts"),
            };
            fs::create_dir_all(&paths.sys_block).unwrap();
            fs::create_dir_all(&paths.device_dir).unwrap();
            fs::write(&paths.mounts_file, "").unwrap();
            Self {
                _tmp: tmp,
                root,
                paths,
            }
        }

        fn add_disk(&self, disk: &str, removable: bool, partitions: &[&str]) {
            let dir = self.paths.sys_block.join(disk);
            fs::create_dir_all(dir.join("queue")).unwrap();
            fs::write(dir.join("removable"), if removable { "1\n" } else { "0\n" }).unwrap();
            for part in partitions {
                fs::create_dir_all(dir.join(part)).unwrap();
                fs::write(dir.join(part).join("partition"), "1\n").unwrap();
                fs::write(self.paths.device_dir.join(part), b"").unwrap();
            }
            fs::write(self.paths.device_dir.join(disk), b"").unwrap();
        }

        fn remove_disk(&self, disk: &str) {
            fs::remove_dir_all(self.paths.sys_block.join(disk)).unwrap();
        }

        fn mount_base(&self) -> PathBuf {
            self.root.join("media")
        }

        fn source(&self, mounter: &RecordingMounter) -> AutoMountSource {
            let inner = ProcMounts::with_paths(
                vec![self.mount_base()],
                ProcMountsPaths {
                    mounts_file: self.paths.mounts_file.clone(),
                    by_label: self.root.join("by-label"),
                    by_uuid: self.root.join("by-uuid"),
                    device_dir: self.paths.device_dir.clone(),
                },
            );
            AutoMountSource::with_paths(
                Arc::new(inner),
                Arc::new(mounter.clone()),
                self.mount_base(),
                self.paths.clone(),
            )
        }
    }

    #[test]
    fn test_removable_partitions() {
        let sys = FakeSystem::new();
        sys.add_disk("sda", false, &["sda1"]);
        sys.add_disk("sdb", true, &["sdb2", "sdb1"]);
        sys.add_disk("mmcblk0", true, &[]);

        let dev = &sys.paths.device_dir;
        assert_eq!(
            removable_partitions(&sys.paths.sys_block, dev),
            vec![dev.join("mmcblk0"), dev.join("sdb1"), dev.join("sdb2")]
        );
        assert!(removable_partitions(&sys.root.join("missing"), dev).is_empty());
    }

    #[test]
    fn test_auto_mount_once_per_insertion() {
        let sys = FakeSystem::new();
        sys.add_disk("sdb", true, &["sdb1"]);
        let mounter = RecordingMounter::new(&sys.paths.mounts_file);
        let source = sys.source(&mounter);
        let target = sys.mount_base().join("sdb1");

        let volumes = source.scan().unwrap();
        assert_eq!(mounter.mounted(), vec![target.clone()]);
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].mount_path, target);

        source.scan().unwrap();
        assert_eq!(mounter.mounted().len(), 1);

        // Unmounted after its grab: stays unmounted while inserted
        mounter.unmount(&target).unwrap();
        assert!(source.scan().unwrap().is_empty());
        assert_eq!(mounter.mounted().len(), 1);

        // Re-inserted
        sys.remove_disk("sdb");
        source.scan().unwrap();
        sys.add_disk("sdb", true, &["sdb1"]);
        assert_eq!(source.scan().unwrap().len(), 1);
        assert_eq!(mounter.mounted().len(), 2);
    }

    #[test]
    fn test_mounted_elsewhere_is_left_alone() {
        let sys = FakeSystem::new();
        sys.add_disk("sdc", true, &["sdc1"]);
        fs::write(
            &sys.paths.mounts_file,
            format!("{}/sdc1 /mnt/other vfat rw 0 0\n", sys.paths.device_dir.display()),
        )
        .unwrap();

        let mounter = RecordingMounter::new(&sys.paths.mounts_file);
        let source = sys.source(&mounter);
        assert!(source.scan().unwrap().is_empty());
        assert!(mounter.mounted().is_empty());
    }

    #[test]
    fn test_failed_mount_not_retried() {
        let sys = FakeSystem::new();
        sys.add_disk("sdd", true, &["sdd1"]);
        let mounter = RecordingMounter::new(&sys.paths.mounts_file).failing();
        let source = sys.source(&mounter);

        assert!(source.scan().unwrap().is_empty());
        assert!(source.scan().unwrap().is_empty());
        assert_eq!(mounter.attempts(), 1);
        assert!(!sys.mount_base().join("sdd1").exists());
    }

    #[test]
    fn test_unmount_of_plain_directory_fails() {
        let tmp = TempDir::new().unwrap();
        assert!(CommandMounter::default().unmount(tmp.path()).is_err());
    }
}
