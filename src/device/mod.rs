//! Device detection module
//!
//! This module finds removable volumes and decides which grab profile applies
//! to them.
//!
//! # Submodules
//!
//! - `traits` - Device identity, events and the OS-facing traits
//! - `automount` - Mounting removable partitions nobody has mounted
//! - `mounts` - Mount sources (`/proc/self/mounts`, plain directories)
//! - `monitor` - Polling and watching monitors that emit Attach/Detach
//! - `profiles` - Profile matching

pub mod automount;
pub mod monitor;
pub mod mounts;
pub mod profiles;
pub mod traits;

pub use automount::{AutoMountSource, CommandMounter, MountHelper};
pub use monitor::{
    monitor_from_config, mount_source_from_config, PollingMonitor, VolumeTracker, WatchMonitor,
};
pub use mounts::{DirectoryMounts, ProcMounts};
pub use profiles::ProfileMatcher;
pub use traits::{
    DeviceEvent, DeviceIdentity, DeviceMonitor, LocalVolumeIo, MountSource, MountedVolume,
    VolumeIo,
};
