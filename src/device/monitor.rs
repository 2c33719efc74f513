//! Device Monitor Module
//!
//! Turns snapshots of mounted volumes into Attach/Detach events. Two
//! backends share the same diff engine (`VolumeTracker`):
//!
//! - `PollingMonitor` re-scans the mount source on a fixed interval.
//! - `WatchMonitor` re-scans whenever the mount roots change and also on a
//!   slow interval, so unmounts that produce no filesystem event (abrupt
//!   removal, mounts onto existing directories) are still noticed.
//!
//! A session that finds its device unreadable reports the identity through
//! `DeviceMonitor::lost_devices`. The monitor drops it from its snapshot, so
//! the next scan attaches the volume again if it is still mounted.

use crate::core::config::{Config, MonitorBackend, MountSourceKind};
use crate::core::error::{GrabError, Result};
use crate::device::automount::{AutoMountSource, CommandMounter};
use crate::device::mounts::{DirectoryMounts, ProcMounts};
use crate::device::traits::{
    DeviceEvent, DeviceIdentity, DeviceMonitor, MountSource, MountedVolume,
};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, trace, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often a sleeping monitor checks its shutdown flag
const SHUTDOWN_TICK: Duration = Duration::from_millis(50);

/// Watch backend re-scans this many poll intervals apart
const WATCH_RESCAN_FACTOR: u32 = 5;

// =============================================================================
// Volume tracker
// =============================================================================

/// Remembers the last snapshot and computes the events between snapshots
#[derive(Debug, Default)]
pub struct VolumeTracker {
    known: BTreeMap<String, MountedVolume>,
}

impl VolumeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the known set with `current` and return what changed.
    ///
    /// Vanished identities produce `Detach`, new ones `Attach`; an identity
    /// whose mount path changed produces `Detach` followed by `Attach`.
    pub fn reconcile(&mut self, current: Vec<MountedVolume>) -> Vec<DeviceEvent> {
        let mut next = BTreeMap::new();
        for volume in current {
            match next.entry(volume.identity.key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(volume);
                }
                Entry::Occupied(existing) => {
                    debug!(
                        "Identity {} is mounted twice ({} and {}); ignoring the second",
                        existing.key(),
                        existing.get().mount_path.display(),
                        volume.mount_path.display()
                    );
                }
            }
        }

        let mut events = Vec::new();
        for (key, old) in &self.known {
            match next.get(key) {
                None => events.push(DeviceEvent::Detach(old.identity.clone())),
                Some(new) if new.mount_path != old.mount_path => {
                    events.push(DeviceEvent::Detach(old.identity.clone()));
                    events.push(DeviceEvent::Attach(new.clone()));
                }
                Some(_) => {}
            }
        }
        for (key, new) in &next {
            if !self.known.contains_key(key) {
                events.push(DeviceEvent::Attach(new.clone()));
            }
        }

        self.known = next;
        events
    }

    /// Drop an identity from the snapshot so the next reconcile attaches it
    /// again. Returns whether it was known.
    pub fn forget(&mut self, key: &str) -> bool {
        self.known.remove(key).is_some()
    }

    /// Volumes in the last snapshot
    pub fn volumes(&self) -> impl Iterator<Item = &MountedVolume> {
        self.known.values()
    }
}

/// Forget every identity reported lost since the last call
fn forget_lost(lost: &Receiver<DeviceIdentity>, tracker: &mut VolumeTracker) {
    for identity in lost.try_iter() {
        if tracker.forget(&identity.key) {
            debug!("{} reported lost; it will be attached again if still mounted", identity);
        }
    }
}

/// Scan once and forward the changes. Returns false once nobody is listening.
fn scan_and_publish(
    source: &dyn MountSource,
    tracker: &mut VolumeTracker,
    events: &Sender<DeviceEvent>,
) -> bool {
    let volumes = match source.scan() {
        Ok(volumes) => volumes,
        Err(e) => {
            // Don't spam errors, just try again next time
            trace!("Error scanning {} mounts: {}", source.name(), e);
            return true;
        }
    };

    for event in tracker.reconcile(volumes) {
        match &event {
            DeviceEvent::Attach(v) => {
                info!("Volume attached: {} at {}", v.identity, v.mount_path.display())
            }
            DeviceEvent::Detach(id) => info!("Volume detached: {}", id),
        }
        if events.send(event).is_err() {
            debug!("Event receiver gone, stopping monitor");
            return false;
        }
    }
    true
}

/// Sleep for `duration` unless shutdown is requested first
fn sleep_unless_shutdown(flag: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !flag.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(SHUTDOWN_TICK.min(deadline - now));
    }
}

fn join_monitor(flag: &AtomicBool, handle: &mut Option<JoinHandle<()>>, backend: &str) {
    let Some(handle) = handle.take() else {
        return;
    };
    info!("Stopping {} device monitor...", backend);
    flag.store(true, Ordering::SeqCst);
    let _ = handle.join();
    info!("Device monitor stopped");
}

// =============================================================================
// Polling backend
// =============================================================================

/// Re-scans the mount source on a fixed interval
pub struct PollingMonitor {
    source: Arc<dyn MountSource>,
    interval: Duration,
    lost: (Sender<DeviceIdentity>, Receiver<DeviceIdentity>),
    shutdown_flag: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl PollingMonitor {
    pub fn new(source: Arc<dyn MountSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            lost: unbounded(),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }
}

impl DeviceMonitor for PollingMonitor {
    fn backend(&self) -> &'static str {
        "poll"
    }

    fn lost_devices(&self) -> Sender<DeviceIdentity> {
        self.lost.0.clone()
    }

    fn start(&mut self, events: Sender<DeviceEvent>) -> Result<()> {
        if self.thread_handle.is_some() {
            return Err(GrabError::IoError("Monitor is already running".to_string()));
        }

        self.shutdown_flag.store(false, Ordering::SeqCst);
        let source = Arc::clone(&self.source);
        let lost = self.lost.1.clone();
        let shutdown_flag = Arc::clone(&self.shutdown_flag);
        let interval = self.interval;

        let handle = thread::Builder::new()
            .name("device-monitor".to_string())
            .spawn(move || {
                let mut tracker = VolumeTracker::new();
                while !shutdown_flag.load(Ordering::SeqCst) {
                    forget_lost(&lost, &mut tracker);
                    if !scan_and_publish(source.as_ref(), &mut tracker, &events) {
                        break;
                    }
                    sleep_unless_shutdown(&shutdown_flag, interval);
                }
                debug!("Polling monitor loop exited");
            })?;

        self.thread_handle = Some(handle);
        info!(
            "Device monitor started (poll every {:?}, {} source)",
            self.interval,
            self.source.name()
        );
        Ok(())
    }

    fn stop(&mut self) {
        join_monitor(&self.shutdown_flag, &mut self.thread_handle, "poll");
    }
}

impl Drop for PollingMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Watch backend
// =============================================================================

/// Re-scans on filesystem events under the mount roots, plus a slow rescan
pub struct WatchMonitor {
    source: Arc<dyn MountSource>,
    watch_paths: Vec<PathBuf>,
    rescan_interval: Duration,
    lost: (Sender<DeviceIdentity>, Receiver<DeviceIdentity>),
    shutdown_flag: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl WatchMonitor {
    pub fn new(
        source: Arc<dyn MountSource>,
        watch_paths: Vec<PathBuf>,
        rescan_interval: Duration,
    ) -> Self {
        Self {
            source,
            watch_paths,
            rescan_interval,
            lost: unbounded(),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }
}

impl DeviceMonitor for WatchMonitor {
    fn backend(&self) -> &'static str {
        "watch"
    }

    fn lost_devices(&self) -> Sender<DeviceIdentity> {
        self.lost.0.clone()
    }

    fn start(&mut self, events: Sender<DeviceEvent>) -> Result<()> {
        if self.thread_handle.is_some() {
            return Err(GrabError::IoError("Monitor is already running".to_string()));
        }

        let (tx_notify, rx_notify) = unbounded();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                let _ = tx_notify.send(res);
            })
            .map_err(|e| GrabError::IoError(format!("Failed to create watcher: {}", e)))?;

        let mut watching = 0;
        for path in &self.watch_paths {
            match watcher.watch(path, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    debug!("Watching {}", path.display());
                    watching += 1;
                }
                Err(e) => debug!("Not watching {}: {}", path.display(), e),
            }
        }
        if watching == 0 {
            return Err(GrabError::IoError(
                "None of the mount roots can be watched".to_string(),
            ));
        }

        self.shutdown_flag.store(false, Ordering::SeqCst);
        let source = Arc::clone(&self.source);
        let lost = self.lost.1.clone();
        let shutdown_flag = Arc::clone(&self.shutdown_flag);
        let rescan_interval = self.rescan_interval;

        let handle = thread::Builder::new()
            .name("device-monitor".to_string())
            .spawn(move || {
                // The watcher stops delivering once dropped
                let _watcher = watcher;
                let mut tracker = VolumeTracker::new();
                let mut last_scan = Instant::now();
                if !scan_and_publish(source.as_ref(), &mut tracker, &events) {
                    return;
                }

                while !shutdown_flag.load(Ordering::SeqCst) {
                    let mut changed = false;
                    match rx_notify.recv_timeout(Duration::from_millis(250)) {
                        Ok(Ok(event)) => {
                            trace!("Mount root event: {:?}", event.kind);
                            changed = true;
                            // Coalesce a burst of events into one scan
                            while rx_notify.try_recv().is_ok() {}
                        }
                        Ok(Err(e)) => warn!("Watch error: {}", e),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            warn!("Watcher channel closed");
                            break;
                        }
                    }

                    // Lost devices come back on the slow rescan, so an
                    // unreadable volume is not retried in a tight loop
                    forget_lost(&lost, &mut tracker);
                    if changed || last_scan.elapsed() >= rescan_interval {
                        last_scan = Instant::now();
                        if !scan_and_publish(source.as_ref(), &mut tracker, &events) {
                            break;
                        }
                    }
                }
                debug!("Watch monitor loop exited");
            })?;

        self.thread_handle = Some(handle);
        info!(
            "Device monitor started (watching {} roots, rescan every {:?})",
            watching, self.rescan_interval
        );
        Ok(())
    }

    fn stop(&mut self) {
        join_monitor(&self.shutdown_flag, &mut self.thread_handle, "watch");
    }
}

impl Drop for WatchMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Construction from configuration
// =============================================================================

/// Mount source selected by the configuration
pub fn mount_source_from_config(config: &Config) -> Arc<dyn MountSource> {
    match config.monitor.source {
        MountSourceKind::ProcMounts => {
            let mounts = Arc::new(ProcMounts::new(
                config.monitor.effective_mount_roots(&config.mount_base),
            ));
            if !config.mount.auto_mount {
                return mounts;
            }
            Arc::new(AutoMountSource::new(
                mounts,
                Arc::new(CommandMounter::from_config(&config.mount)),
                &config.mount_base,
            ))
        }
        MountSourceKind::Directory => Arc::new(DirectoryMounts::new(&config.mount_base)),
    }
}

/// Device monitor selected by the configuration
pub fn monitor_from_config(config: &Config) -> Box<dyn DeviceMonitor> {
    let source = mount_source_from_config(config);
    let interval = config.monitor.poll_interval();

    match config.monitor.backend {
        MonitorBackend::Poll => Box::new(PollingMonitor::new(source, interval)),
        MonitorBackend::Watch => {
            let mut watch_paths = config.monitor.effective_mount_roots(&config.mount_base);
            if config.mount.auto_mount {
                // New partitions show up here before anything mounts them
                watch_paths.push(PathBuf::from("/dev/disk/by-uuid"));
            }
            Box::new(WatchMonitor::new(
                source,
                watch_paths,
                interval * WATCH_RESCAN_FACTOR,
            ))
        }
    }
}
