//! Grab supervisor
//!
//! Consumes device events and runs one session per attached device on its own
//! thread. A device is claimed in the state store for the duration of its
//! session, so a second Attach for the same identity is rejected rather than
//! queued. Detach cancels the matching session. A session that aborts because
//! its device became unreadable reports the identity back to the monitor, which
//! attaches the volume again on a later scan if it is still mounted.

use crate::core::config::{Config, GrabProfile};
use crate::core::config_watch::ConfigHandle;
use crate::core::error::GrabError;
use crate::core::notifier::{EventNotifier, NotificationEvent};
use crate::core::rename::{MediaInfoProbe, MetadataProbe, Renamer, TargetReservations};
use crate::core::rules::PathRules;
use crate::core::session::{CancelToken, DeviceSession};
use crate::core::state::{DeviceClaim, GrabStateStore};
use crate::core::transfer::{ProgressUpdate, TransferExecutor, TransferOptions};
use crate::device::profiles::ProfileMatcher;
use crate::device::{
    CommandMounter, DeviceEvent, DeviceIdentity, LocalVolumeIo, MountHelper, MountedVolume,
    VolumeIo,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the supervisor waits for an event before checking shutdown
const EVENT_TICK: Duration = Duration::from_millis(100);

/// Outcome of one device session
#[derive(Debug)]
pub struct SessionReport {
    pub event: NotificationEvent,
    /// Error that aborted the session, if any
    pub error: Option<GrabError>,
}

/// Shared collaborators of every session
#[derive(Clone)]
pub struct GrabContext {
    pub store: Arc<GrabStateStore>,
    pub io: Arc<dyn VolumeIo>,
    pub probe: Arc<dyn MetadataProbe>,
    pub notifier: Arc<dyn EventNotifier>,
    pub reservations: TargetReservations,
    /// Used for `mount.unmount_after`
    pub mounter: Arc<dyn MountHelper>,
}

impl GrabContext {
    /// Context with local file access and the `mediainfo` probe
    pub fn new(store: Arc<GrabStateStore>, notifier: Arc<dyn EventNotifier>) -> Self {
        Self {
            store,
            io: Arc::new(LocalVolumeIo),
            probe: Arc::new(MediaInfoProbe::default()),
            notifier,
            reservations: TargetReservations::new(),
            mounter: Arc::new(CommandMounter::default()),
        }
    }

    pub fn with_io(mut self, io: Arc<dyn VolumeIo>) -> Self {
        self.io = io;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn MetadataProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_mounter(mut self, mounter: Arc<dyn MountHelper>) -> Self {
        self.mounter = mounter;
        self
    }

    /// Run a full session for a claimed device: transfer, notify, record.
    pub fn run_session(
        &self,
        config: &Config,
        profile: GrabProfile,
        volume: MountedVolume,
        cancel: &CancelToken,
        progress: Option<Arc<dyn Fn(ProgressUpdate) + Send + Sync>>,
    ) -> SessionReport {
        let mut session = DeviceSession::new(profile, volume, config.delete_after_copy);

        let outcome = match PathRules::from_profile(&session.profile) {
            Ok(rules) => {
                let renamer = Renamer::new(session.profile.rename.clone(), Arc::clone(&self.probe));
                let mut options = TransferOptions::from_config(config);
                options.progress_callback = progress;

                let executor = TransferExecutor::new(
                    options,
                    Arc::clone(&self.store),
                    Arc::clone(&self.io),
                    self.reservations.clone(),
                );
                executor.run(&mut session, &rules, &renamer, cancel)
            }
            Err(e) => Err(GrabError::ConfigMismatch(format!(
                "profile '{}': {}",
                session.profile.name, e
            ))),
        };
        let error = outcome.err();

        let event = NotificationEvent::from_session(&session, error.as_ref());
        if let Err(e) = self.notifier.notify(&event) {
            warn!("Notifier '{}' failed: {}", self.notifier.name(), e);
        }
        if let Err(e) = self
            .store
            .record_session(session.identity(), event.session_record())
        {
            error!("Failed to record session for {}: {}", session.identity(), e);
        }

        SessionReport { event, error }
    }
}

/// Pick the profile for a volume, by name or by matcher
pub fn resolve_profile(
    config: &Config,
    volume: &MountedVolume,
    by_name: Option<&str>,
) -> std::result::Result<GrabProfile, GrabError> {
    if let Some(name) = by_name {
        return config
            .profile(name)
            .cloned()
            .ok_or_else(|| GrabError::ConfigMismatch(format!("no profile named '{}'", name)));
    }

    let matcher = ProfileMatcher::new(&config.profiles)
        .map_err(|e| GrabError::ConfigMismatch(e.to_string()))?;
    matcher.select(volume).cloned().ok_or_else(|| {
        GrabError::ConfigMismatch(format!("no profile matches {}", volume.identity))
    })
}

struct ActiveSession {
    cancel: CancelToken,
    handle: JoinHandle<SessionReport>,
}

/// Supervises device sessions
pub struct Grabber {
    config: ConfigHandle,
    context: GrabContext,
    shutdown_flag: Arc<AtomicBool>,
    active: HashMap<String, ActiveSession>,
}

impl Grabber {
    pub fn new(config: ConfigHandle, context: GrabContext, shutdown_flag: Arc<AtomicBool>) -> Self {
        Self {
            config,
            context,
            shutdown_flag,
            active: HashMap::new(),
        }
    }

    /// Number of sessions that have not been reaped yet
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.active.contains_key(key)
    }

    /// Process events until shutdown is requested or every sender is gone,
    /// then cancel and join the remaining sessions.
    ///
    /// `lost` is the monitor's `lost_devices` channel; a session that finds
    /// its device unreachable reports the identity there.
    pub fn run(&mut self, events: Receiver<DeviceEvent>, lost: Sender<DeviceIdentity>) {
        info!("Grabber started");

        while !self.shutdown_flag.load(Ordering::SeqCst) {
            match events.recv_timeout(EVENT_TICK) {
                Ok(event) => self.handle_event(event, &lost),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Event channel closed");
                    break;
                }
            }
            self.reap(false);
        }

        self.shutdown();
    }

    /// Handle a single event
    pub fn handle_event(&mut self, event: DeviceEvent, lost: &Sender<DeviceIdentity>) {
        // A finished session must be reaped before its identity can attach again
        self.reap(false);

        match event {
            DeviceEvent::Attach(volume) => self.attach(volume, lost),
            DeviceEvent::Detach(identity) => self.detach(&identity),
        }
    }

    fn attach(&mut self, volume: MountedVolume, lost: &Sender<DeviceIdentity>) {
        let config = self.config.snapshot();

        let profile = match resolve_profile(&config, &volume, None) {
            Ok(profile) => profile,
            Err(e) => {
                info!("Ignoring {}: {}", volume.identity, e);
                return;
            }
        };

        let claim = match self.context.store.claim(&volume.identity) {
            Ok(claim) => claim,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };

        info!(
            "Starting grab of {} at {} with profile '{}'",
            volume.identity,
            volume.mount_path.display(),
            profile.name
        );

        let key = volume.identity.key.clone();
        let cancel = CancelToken::child_of(Arc::clone(&self.shutdown_flag));
        let spawned = spawn_session(
            self.context.clone(),
            config,
            profile,
            volume,
            claim,
            cancel.clone(),
            lost.clone(),
        );

        match spawned {
            Ok(handle) => {
                self.active.insert(key, ActiveSession { cancel, handle });
            }
            Err(e) => error!("Failed to start session thread: {}", e),
        }
    }

    fn detach(&mut self, identity: &DeviceIdentity) {
        match self.active.get(&identity.key) {
            Some(session) => {
                info!("{} detached, cancelling its grab", identity);
                session.cancel.cancel();
            }
            None => debug!("Detach for {} with no running grab", identity),
        }
    }

    /// Join finished sessions; with `wait`, join all of them
    fn reap(&mut self, wait: bool) {
        let done: Vec<String> = self
            .active
            .iter()
            .filter(|(_, s)| wait || s.handle.is_finished())
            .map(|(k, _)| k.clone())
            .collect();

        for key in done {
            let Some(session) = self.active.remove(&key) else {
                continue;
            };
            match session.handle.join() {
                Ok(report) => debug!("Session for {} finished: {}", key, report.event),
                Err(_) => error!("Session thread for {} panicked", key),
            }
        }
    }

    fn shutdown(&mut self) {
        if !self.active.is_empty() {
            info!("Waiting for {} running grabs to stop...", self.active.len());
        }
        for session in self.active.values() {
            session.cancel.cancel();
        }
        self.reap(true);

        if let Err(e) = self.context.store.flush() {
            error!("Failed to flush grab state: {}", e);
        }
        info!("Grabber stopped");
    }
}

fn spawn_session(
    context: GrabContext,
    config: Arc<Config>,
    profile: GrabProfile,
    volume: MountedVolume,
    claim: DeviceClaim,
    cancel: CancelToken,
    lost: Sender<DeviceIdentity>,
) -> std::io::Result<JoinHandle<SessionReport>> {
    let thread_name = format!("grab-{}", volume.identity.name);

    thread::Builder::new().name(thread_name).spawn(move || {
        let identity = volume.identity.clone();
        let mount_path = volume.mount_path.clone();
        let report = context.run_session(&config, profile, volume, &cancel, None);

        if config.mount.unmount_after {
            match context.mounter.unmount(&mount_path) {
                Ok(()) => info!("Unmounted {}", mount_path.display()),
                Err(e) => warn!("Failed to unmount {}: {}", mount_path.display(), e),
            }
        }
        // Free the device before the monitor can offer it again
        drop(claim);

        if report.error.as_ref().is_some_and(GrabError::is_session_fatal) {
            warn!("{} became unreachable during its grab", identity);
            if lost.send(identity).is_err() {
                debug!("Monitor gone, not reporting lost device");
            }
        }
        report
    })
}
