//! End-to-end grab scenarios
//!
//! Each test drives a full session (or the whole supervisor) against volume
//! fixtures and checks what ends up on the destination, on the source and in
//! the grab state.

use super::{
    CollectingNotifier, FaultConfig, FaultyVolumeIo, ScriptedProbe, StaticMountSource,
    VolumeFixture,
};
use crate::core::config::{Config, GrabProfile, RenameConfig, RenameMethod, RenameStyle};
use crate::core::config_watch::ConfigHandle;
use crate::core::error::GrabError;
use crate::core::grabber::{GrabContext, Grabber, SessionReport};
use crate::core::rename::Renamer;
use crate::core::rules::{PathRules, SourceFile};
use crate::core::session::{fingerprint, CancelToken};
use crate::core::state::GrabStateStore;
use crate::device::{DeviceEvent, DeviceMonitor, LocalVolumeIo, PollingMonitor, VolumeIo};
use chrono::{Local, TimeZone, Utc};
use crossbeam_channel::unbounded;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const MTIME: u64 = 1_600_000_000;

struct Pipeline {
    dir: TempDir,
    dest: PathBuf,
    store: Arc<GrabStateStore>,
    notifier: CollectingNotifier,
}

impl Pipeline {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("grabs");
        let store = Arc::new(GrabStateStore::open(dir.path().join("state.json")).unwrap());
        Self {
            dir,
            dest,
            store,
            notifier: CollectingNotifier::new(),
        }
    }

    fn config(&self, profile: &GrabProfile) -> Config {
        let mut config = Config {
            destination_base: self.dest.clone(),
            profiles: vec![profile.clone()],
            ..Config::default()
        };
        config.transfer.io_timeout_secs = 1;
        config
    }

    fn context(&self, io: Arc<dyn VolumeIo>, probe: ScriptedProbe) -> GrabContext {
        GrabContext::new(Arc::clone(&self.store), Arc::new(self.notifier.clone()))
            .with_io(io)
            .with_probe(Arc::new(probe))
    }

    fn grab_with(
        &self,
        card: &VolumeFixture,
        profile: GrabProfile,
        io: Arc<dyn VolumeIo>,
        probe: ScriptedProbe,
        cancel: &CancelToken,
    ) -> SessionReport {
        let config = self.config(&profile);
        self.context(io, probe)
            .run_session(&config, profile, card.volume(), cancel, None)
    }

    fn grab(&self, card: &VolumeFixture, profile: GrabProfile) -> SessionReport {
        self.grab_with(
            card,
            profile,
            Arc::new(LocalVolumeIo),
            ScriptedProbe::new(),
            &CancelToken::new(),
        )
    }

    fn dest_file(&self, rel: &str) -> PathBuf {
        self.dest.join(rel)
    }
}

fn flat_profile() -> GrabProfile {
    GrabProfile {
        target_template: "{label}".to_string(),
        ..GrabProfile::default()
    }
}

fn source_file(card: &VolumeFixture, path: &Path) -> SourceFile {
    let meta = fs::metadata(path).unwrap();
    SourceFile {
        abs_path: path.to_path_buf(),
        rel_path: path.strip_prefix(card.root()).unwrap().to_path_buf(),
        source_dir: PathBuf::new(),
        size: meta.len(),
        modified: meta.modified().unwrap(),
    }
}

/// Checks on every delete that the file's completion is already recorded
struct CompletionCheckingIo {
    store: Arc<GrabStateStore>,
    key: String,
    root: PathBuf,
    checked: AtomicUsize,
}

impl VolumeIo for CompletionCheckingIo {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        LocalVolumeIo.open(path)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let meta = fs::metadata(path)?;
        let file = SourceFile {
            abs_path: path.to_path_buf(),
            rel_path: path.strip_prefix(&self.root).unwrap().to_path_buf(),
            source_dir: PathBuf::new(),
            size: meta.len(),
            modified: meta.modified()?,
        };
        assert!(
            self.store.is_completed(&self.key, &fingerprint(&file)),
            "{} deleted before completion was recorded",
            path.display()
        );
        self.checked.fetch_add(1, Ordering::SeqCst);
        LocalVolumeIo.remove(path)
    }

    fn is_accessible(&self, root: &Path) -> bool {
        LocalVolumeIo.is_accessible(root)
    }
}

#[test]
fn test_source_deleted_only_after_completion() {
    let p = Pipeline::new();
    let card = VolumeFixture::new("CARD");
    card.add_file("DCIM/a.jpg", b"aaaa", MTIME);
    card.add_file("DCIM/b.jpg", b"bbbb", MTIME + 1);
    card.add_file("DCIM/c.mp4", b"cccccc", MTIME + 2);

    let io = Arc::new(CompletionCheckingIo {
        store: Arc::clone(&p.store),
        key: card.identity().key,
        root: card.root().to_path_buf(),
        checked: AtomicUsize::new(0),
    });
    let report = p.grab_with(
        &card,
        flat_profile(),
        io.clone(),
        ScriptedProbe::new(),
        &CancelToken::new(),
    );

    assert!(report.error.is_none());
    assert_eq!(report.event.deleted, 3);
    assert_eq!(io.checked.load(Ordering::SeqCst), 3);
}

#[test]
fn test_state_failure_withholds_delete() {
    let p = Pipeline::new();
    let card = VolumeFixture::new("CARD");
    card.add_file("a.jpg", b"aaaa", MTIME);

    // The store cannot append to its journal while a directory occupies the name
    fs::create_dir(p.dir.path().join("state.json.journal")).unwrap();

    let report = p.grab(&card, flat_profile());
    assert_eq!(report.event.failed, 1);
    assert_eq!(report.event.errors[0].kind, "state_store_failure");
    assert!(card.exists("a.jpg"));
    assert_eq!(fs::read(p.dest_file("CARD/a.jpg")).unwrap(), b"aaaa");
    assert!(!p.store.is_completed(
        &card.identity().key,
        &fingerprint(&source_file(&card, &card.path("a.jpg")))
    ));
}

#[test]
fn test_reattach_copies_nothing() {
    let p = Pipeline::new();
    let card = VolumeFixture::new("CARD");
    card.add_file("DCIM/a.jpg", b"aaaa", MTIME);
    card.add_file("DCIM/b.jpg", b"bbbb", MTIME);

    let keep = GrabProfile {
        delete_after_copy: Some(false),
        ..flat_profile()
    };

    let first = p.grab(&card, keep.clone());
    assert_eq!(first.event.copied, 2);
    assert_eq!(first.event.deleted, 0);

    let second = p.grab(&card, keep);
    assert_eq!(second.event.copied, 0);
    assert_eq!(second.event.skipped, 2);
    assert!(!p.dest_file("CARD/a_1.jpg").exists());

    let device = &p.store.devices()[0];
    assert_eq!(device.completed, 2);
    assert_eq!(device.sessions, 2);
}

#[test]
fn test_metadata_failure_names_like_mtime() {
    let p = Pipeline::new();
    let card = VolumeFixture::new("CARD");
    let path = card.add_file("DCIM/C0001.MP4", b"video", MTIME);
    let file = source_file(&card, &path);

    let rename = |method| RenameConfig {
        method,
        style: RenameStyle::Prefix,
        ..RenameConfig::default()
    };
    let probe = Arc::new(ScriptedProbe::new());
    let by_media = Renamer::new(rename(RenameMethod::Mediainfo), probe.clone()).plan(&file, 1);
    let by_mtime = Renamer::new(rename(RenameMethod::Mtime), probe.clone()).plan(&file, 1);
    assert_eq!(by_media.file_name, by_mtime.file_name);
    assert!(by_media.probe_failure.is_some());
    assert_eq!(probe.calls(), 1);

    let profile = GrabProfile {
        rename: rename(RenameMethod::Mediainfo),
        ..flat_profile()
    };
    let report = p.grab(&card, profile);
    assert_eq!(report.event.copied, 1);
    assert_eq!(report.event.failed, 0);
    assert!(!report.event.aborted);
    assert_eq!(report.event.errors.len(), 1);
    assert_eq!(report.event.errors[0].kind, "probe_failure");
    assert!(p.dest_file("CARD").join(&by_mtime.file_name).exists());
}

#[test]
fn test_media_date_names_file() {
    let p = Pipeline::new();
    let card = VolumeFixture::new("SONY");
    let path = card.add_file("PRIVATE/M4ROOT/CLIP/C0001.MP4", b"video", MTIME);

    let mut rename = RenameConfig {
        method: RenameMethod::Mediainfo,
        style: RenameStyle::Sequence,
        ..RenameConfig::default()
    };
    rename.mediainfo.substrs = vec!["UTC ".to_string()];
    let profile = GrabProfile {
        rename,
        ..flat_profile()
    };
    let probe =
        ScriptedProbe::new().with_field(&path, "General", "Encoded date", "UTC 2021-03-04 05:06:07");

    p.grab_with(
        &card,
        profile,
        Arc::new(LocalVolumeIo),
        probe,
        &CancelToken::new(),
    );

    let day = Utc
        .with_ymd_and_hms(2021, 3, 4, 5, 6, 7)
        .unwrap()
        .with_timezone(&Local)
        .format("%Y%m%d");
    assert!(p.dest_file("SONY").join(format!("{}-00001.MP4", day)).exists());
}

#[test]
fn test_sequence_numbering_continues_on_next_attach() {
    let p = Pipeline::new();
    let card = VolumeFixture::new("CARD");
    card.add_file("DCIM/a.jpg", b"aaaa", MTIME);
    card.add_file("DCIM/b.jpg", b"bbbb", MTIME);

    let profile = GrabProfile {
        rename: RenameConfig {
            method: RenameMethod::Mtime,
            style: RenameStyle::Sequence,
            ..RenameConfig::default()
        },
        delete_after_copy: Some(true),
        ..flat_profile()
    };
    let first = p.grab(&card, profile.clone());
    assert_eq!((first.event.copied, first.event.deleted), (2, 2));

    card.add_file("DCIM/c.jpg", b"cccc", MTIME);
    card.add_file("DCIM/d.jpg", b"dddd", MTIME);
    let second = p.grab(&card, profile);
    assert_eq!(second.event.copied, 2);

    let day = Local.timestamp_opt(MTIME as i64, 0).unwrap().format("%Y%m%d");
    let mut names: Vec<String> = fs::read_dir(p.dest_file("CARD"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    let expected: Vec<String> = (1..=4).map(|n| format!("{}-{:05}.jpg", day, n)).collect();
    assert_eq!(names, expected);
    assert_eq!(fs::read(p.dest_file("CARD").join(&expected[2])).unwrap(), b"cccc");
}

#[test]
fn test_collisions_get_suffixes() {
    let p = Pipeline::new();
    let card = VolumeFixture::new("CARD");
    card.add_file("DCIM/100/IMG_0001.JPG", b"one", MTIME);
    card.add_file("DCIM/101/IMG_0001.JPG", b"two", MTIME);
    card.add_file("DCIM/102/IMG_0001.JPG", b"three", MTIME);

    let report = p.grab(&card, flat_profile());
    assert_eq!(report.event.copied, 3);

    let mut contents: Vec<Vec<u8>> = ["IMG_0001.JPG", "IMG_0001_1.JPG", "IMG_0001_2.JPG"]
        .iter()
        .map(|n| fs::read(p.dest_file("CARD").join(n)).unwrap())
        .collect();
    contents.sort();
    assert_eq!(contents, vec![b"one".to_vec(), b"three".to_vec(), b"two".to_vec()]);
}

#[test]
fn test_concurrent_sessions_never_share_a_target() {
    let p = Pipeline::new();
    let cards: Vec<VolumeFixture> = (0..4)
        .map(|i| {
            let card = VolumeFixture::new(&format!("CARD{}", i));
            card.add_file("DCIM/IMG_0001.JPG", format!("card {}", i).as_bytes(), MTIME);
            card
        })
        .collect();

    // Every card lands in the same directory
    let shared = GrabProfile {
        target_template: "all".to_string(),
        ..GrabProfile::default()
    };
    let config = p.config(&shared);
    let context = p.context(Arc::new(LocalVolumeIo), ScriptedProbe::new());
    let barrier = Arc::new(Barrier::new(cards.len()));

    thread::scope(|s| {
        for card in &cards {
            let context = context.clone();
            let config = &config;
            let shared = shared.clone();
            let barrier = Arc::clone(&barrier);
            s.spawn(move || {
                barrier.wait();
                context.run_session(config, shared, card.volume(), &CancelToken::new(), None)
            });
        }
    });

    let mut contents: Vec<String> = fs::read_dir(p.dest_file("all"))
        .unwrap()
        .map(|e| fs::read_to_string(e.unwrap().path()).unwrap())
        .collect();
    contents.sort();
    assert_eq!(contents, vec!["card 0", "card 1", "card 2", "card 3"]);
}

#[test]
fn test_failed_read_keeps_source() {
    let p = Pipeline::new();
    let card = VolumeFixture::new("CARD");
    card.add_file("DCIM/1.jpg", b"first file", MTIME);
    let second = card.add_file("DCIM/2.jpg", b"second file", MTIME);
    card.add_file("DCIM/3.jpg", b"third file", MTIME);

    let io = Arc::new(FaultyVolumeIo::failing_read(&second, 4));
    let report = p.grab_with(
        &card,
        flat_profile(),
        io,
        ScriptedProbe::new(),
        &CancelToken::new(),
    );

    assert!(report.error.is_none());
    assert_eq!(fs::read(p.dest_file("CARD/1.jpg")).unwrap(), b"first file");
    assert_eq!(fs::read(p.dest_file("CARD/3.jpg")).unwrap(), b"third file");
    assert!(!card.exists("DCIM/1.jpg"));
    assert!(!card.exists("DCIM/3.jpg"));

    assert!(card.exists("DCIM/2.jpg"));
    assert!(!p.dest_file("CARD/2.jpg").exists());
    let leftovers: Vec<_> = fs::read_dir(p.dest_file("CARD"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".grabpart"))
        .collect();
    assert!(leftovers.is_empty());

    let event = &report.event;
    assert_eq!((event.copied, event.deleted, event.failed), (2, 2, 1));
    assert_eq!(event.errors.len(), 1);
    assert_eq!(event.errors[0].path.as_deref(), Some(Path::new("DCIM/2.jpg")));
    assert_eq!(event.errors[0].kind, "copy_failure");
    assert_eq!(p.notifier.events(), vec![event.clone()]);

    // The failed file is picked up on the next attach
    let retry = p.grab(&card, flat_profile());
    assert_eq!(retry.event.copied, 1);
    assert!(!card.exists("DCIM/2.jpg"));
}

#[test]
fn test_delete_failure_retains_source() {
    let p = Pipeline::new();
    let card = VolumeFixture::new("CARD");
    let path = card.add_file("a.jpg", b"aaaa", MTIME);

    let mut faults = FaultConfig::default();
    faults.remove_errors.insert(path);
    let report = p.grab_with(
        &card,
        flat_profile(),
        Arc::new(FaultyVolumeIo::new(faults)),
        ScriptedProbe::new(),
        &CancelToken::new(),
    );

    assert_eq!(report.event.copied, 1);
    assert_eq!(report.event.deleted, 0);
    assert_eq!(report.event.failed, 0);
    assert_eq!(report.event.errors[0].kind, "delete_failure");
    assert!(card.exists("a.jpg"));
}

#[test]
fn test_stall_fails_file_and_continues() {
    let p = Pipeline::new();
    let card = VolumeFixture::new("CARD");
    let stuck = card.add_file("DCIM/1.jpg", b"stuck", MTIME);
    card.add_file("DCIM/2.jpg", b"fine", MTIME);

    let io = Arc::new(FaultyVolumeIo::stalling(&stuck));
    let report = p.grab_with(
        &card,
        flat_profile(),
        io.clone(),
        ScriptedProbe::new(),
        &CancelToken::new(),
    );
    io.release();

    assert!(report.error.is_none());
    assert_eq!(report.event.failed, 1);
    assert_eq!(report.event.copied, 1);
    assert_eq!(report.event.errors[0].kind, "stalled");
    assert!(card.exists("DCIM/1.jpg"));
    assert!(p.dest_file("CARD/2.jpg").exists());
}

#[test]
fn test_cancel_mid_copy() {
    let p = Pipeline::new();
    let card = VolumeFixture::new("CARD");
    let stuck = card.add_file("DCIM/1.jpg", b"stuck", MTIME);
    card.add_file("DCIM/2.jpg", b"never reached", MTIME);

    let io = Arc::new(FaultyVolumeIo::stalling(&stuck));
    let cancel = CancelToken::new();
    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            cancel.cancel();
        })
    };

    let report = p.grab_with(&card, flat_profile(), io.clone(), ScriptedProbe::new(), &cancel);
    canceller.join().unwrap();
    io.release();

    assert!(matches!(report.error, Some(GrabError::Cancelled { .. })));
    assert!(report.event.aborted);
    assert_eq!(report.event.failed, 1);
    assert_eq!(report.event.errors[0].kind, "cancelled");
    assert!(card.exists("DCIM/1.jpg"));
    assert!(card.exists("DCIM/2.jpg"));
    assert!(!p.dest_file("CARD/2.jpg").exists());
}

#[test]
fn test_device_loss_aborts_session() {
    let p = Pipeline::new();
    let card = VolumeFixture::new("CARD");
    card.add_file("DCIM/1.jpg", b"one", MTIME);
    card.add_file("DCIM/2.jpg", b"two", MTIME);
    card.add_file("DCIM/3.jpg", b"three", MTIME);

    let faults = FaultConfig {
        disconnect_after_opens: Some(1),
        ..FaultConfig::default()
    };
    let report = p.grab_with(
        &card,
        flat_profile(),
        Arc::new(FaultyVolumeIo::new(faults)),
        ScriptedProbe::new(),
        &CancelToken::new(),
    );

    let err = report.error.expect("session should abort");
    assert!(err.is_session_fatal());
    assert!(report.event.aborted);
    assert_eq!(report.event.copied, 1);
    assert_eq!(report.event.failed, 1);
    assert_eq!(p.store.completed_count(&card.identity().key), 1);
    assert!(card.exists("DCIM/2.jpg"));
}

#[test]
fn test_concurrent_claims_one_wins() {
    let p = Pipeline::new();
    let card = VolumeFixture::new("CARD");
    let identity = card.identity();
    let barrier = Arc::new(Barrier::new(6));

    let claims: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let store = &p.store;
                let identity = &identity;
                s.spawn(move || {
                    barrier.wait();
                    store.claim(identity)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners = claims.iter().filter(|c| c.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(claims
        .iter()
        .filter_map(|c| c.as_ref().err())
        .all(|e| matches!(e, GrabError::DeviceBusy(_))));
}

#[test]
fn test_include_exclude_never_selects_tmp() {
    let card = VolumeFixture::new("CARD");
    card.add_file("DCIM/a.jpg", b"a", MTIME);
    card.add_file("DCIM/a_tmp.jpg", b"tmp", MTIME);
    card.add_file("DCIM/b_TMP.JPG", b"tmp", MTIME);
    card.add_file("DCIM/c.png", b"png", MTIME);

    let profile = GrabProfile {
        include: vec!["*.jpg".to_string()],
        exclude: vec!["*_tmp.jpg".to_string()],
        ..flat_profile()
    };
    let rules = PathRules::from_profile(&profile).unwrap();
    let names: Vec<String> = rules.candidates(card.root()).map(|f| f.file_name()).collect();
    assert_eq!(names, vec!["a.jpg"]);

    let p = Pipeline::new();
    let report = p.grab(&card, profile);
    assert_eq!(report.event.copied, 1);
    assert!(card.exists("DCIM/a_tmp.jpg"));
    assert!(!p.dest_file("CARD/a_tmp.jpg").exists());
}

#[test]
fn test_monitor_to_grabber_end_to_end() {
    let p = Pipeline::new();
    let card = VolumeFixture::new("CARD");
    card.add_file("DCIM/a.jpg", b"aaaa", MTIME);
    card.add_file("DCIM/b.jpg", b"bbbb", MTIME);

    let config = ConfigHandle::new(p.config(&flat_profile()));
    let context = p.context(Arc::new(LocalVolumeIo), ScriptedProbe::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let source = StaticMountSource::new();
    let mut monitor = PollingMonitor::new(Arc::new(source.clone()), Duration::from_millis(20));
    let (tx, rx) = unbounded();
    monitor.start(tx).unwrap();
    let lost = monitor.lost_devices();

    let grabber = {
        let shutdown = Arc::clone(&shutdown);
        thread::spawn(move || Grabber::new(config, context, shutdown).run(rx, lost))
    };

    source.set(vec![card.volume()]);
    let deadline = Instant::now() + Duration::from_secs(10);
    while p.notifier.events().is_empty() {
        assert!(Instant::now() < deadline, "no session summary");
        thread::sleep(Duration::from_millis(20));
    }

    source.set(Vec::new());
    thread::sleep(Duration::from_millis(100));
    shutdown.store(true, Ordering::SeqCst);
    grabber.join().unwrap();
    monitor.stop();

    let events = p.notifier.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].copied, 2);
    assert_eq!(events[0].deleted, 2);
    assert!(p.dest_file("CARD/a.jpg").exists());
    assert!(!card.exists("DCIM/a.jpg"));
}

#[test]
fn test_unreadable_device_is_grabbed_once_readable() {
    let p = Pipeline::new();
    let card = VolumeFixture::new("CARD");
    card.add_file("DCIM/a.jpg", b"aaaa", MTIME);
    card.unplug();

    let config = ConfigHandle::new(p.config(&flat_profile()));
    let context = p.context(Arc::new(LocalVolumeIo), ScriptedProbe::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    // The mount table keeps listing the volume while its root is unreadable
    let source = StaticMountSource::new();
    source.set(vec![card.volume()]);
    let mut monitor = PollingMonitor::new(Arc::new(source), Duration::from_millis(20));
    let (tx, rx) = unbounded();
    monitor.start(tx).unwrap();
    let lost = monitor.lost_devices();

    let grabber = {
        let shutdown = Arc::clone(&shutdown);
        thread::spawn(move || Grabber::new(config, context, shutdown).run(rx, lost))
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    while p.notifier.events().is_empty() {
        assert!(Instant::now() < deadline, "no session summary");
        thread::sleep(Duration::from_millis(20));
    }
    card.replug();

    while !p.notifier.events().iter().any(|e| e.copied == 1) {
        assert!(Instant::now() < deadline, "device was not grabbed again");
        thread::sleep(Duration::from_millis(20));
    }
    shutdown.store(true, Ordering::SeqCst);
    grabber.join().unwrap();
    monitor.stop();

    let events = p.notifier.events();
    assert!(events[0].aborted);
    assert_eq!(events[0].errors[0].kind, "device_unavailable");
    assert!(events.len() >= 2);
    assert!(p.dest_file("CARD/a.jpg").exists());
}

#[test]
fn test_busy_device_rejected() {
    let p = Pipeline::new();
    let card = VolumeFixture::new("CARD");
    card.add_file("DCIM/a.jpg", b"aaaa", MTIME);

    let _held = p.store.claim(&card.identity()).unwrap();
    let config = ConfigHandle::new(p.config(&flat_profile()));
    let context = p.context(Arc::new(LocalVolumeIo), ScriptedProbe::new());
    let mut grabber = Grabber::new(config, context, Arc::new(AtomicBool::new(false)));

    let (tx, _rx) = unbounded();
    grabber.handle_event(DeviceEvent::Attach(card.volume()), &tx);

    assert_eq!(grabber.active_count(), 0);
    assert!(card.exists("DCIM/a.jpg"));
}
