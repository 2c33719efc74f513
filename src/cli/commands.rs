//! Command handler implementations
//!
//! This module contains the implementation of all CLI commands.

use crate::cli::progress::{
    format_bytes, format_duration, print_error, print_header, print_info, print_success,
    print_warning, GrabProgress,
};
use crate::cli::{Args, Commands, StateCommands};
use crate::core::config::{get_config_path, Config, DeviceMatcher, MonitorBackend, MountSourceKind};
use crate::core::config_watch::{ConfigHandle, ConfigWatcher};
use crate::core::grabber::{resolve_profile, GrabContext, Grabber};
use crate::core::notifier::{FanoutNotifier, NotificationEvent};
use crate::core::session::CancelToken;
use crate::core::state::GrabStateStore;
use crate::device::{
    monitor_from_config, mount_source_from_config, DeviceIdentity, DeviceMonitor, MountedVolume,
    PollingMonitor, ProfileMatcher,
};
use anyhow::{bail, Context, Result};
use chrono::Local;
use crossbeam_channel::unbounded;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Dispatch the parsed command line
pub fn run_command(
    args: &Args,
    config: &Config,
    config_path: Option<&Path>,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<()> {
    match &args.command {
        None | Some(Commands::Run) => run_daemon(
            config,
            config_path,
            args.log_level.as_deref(),
            shutdown_flag,
        )?,
        Some(Commands::Grab {
            mount,
            label,
            uuid,
            profile,
        }) => {
            let event = grab_mount(
                config,
                mount,
                label.clone(),
                uuid.clone(),
                profile.as_deref(),
                shutdown_flag,
            )?;
            if event.aborted {
                bail!("Grab of {} was aborted", event.label);
            }
        }
        Some(Commands::Volumes) => list_volumes(config)?,
        Some(Commands::Profiles) => list_profiles(config),
        Some(Commands::State { command }) => match command {
            StateCommands::List => list_state(config)?,
            StateCommands::Forget { identity } => forget_device(config, identity)?,
        },
        Some(Commands::ShowConfig) => show_config(config, config_path)?,
        Some(Commands::GenerateConfig { output }) => generate_config_file(output.clone())?,
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<Arc<GrabStateStore>> {
    let store = GrabStateStore::open(&config.state.state_file).with_context(|| {
        format!(
            "Failed to open grab state at {}",
            config.state.state_file.display()
        )
    })?;
    Ok(Arc::new(store))
}

// ============================================================================
// Daemon
// ============================================================================

/// Watch for volumes and grab them until shutdown is requested.
///
/// `log_level_override` (from `--log-level` or `GRABBY_LOG_LEVEL`) keeps
/// winning over the file when the configuration is reloaded.
pub fn run_daemon(
    config: &Config,
    config_path: Option<&Path>,
    log_level_override: Option<&str>,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<()> {
    if config.profiles.is_empty() {
        warn!("No profiles configured; attached volumes will be ignored");
    }
    if config.monitor.source == MountSourceKind::Directory {
        fs::create_dir_all(&config.mount_base).with_context(|| {
            format!("Failed to create mount base {}", config.mount_base.display())
        })?;
    }

    let store = open_store(config)?;
    info!(
        "Grab state: {} ({} known devices)",
        store.path().display(),
        store.devices().len()
    );

    let handle = ConfigHandle::new(config.clone())
        .with_log_level_override(log_level_override.map(str::to_string));
    let _watcher = match config_path {
        Some(path) => match ConfigWatcher::start(path.to_path_buf(), handle.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Configuration changes will not be picked up: {}", e);
                None
            }
        },
        None => None,
    };

    let notifier = Arc::new(FanoutNotifier::from_config(&config.notifier));
    let context = GrabContext::new(Arc::clone(&store), notifier);

    let (tx, rx) = unbounded();
    let mut monitor = monitor_from_config(config);
    if let Err(e) = monitor.start(tx.clone()) {
        if config.monitor.backend != MonitorBackend::Watch {
            return Err(e).context("Failed to start device monitor");
        }
        warn!("Watch backend unavailable ({}), falling back to polling", e);
        let mut polling = PollingMonitor::new(
            mount_source_from_config(config),
            config.monitor.poll_interval(),
        );
        polling
            .start(tx.clone())
            .context("Failed to start device monitor")?;
        monitor = Box::new(polling);
    }

    info!(
        "Grabbing into {} (press Ctrl+C to stop)",
        config.destination_base.display()
    );
    drop(tx);
    Grabber::new(handle, context, shutdown_flag).run(rx, monitor.lost_devices());

    monitor.stop();
    Ok(())
}

// ============================================================================
// One-shot grab
// ============================================================================

/// Grab an already-mounted path once, with a progress bar
pub fn grab_mount(
    config: &Config,
    mount: &Path,
    label: Option<String>,
    uuid: Option<String>,
    profile_name: Option<&str>,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<NotificationEvent> {
    if !mount.is_dir() {
        bail!("{} is not a mounted directory", mount.display());
    }

    let label = label.or_else(|| {
        mount
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    });
    let volume = MountedVolume::new(DeviceIdentity::new(label, uuid, None, mount), mount);
    let profile = resolve_profile(config, &volume, profile_name)?;

    let store = open_store(config)?;
    let _claim = store.claim(&volume.identity)?;

    print_header(&format!("Grabbing {}", volume.identity.name));
    print_info(&format!("Profile: {}", profile.name));
    print_info(&format!("Destination: {}", config.destination_base.display()));
    println!();

    let notifier = Arc::new(FanoutNotifier::from_config(&config.notifier));
    let context = GrabContext::new(Arc::clone(&store), notifier);
    let progress = GrabProgress::new();
    let cancel = CancelToken::child_of(shutdown_flag);

    let report = context.run_session(config, profile, volume, &cancel, Some(progress.callback()));
    let event = report.event;

    match &report.error {
        Some(err) => progress.finish_with_error(&err.to_string()),
        None => progress.finish(event.bytes_copied),
    }
    if let Err(e) = store.flush() {
        warn!("Failed to flush grab state: {}", e);
    }

    println!();
    print_success(&format!(
        "Copied {} files ({})",
        event.copied,
        format_bytes(event.bytes_copied)
    ));
    print_info(&format!("Skipped {} already grabbed", event.skipped));
    print_info(&format!("Deleted {} from the volume", event.deleted));
    print_info(&format!(
        "Took {}",
        format_duration(Duration::from_millis(event.duration_ms))
    ));
    if event.failed > 0 {
        print_warning(&format!("{} files failed", event.failed));
    }
    for err in &event.errors {
        match &err.path {
            Some(path) => print_error(&format!("{}: {}", path.display(), err.message)),
            None => print_error(&err.message),
        }
    }

    Ok(event)
}

// ============================================================================
// Listings
// ============================================================================

fn describe_matcher(matcher: &DeviceMatcher) -> String {
    let mut parts = Vec::new();
    if let Some(label) = &matcher.label {
        parts.push(format!("label={}", label));
    }
    if let Some(uuid) = &matcher.uuid {
        parts.push(format!("uuid={}", uuid));
    }
    if let Some(glob) = &matcher.mount_glob {
        parts.push(format!("mount={}", glob));
    }
    if parts.is_empty() {
        "any device".to_string()
    } else {
        parts.join(", ")
    }
}

/// List mounted volumes and the profile each one would use
pub fn list_volumes(config: &Config) -> Result<()> {
    let source = mount_source_from_config(config);
    let volumes = source.scan()?;
    let matcher = ProfileMatcher::new(&config.profiles)?;

    if volumes.is_empty() {
        info!("No volumes found ({} source)", source.name());
        return Ok(());
    }

    println!("Mounted volumes ({} source):", source.name());
    println!();
    for volume in &volumes {
        let profile = matcher
            .select(volume)
            .map(|p| p.name.as_str())
            .unwrap_or("(no matching profile)");
        println!("  {}", volume.identity);
        println!("    Mount:   {}", volume.mount_path.display());
        if let Some(fs_type) = &volume.fs_type {
            println!("    Type:    {}", fs_type);
        }
        println!("    Profile: {}", profile);
        println!();
    }
    Ok(())
}

/// List configured profiles in match order
pub fn list_profiles(config: &Config) {
    if config.profiles.is_empty() {
        println!("No profiles configured.");
        return;
    }

    println!("Profiles (first match wins):");
    println!();
    for (i, profile) in config.profiles.iter().enumerate() {
        println!("  {}. {}", i + 1, profile.name);
        println!("     Matches:   {}", describe_matcher(&profile.matcher));
        if !profile.source_dirs.is_empty() {
            println!("     Sources:   {:?}", profile.source_dirs);
        }
        if !profile.types.is_empty() {
            println!("     Types:     {}", profile.types.join(", "));
        }
        if !profile.include.is_empty() {
            println!("     Include:   {}", profile.include.join(", "));
        }
        if !profile.exclude.is_empty() {
            println!("     Exclude:   {}", profile.exclude.join(", "));
        }
        println!("     Target:    {}", profile.target_template);
        println!(
            "     Rename:    {:?} ({:?})",
            profile.rename.method, profile.rename.style
        );
        println!(
            "     Delete:    {}",
            profile.effective_delete(config.delete_after_copy)
        );
        println!();
    }
}

/// List devices known to the grab state
pub fn list_state(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let devices = store.devices();

    if devices.is_empty() {
        println!("No devices grabbed yet ({}).", store.path().display());
        return Ok(());
    }

    println!("Known devices ({}):", store.path().display());
    println!();
    for device in devices {
        println!("  {} ({})", device.name, device.key);
        println!("    Completed files: {}", device.completed);
        println!(
            "    Last seen:       {}",
            device.last_seen.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(last) = &device.last_session {
            println!(
                "    Last session:    copied {}, skipped {}, failed {}{} [{}]",
                last.copied,
                last.skipped,
                last.failed,
                if last.aborted { ", aborted" } else { "" },
                last.profile
            );
        }
        println!("    Sessions kept:   {}", device.sessions);
        println!();
    }
    Ok(())
}

/// Drop everything recorded for a device
pub fn forget_device(config: &Config, identity: &str) -> Result<()> {
    let store = open_store(config)?;
    if store.forget(identity)? {
        print_success(&format!("Forgot {}; its files will be grabbed again", identity));
    } else {
        print_warning(&format!("No device with identity {}", identity));
    }
    Ok(())
}

// ============================================================================
// Configuration
// ============================================================================

/// Print the effective configuration
pub fn show_config(config: &Config, config_path: Option<&Path>) -> Result<()> {
    match config_path {
        Some(path) => println!("# Configuration file: {}", path.display()),
        None => println!("# No configuration file found, using defaults"),
    }
    println!();
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

/// Write the commented default configuration
pub fn generate_config_file(output: Option<PathBuf>) -> Result<()> {
    let output_path = match output {
        Some(path) => path,
        None => get_config_path().context("Could not determine the config directory")?,
    };

    if output_path.exists() {
        bail!(
            "{} already exists; remove it first or pass --output",
            output_path.display()
        );
    }

    Config::write_default(&output_path)?;
    info!("Configuration file: {}", output_path.display());
    info!("Edit this file to add grab profiles.");
    Ok(())
}
