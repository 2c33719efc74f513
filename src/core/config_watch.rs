//! Configuration hot reload
//!
//! Sessions take an immutable `Arc<Config>` snapshot when they start. The
//! watcher swaps in a new snapshot whenever the config file changes and the new
//! contents load and validate; otherwise the previous snapshot stays active.
//! A log level given on the command line or in the environment is re-applied
//! to every reloaded snapshot.

use crate::core::config::Config;
use crate::core::error::{GrabError, Result};
use crossbeam_channel::{unbounded, RecvTimeoutError};
use log::{debug, info, warn, LevelFilter};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Quiet period after the last change before reloading
pub const RELOAD_DEBOUNCE: Duration = Duration::from_secs(1);

/// Shared, swappable configuration snapshot
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<Config>>>,
    log_level_override: Option<String>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            log_level_override: None,
        }
    }

    /// Log level that replaces `logging.level` in every reloaded file
    pub fn with_log_level_override(mut self, level: Option<String>) -> Self {
        self.log_level_override = level;
        self
    }

    /// The configuration in effect right now
    pub fn snapshot(&self) -> Arc<Config> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn replace(&self, config: Config) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
    }

    /// Load `path` and swap it in. On error the old snapshot is kept.
    pub fn reload_from(&self, path: &Path) -> std::result::Result<(), String> {
        let mut config = Config::load(path).map_err(|e| e.to_string())?;
        if let Some(level) = &self.log_level_override {
            config.logging.level = level.clone();
        }

        if let Ok(level) = config.logging.level.parse::<LevelFilter>() {
            if level != log::max_level() {
                info!("Log level changed to {}", level);
                log::set_max_level(level);
            }
        }

        self.replace(config);
        Ok(())
    }
}

/// Watches the config file and reloads it into a `ConfigHandle`
pub struct ConfigWatcher {
    shutdown_flag: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ConfigWatcher {
    /// Start watching `path`. The parent directory is watched so that editors
    /// that replace the file by renaming are handled.
    pub fn start(path: PathBuf, handle: ConfigHandle) -> Result<Self> {
        Self::start_with_debounce(path, handle, RELOAD_DEBOUNCE)
    }

    pub fn start_with_debounce(
        path: PathBuf,
        handle: ConfigHandle,
        debounce: Duration,
    ) -> Result<Self> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path.file_name().map(|n| n.to_os_string());

        let (tx, rx) = unbounded();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                let _ = tx.send(res);
            })
            .map_err(|e| GrabError::IoError(format!("Failed to create config watcher: {}", e)))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                GrabError::IoError(format!("Failed to watch {}: {}", dir.display(), e))
            })?;

        info!("Watching {} for changes", path.display());

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown_flag);

        let thread_handle = thread::Builder::new()
            .name("config-watch".to_string())
            .spawn(move || {
                let _watcher = watcher;
                let mut pending: Option<Instant> = None;

                while !flag.load(Ordering::SeqCst) {
                    match rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(Ok(event)) => {
                            let touches_config = event
                                .paths
                                .iter()
                                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                            if touches_config {
                                pending = Some(Instant::now());
                            }
                        }
                        Ok(Err(e)) => warn!("Config watch error: {}", e),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }

                    if pending.is_some_and(|t| t.elapsed() >= debounce) {
                        pending = None;
                        match handle.reload_from(&path) {
                            Ok(()) => info!("Reloaded configuration from {}", path.display()),
                            Err(e) => warn!("Keeping previous configuration: {}", e),
                        }
                    }
                }
                debug!("Config watcher exited");
            })?;

        Ok(Self {
            shutdown_flag,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn stop(&mut self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
