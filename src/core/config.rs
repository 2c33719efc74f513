//! Configuration module for grabby
//!
//! Supports loading configuration from a TOML file. The file is looked up in:
//! - an explicit path (file, or directory containing `grabby.toml`)
//! - `./grabby.toml`
//! - the standard location (`~/.config/grabby/grabby.toml` on Linux)
//!
//! Grab profiles are an ordered list; the first profile whose matcher accepts a
//! device wins.

use crate::core::rules::PathRules;
use crate::device::profiles::CompiledMatcher;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name used for config and data directories
pub const APP_NAME: &str = "grabby";

/// Default config file name
pub const CONFIG_FILE_NAME: &str = "grabby.toml";

/// Default state file name
const STATE_FILE_NAME: &str = "grab_state.json";

/// Default layout of grabbed files under `destination_base`
pub const DEFAULT_TARGET_TEMPLATE: &str = "{label}/{year}/{month}/{day}";

/// Get the standard configuration directory for the application.
pub fn get_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_NAME))
}

/// Get the standard configuration file path.
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

fn app_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

fn default_state_file() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(APP_NAME))
        .unwrap_or_else(app_home)
        .join(STATE_FILE_NAME)
}

/// Expand a leading `~` to the user's home directory
fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Delete source files once their copy is verified and recorded
    pub delete_after_copy: bool,

    /// Root of the managed destination tree
    pub destination_base: PathBuf,

    /// Directory under which removable volumes are mounted
    pub mount_base: PathBuf,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Device monitor settings
    pub monitor: MonitorConfig,

    /// Mounting and unmounting of removable partitions
    pub mount: MountConfig,

    /// Copy/verify settings
    pub transfer: TransferConfig,

    /// Grab state persistence
    pub state: StateConfig,

    /// Completion event sinks
    pub notifier: NotifierConfig,

    /// Ownership applied to grabbed files (Unix only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chown: Option<ChownIds>,

    /// Ordered grab profiles
    pub profiles: Vec<GrabProfile>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,

    /// Log to file as well as stderr
    pub log_to_file: bool,

    /// Log file path
    pub log_file: PathBuf,
}

/// How the device monitor learns about volume changes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MonitorBackend {
    /// Re-scan the mount table on a fixed interval
    #[default]
    Poll,
    /// Re-scan when the mount base changes, with a slow safety re-scan
    Watch,
}

/// Where mounted volumes are discovered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MountSourceKind {
    /// Block devices from the kernel mount table
    #[default]
    ProcMounts,
    /// Every subdirectory of `mount_base` is a volume
    Directory,
}

/// Device monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Detection backend
    pub backend: MonitorBackend,

    /// Mount discovery source
    pub source: MountSourceKind,

    /// How often to poll for volume changes (in milliseconds)
    pub poll_interval_ms: u64,

    /// Extra mount roots considered removable (in addition to `mount_base`)
    pub mount_roots: Vec<PathBuf>,
}

/// Mount handling (Linux, needs permission to run `mount`/`umount`)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MountConfig {
    /// Mount removable partitions nobody has mounted at `mount_base/<device>`
    pub auto_mount: bool,

    /// Unmount a volume once its grab session ends
    pub unmount_after: bool,

    /// Options for `mount -o`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Re-hash the copy with SHA256 and compare against the bytes read
    pub verify_checksum: bool,

    /// Maximum time without copy progress before a file is failed
    pub io_timeout_secs: u64,

    /// Copy buffer size in bytes
    pub buffer_size: usize,

    /// Carry the source modification time over to the copy
    pub preserve_mtime: bool,
}

/// Grab state persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Path to the JSON state file
    pub state_file: PathBuf,
}

/// Notification sinks
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NotifierConfig {
    /// Append one JSON summary per finished session to this file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_lines: Option<PathBuf>,
}

/// Numeric owner applied to grabbed files and created directories
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChownIds {
    pub user: u32,
    pub group: u32,
}

/// A single grab profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GrabProfile {
    /// Profile name (unique)
    pub name: String,

    /// Which devices this profile applies to
    pub matcher: DeviceMatcher,

    /// Subdirectories of the device to grab from (empty = whole device)
    pub source_dirs: Vec<PathBuf>,

    /// File extensions to grab, e.g. `["jpg", "mp4"]`
    pub types: Vec<String>,

    /// Include globs (a file must match at least one, if any are given)
    pub include: Vec<String>,

    /// Exclude globs (any match disqualifies)
    pub exclude: Vec<String>,

    /// Target directory template under `destination_base`
    pub target_template: String,

    /// Rename settings
    pub rename: RenameConfig,

    /// Overrides the global `delete_after_copy`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_after_copy: Option<bool>,
}

/// Device identity predicates. Every predicate that is set must match.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct DeviceMatcher {
    /// Volume label glob (case-insensitive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Filesystem UUID (case-insensitive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    /// Mount path glob
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_glob: Option<String>,
}

/// How the final file name is derived
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RenameMethod {
    /// Date from an embedded media tag, falling back to mtime
    Mediainfo,
    /// Date from the file modification time
    Mtime,
    /// Keep the original file name
    #[default]
    Passthrough,
}

/// Shape of a dated file name
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RenameStyle {
    /// `YYYYMMDD_<original name>`
    #[default]
    Prefix,
    /// `YYYYMMDD-NNNNN.<ext>` numbered in grab order
    Sequence,
}

/// Media tag holding the capture date
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaTag {
    /// Track type, e.g. "General" or "Video"
    pub group: String,

    /// Field name, e.g. "Encoded date"
    pub name: String,

    /// Timezone for dates without an offset: "UTC", "local" or "+HH:MM"
    pub tz: String,

    /// Substrings removed from the raw value before parsing
    pub substrs: Vec<String>,
}

/// Rename settings of a profile
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RenameConfig {
    pub method: RenameMethod,
    pub style: RenameStyle,
    pub mediainfo: MediaTag,
}

impl Default for Config {
    fn default() -> Self {
        let home = app_home();
        Self {
            delete_after_copy: true,
            destination_base: home.join("grabs"),
            mount_base: home.join("mounts"),
            logging: LoggingConfig::default(),
            monitor: MonitorConfig::default(),
            mount: MountConfig::default(),
            transfer: TransferConfig::default(),
            state: StateConfig::default(),
            notifier: NotifierConfig::default(),
            chown: None,
            profiles: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
            log_file: PathBuf::from("./grabby.log"),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            backend: MonitorBackend::Poll,
            source: MountSourceKind::ProcMounts,
            poll_interval_ms: 2000,
            mount_roots: vec![PathBuf::from("/media"), PathBuf::from("/run/media")],
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            verify_checksum: false,
            io_timeout_secs: 30,
            buffer_size: 1024 * 1024,
            preserve_mtime: true,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

impl Default for GrabProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            matcher: DeviceMatcher::default(),
            source_dirs: Vec::new(),
            types: Vec::new(),
            include: Vec::new(),
            exclude: Vec::new(),
            target_template: DEFAULT_TARGET_TEMPLATE.to_string(),
            rename: RenameConfig::default(),
            delete_after_copy: None,
        }
    }
}

impl Default for MediaTag {
    fn default() -> Self {
        Self {
            group: "General".to_string(),
            name: "Encoded date".to_string(),
            tz: "UTC".to_string(),
            substrs: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(50))
    }

    /// Mount roots scanned for removable volumes, `mount_base` first
    pub fn effective_mount_roots(&self, mount_base: &Path) -> Vec<PathBuf> {
        let mut roots = vec![mount_base.to_path_buf()];
        for root in &self.mount_roots {
            if !roots.contains(root) {
                roots.push(root.clone());
            }
        }
        roots
    }
}

impl TransferConfig {
    /// I/O stall timeout as a duration
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

impl GrabProfile {
    /// Whether sources are removed after a committed copy
    pub fn effective_delete(&self, global: bool) -> bool {
        self.delete_after_copy.unwrap_or(global)
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;

        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Resolve where the configuration lives.
    ///
    /// An explicit path may be the config file itself or a directory holding
    /// `grabby.toml`. An explicit `*.toml` path that does not exist yet gets a
    /// fresh default file. Without an explicit path, `./grabby.toml` and then
    /// the standard location are tried; `None` means "use defaults".
    pub fn resolve_path(explicit: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
        if let Some(path) = explicit {
            if path.is_dir() {
                let candidate = path.join(CONFIG_FILE_NAME);
                if candidate.is_file() {
                    return Ok(Some(candidate));
                }
                return Err(ConfigError::FileNotFound(candidate));
            }
            if path.is_file() {
                return Ok(Some(path.to_path_buf()));
            }
            if path.extension().is_some_and(|ext| ext == "toml") {
                Self::write_default(path)?;
                return Ok(Some(path.to_path_buf()));
            }
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let local = PathBuf::from(".").join(CONFIG_FILE_NAME);
        if local.is_file() {
            return Ok(Some(local));
        }

        Ok(get_config_path().filter(|path| path.is_file()))
    }

    /// Resolve and load configuration, returning the file it came from
    pub fn load_from(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        match Self::resolve_path(explicit)? {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    /// Check profile names, patterns and templates
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer.io_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "transfer.io_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.transfer.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "transfer.buffer_size must be greater than zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for profile in &self.profiles {
            if !names.insert(profile.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate profile name '{}'",
                    profile.name
                )));
            }
            PathRules::from_profile(profile)
                .map(|_| ())
                .and_then(|_| CompiledMatcher::new(&profile.matcher).map(|_| ()))
                .map_err(|e| {
                    ConfigError::Invalid(format!("profile '{}': {}", profile.name, e))
                })?;
        }

        Ok(())
    }

    /// Find a profile by name
    pub fn profile(&self, name: &str) -> Option<&GrabProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    fn expand_paths(&mut self) {
        self.destination_base = expand_home(&self.destination_base);
        self.mount_base = expand_home(&self.mount_base);
        self.state.state_file = expand_home(&self.state.state_file);
        self.logging.log_file = expand_home(&self.logging.log_file);
        self.notifier.json_lines = self.notifier.json_lines.as_deref().map(expand_home);
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path.as_ref(), content)
            .map_err(|e| ConfigError::WriteError(path.as_ref().to_path_buf(), e.to_string()))?;

        Ok(())
    }

    /// Write the commented default configuration to `path`
    pub fn write_default(path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteError(parent.to_path_buf(), e.to_string()))?;
        }
        fs::write(path, Self::generate_default_config())
            .map_err(|e| ConfigError::WriteError(path.to_path_buf(), e.to_string()))
    }

    /// Generate a default config file with comments
    pub fn generate_default_config() -> String {
        include_str!("../../config.example.toml").to_string()
    }
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// Configuration file was not found at the specified path
    FileNotFound(PathBuf),
    /// Failed to read the configuration file
    ReadError(PathBuf, String),
    /// Failed to parse the configuration file (invalid TOML)
    ParseError(PathBuf, String),
    /// Configuration parsed but is not usable
    Invalid(String),
    /// Failed to serialize configuration to TOML
    SerializeError(String),
    /// Failed to write configuration file
    WriteError(PathBuf, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => {
                write!(f, "Configuration file not found: {}", path.display())
            }
            ConfigError::ReadError(path, err) => {
                write!(
                    f,
                    "Failed to read config file '{}': {}",
                    path.display(),
                    err
                )
            }
            ConfigError::ParseError(path, err) => {
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    err
                )
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
            ConfigError::SerializeError(err) => {
                write!(f, "Failed to serialize configuration: {}", err)
            }
            ConfigError::WriteError(path, err) => {
                write!(
                    f,
                    "Failed to write config file '{}': {}",
                    path.display(),
                    err
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}
