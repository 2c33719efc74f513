//! Rename strategy
//!
//! Decides the final file name of a grabbed file and the date used for the
//! target directory, and keeps concurrent sessions from claiming the same
//! target path.

use crate::core::config::{MediaTag, RenameConfig, RenameMethod, RenameStyle};
use crate::core::rules::SourceFile;
use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use log::{debug, trace};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Metadata probe failures
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to run {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("unreadable probe output: {0}")]
    Parse(String),
}

/// One track of probed metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaTrack {
    /// Track type, e.g. "General", "Video"
    pub kind: String,
    pub fields: HashMap<String, String>,
}

/// Probed media metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaMetadata {
    pub tracks: Vec<MediaTrack>,
}

/// "Encoded date", "Encoded_Date" and "encodeddate" are the same key
fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

impl MediaMetadata {
    /// Look up a field of the first track of the given type
    pub fn field(&self, group: &str, name: &str) -> Option<&str> {
        let group = normalize_key(group);
        let name = normalize_key(name);
        self.tracks
            .iter()
            .filter(|t| normalize_key(&t.kind) == group)
            .find_map(|t| {
                t.fields
                    .iter()
                    .find(|(k, _)| normalize_key(k) == name)
                    .map(|(_, v)| v.as_str())
            })
    }

    /// Parse `mediainfo --Output=JSON` output
    pub fn from_mediainfo_json(json: &str) -> Result<Self, ProbeError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| ProbeError::Parse(e.to_string()))?;

        let Some(tracks) = value
            .get("media")
            .and_then(|m| m.get("track"))
            .and_then(|t| t.as_array())
        else {
            return Ok(Self::default());
        };

        let tracks = tracks
            .iter()
            .filter_map(|t| t.as_object())
            .map(|obj| {
                let mut track = MediaTrack::default();
                for (key, value) in obj {
                    let text = match value {
                        serde_json::Value::String(s) => s.clone(),
                        serde_json::Value::Number(n) => n.to_string(),
                        serde_json::Value::Bool(b) => b.to_string(),
                        _ => continue,
                    };
                    if key == "@type" {
                        track.kind = text;
                    } else {
                        track.fields.insert(key.clone(), text);
                    }
                }
                track
            })
            .collect();

        Ok(Self { tracks })
    }
}

/// Capability to read embedded media metadata
pub trait MetadataProbe: Send + Sync {
    fn probe(&self, path: &Path) -> Result<MediaMetadata, ProbeError>;
}

/// Probe backed by the `mediainfo` command line tool
#[derive(Debug, Clone)]
pub struct MediaInfoProbe {
    program: PathBuf,
}

impl Default for MediaInfoProbe {
    fn default() -> Self {
        Self {
            program: PathBuf::from("mediainfo"),
        }
    }
}

impl MetadataProbe for MediaInfoProbe {
    fn probe(&self, path: &Path) -> Result<MediaMetadata, ProbeError> {
        let program = self.program.display().to_string();
        let output = Command::new(&self.program)
            .arg("--Output=JSON")
            .arg(path)
            .output()
            .map_err(|e| ProbeError::Spawn {
                program: program.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        MediaMetadata::from_mediainfo_json(&String::from_utf8_lossy(&output.stdout))
    }
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y:%m:%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
];

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y:%m:%d %H:%M:%S%:z",
];

fn parse_offset(tz: &str) -> Option<FixedOffset> {
    let tz = tz.trim();
    let (sign, rest) = match tz.as_bytes().first()? {
        b'+' => (1, &tz[1..]),
        b'-' => (-1, &tz[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let secs = hours.parse::<i32>().ok()? * 3600 + minutes.parse::<i32>().ok()? * 60;
    FixedOffset::east_opt(sign * secs)
}

/// Parse a media date value into local time.
///
/// Configured substrings are removed first. A value mentioning `UTC` is taken
/// as UTC; other values without an offset use the tag's `tz`.
pub fn parse_media_date(raw: &str, tag: &MediaTag) -> Option<DateTime<Local>> {
    let mut value = raw.to_string();
    for substr in tag.substrs.iter().filter(|s| !s.is_empty()) {
        value = value.replace(substr.as_str(), "");
    }
    let says_utc = value.contains("UTC");
    let value = value.replace("UTC", "");
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Local));
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(value, format) {
            return Some(dt.with_timezone(&Local));
        }
    }

    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(value, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;

    if says_utc || tag.tz.eq_ignore_ascii_case("utc") {
        return Some(Utc.from_utc_datetime(&naive).with_timezone(&Local));
    }
    if tag.tz.eq_ignore_ascii_case("local") {
        return Local.from_local_datetime(&naive).earliest();
    }
    let offset = parse_offset(&tag.tz)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Local))
}

/// Where a naming date came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateSource {
    Media,
    Mtime,
}

/// Final name and naming date of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamePlan {
    pub file_name: String,
    pub date: NaiveDate,
    pub date_source: DateSource,
    /// Why the media date could not be used, when mediainfo naming fell back
    pub probe_failure: Option<String>,
}

/// Computes file names for one profile
#[derive(Clone)]
pub struct Renamer {
    config: RenameConfig,
    probe: Arc<dyn MetadataProbe>,
}

impl Renamer {
    pub fn new(config: RenameConfig, probe: Arc<dyn MetadataProbe>) -> Self {
        Self { config, probe }
    }

    /// Local modification date of a file
    pub fn mtime_date(file: &SourceFile) -> NaiveDate {
        DateTime::<Local>::from(file.modified).date_naive()
    }

    fn media_date(&self, file: &SourceFile) -> Result<NaiveDate, String> {
        let tag = &self.config.mediainfo;
        let metadata = self.probe.probe(&file.abs_path).map_err(|e| e.to_string())?;

        let raw = metadata
            .field(&tag.group, &tag.name)
            .ok_or_else(|| format!("no '{}/{}' tag", tag.group, tag.name))?;

        parse_media_date(raw, tag)
            .map(|dt| dt.date_naive())
            .ok_or_else(|| format!("unparseable media date '{}'", raw))
    }

    /// Name for the file, numbered `index` in the `sequence` style
    pub fn plan(&self, file: &SourceFile, index: usize) -> RenamePlan {
        self.plan_with(file, |_| index)
    }

    /// Like `plan`, with the sequence number picked once the date is known.
    /// `next_index` is only called for the `sequence` style.
    pub fn plan_with(
        &self,
        file: &SourceFile,
        next_index: impl FnOnce(NaiveDate) -> usize,
    ) -> RenamePlan {
        let original = file.file_name();

        let mut probe_failure = None;
        let (date, date_source) = match self.config.method {
            RenameMethod::Mediainfo => match self.media_date(file) {
                Ok(date) => (date, DateSource::Media),
                Err(reason) => {
                    debug!("{}: {}, using mtime", file.abs_path.display(), reason);
                    probe_failure = Some(reason);
                    (Self::mtime_date(file), DateSource::Mtime)
                }
            },
            RenameMethod::Mtime | RenameMethod::Passthrough => {
                (Self::mtime_date(file), DateSource::Mtime)
            }
        };

        let file_name = match (self.config.method, self.config.style) {
            (RenameMethod::Passthrough, _) => original,
            (_, RenameStyle::Prefix) => format!("{}_{}", date.format("%Y%m%d"), original),
            (_, RenameStyle::Sequence) => {
                let ext = Path::new(&original)
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy()))
                    .unwrap_or_default();
                format!("{}-{:05}{}", date.format("%Y%m%d"), next_index(date), ext)
            }
        };

        trace!("{} -> {}", file.rel_path.display(), file_name);
        RenamePlan {
            file_name,
            date,
            date_source,
            probe_failure,
        }
    }
}

/// Sequence numbers handed out during one session
///
/// Numbering for a date continues after the highest `YYYYMMDD-NNNNN` name
/// already in the target directory, so a later session on the same card
/// does not restart at 00001.
#[derive(Debug, Default)]
pub struct SequenceNumbers {
    last: HashMap<(PathBuf, NaiveDate), usize>,
}

impl SequenceNumbers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next number for `date` in `dir`
    pub fn next(&mut self, dir: &Path, date: NaiveDate) -> usize {
        let last = self
            .last
            .entry((dir.to_path_buf(), date))
            .or_insert_with(|| highest_sequence(dir, date));
        *last += 1;
        *last
    }
}

/// Highest number among `YYYYMMDD-NNNNN*` entries of `dir`, or 0
fn highest_sequence(dir: &Path, date: NaiveDate) -> usize {
    let prefix = format!("{}-", date.format("%Y%m%d"));
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let digits: String = name
                .strip_prefix(&prefix)?
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            digits.parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

// ============================================================================
// Collision handling
// ============================================================================

/// `name` with a numeric suffix before the extension: `a.jpg` -> `a_2.jpg`
pub fn suffixed_name(name: &str, n: usize) -> String {
    let path = Path::new(name);
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => format!(
            "{}_{}.{}",
            stem.to_string_lossy(),
            n,
            ext.to_string_lossy()
        ),
        _ => format!("{}_{}", name, n),
    }
}

/// Target paths currently being written, shared by all sessions
#[derive(Debug, Clone, Default)]
pub struct TargetReservations {
    reserved: Arc<Mutex<HashSet<PathBuf>>>,
}

/// A reserved target path, released when dropped
#[derive(Debug)]
pub struct Reservation {
    path: PathBuf,
    reserved: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Reservation {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.reserved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.path);
    }
}

impl TargetReservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the first free path for `file_name` in `dir`.
    ///
    /// A path is taken if it exists on disk or is reserved by another
    /// transfer.
    pub fn reserve(&self, dir: &Path, file_name: &str) -> Reservation {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());

        let mut n = 0;
        loop {
            let candidate = if n == 0 {
                dir.join(file_name)
            } else {
                dir.join(suffixed_name(file_name, n))
            };
            n += 1;

            if reserved.contains(&candidate) || candidate.symlink_metadata().is_ok() {
                continue;
            }

            reserved.insert(candidate.clone());
            return Reservation {
                path: candidate,
                reserved: Arc::clone(&self.reserved),
            };
        }
    }

    /// Number of paths currently reserved
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.reserved.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
