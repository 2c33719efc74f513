//! Path rule engine
//!
//! Compiles a profile's include/exclude patterns and source directories into
//! a `PathRules` value, produces the candidate files of a mounted volume in a
//! deterministic order, and renders the profile's target directory template.

use crate::core::config::GrabProfile;
use chrono::{DateTime, Datelike, Local, NaiveDate};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use log::{debug, trace, warn};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use walkdir::WalkDir;

/// Errors compiling a profile's rules
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("invalid pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error("unknown template token '{{{0}}}'")]
    UnknownToken(String),

    #[error("unterminated token in template '{0}'")]
    Unterminated(String),

    #[error("source directory '{}' must stay inside the device", .0.display())]
    SourceDir(PathBuf),
}

/// A file accepted by the rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Absolute path on the mounted volume
    pub abs_path: PathBuf,
    /// Path relative to the mount root
    pub rel_path: PathBuf,
    /// Configured source directory the file was found under
    pub source_dir: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl SourceFile {
    /// Original file name
    pub fn file_name(&self) -> String {
        self.abs_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Parent directory relative to the source directory
    pub fn relative_parent(&self) -> PathBuf {
        let rel = self
            .rel_path
            .strip_prefix(&self.source_dir)
            .unwrap_or(&self.rel_path);
        rel.parent().map(Path::to_path_buf).unwrap_or_default()
    }
}

/// Compiled include/exclude rules, source directories and target template
#[derive(Debug, Clone)]
pub struct PathRules {
    source_dirs: Vec<PathBuf>,
    include: Option<GlobSet>,
    exclude: GlobSet,
    template: TargetTemplate,
}

fn build_set(patterns: &[String]) -> Result<GlobSet, RuleError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| RuleError::Pattern {
                pattern: pattern.clone(),
                message: e.kind().to_string(),
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| RuleError::Pattern {
        pattern: patterns.join(", "),
        message: e.to_string(),
    })
}

fn normalize_source_dir(dir: &Path) -> Result<PathBuf, RuleError> {
    let mut out = PathBuf::new();
    for component in dir.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return Err(RuleError::SourceDir(dir.to_path_buf())),
        }
    }
    Ok(out)
}

impl PathRules {
    /// Compile the rules of a profile
    pub fn from_profile(profile: &GrabProfile) -> Result<Self, RuleError> {
        let mut includes = profile.include.clone();
        includes.extend(
            profile
                .types
                .iter()
                .map(|t| t.trim().trim_start_matches('.').to_lowercase())
                .filter(|t| !t.is_empty())
                .map(|t| format!("*.{}", t)),
        );

        let include = if includes.is_empty() {
            None
        } else {
            Some(build_set(&includes)?)
        };
        let exclude = build_set(&profile.exclude)?;

        let mut source_dirs = profile
            .source_dirs
            .iter()
            .map(|d| normalize_source_dir(d))
            .collect::<Result<Vec<_>, _>>()?;
        if source_dirs.is_empty() {
            source_dirs.push(PathBuf::new());
        }

        Ok(Self {
            source_dirs,
            include,
            exclude,
            template: TargetTemplate::parse(&profile.target_template)?,
        })
    }

    /// Whether a path (relative to its source directory) passes the filters
    pub fn accepts(&self, relative: &Path) -> bool {
        let name = relative.file_name().map(Path::new);
        let matches = |set: &GlobSet| set.is_match(relative) || name.is_some_and(|n| set.is_match(n));

        if matches(&self.exclude) {
            return false;
        }
        self.include.as_ref().map_or(true, matches)
    }

    /// Lazily walk the configured source directories of a mounted volume.
    ///
    /// Entries are sorted by file name, so two walks of an unchanged tree
    /// yield the same sequence.
    pub fn candidates<'a>(&'a self, root: &Path) -> Candidates<'a> {
        Candidates {
            rules: self,
            root: root.to_path_buf(),
            next_dir: 0,
            current: None,
        }
    }

    /// Target directory for a file
    pub fn target_dir(&self, destination_base: &Path, ctx: &TemplateContext<'_>) -> PathBuf {
        destination_base.join(self.template.render(ctx))
    }
}

/// Iterator returned by [`PathRules::candidates`]
pub struct Candidates<'a> {
    rules: &'a PathRules,
    root: PathBuf,
    next_dir: usize,
    current: Option<(PathBuf, walkdir::IntoIter)>,
}

impl Candidates<'_> {
    fn open_next_dir(&mut self) -> bool {
        while let Some(dir) = self.rules.source_dirs.get(self.next_dir) {
            self.next_dir += 1;
            let abs = self.root.join(dir);
            if !abs.is_dir() {
                debug!("Source directory {} not present, skipping", abs.display());
                continue;
            }
            trace!("Walking {}", abs.display());
            let walker = WalkDir::new(&abs).sort_by_file_name().into_iter();
            self.current = Some((dir.clone(), walker));
            return true;
        }
        false
    }
}

impl Iterator for Candidates<'_> {
    type Item = SourceFile;

    fn next(&mut self) -> Option<SourceFile> {
        loop {
            if self.current.is_none() && !self.open_next_dir() {
                return None;
            }
            let (source_dir, walker) = self.current.as_mut()?;

            let entry = match walker.next() {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    warn!("Error walking {}: {}", self.root.display(), e);
                    continue;
                }
                None => {
                    self.current = None;
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let abs_path = entry.path().to_path_buf();
            let Ok(rel_path) = abs_path.strip_prefix(&self.root).map(Path::to_path_buf) else {
                continue;
            };
            let relative = rel_path.strip_prefix(&*source_dir).unwrap_or(&rel_path);
            if !self.rules.accepts(relative) {
                trace!("Filtered out {}", rel_path.display());
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("Cannot stat {}: {}", abs_path.display(), e);
                    continue;
                }
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

            return Some(SourceFile {
                abs_path,
                rel_path,
                source_dir: source_dir.clone(),
                size: metadata.len(),
                modified,
            });
        }
    }
}

// ============================================================================
// Target template
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Label,
    Identity,
    Profile,
    Session,
    SourceDir,
    Year,
    Month,
    Day,
    Parent,
}

impl Token {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "label" => Token::Label,
            "identity" => Token::Identity,
            "profile" => Token::Profile,
            "session" => Token::Session,
            "source_dir" => Token::SourceDir,
            "year" => Token::Year,
            "month" => Token::Month,
            "day" => Token::Day,
            "parent" => Token::Parent,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Token(Token),
}

/// Values substituted into a target template
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub label: &'a str,
    pub identity: &'a str,
    pub profile: &'a str,
    pub session_start: DateTime<Local>,
    pub source_dir: &'a Path,
    pub date: NaiveDate,
    pub parent: &'a Path,
}

/// Parsed `target_template`, e.g. `{label}/{year}/{month}/{day}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTemplate {
    segments: Vec<Vec<Piece>>,
}

impl TargetTemplate {
    pub fn parse(template: &str) -> Result<Self, RuleError> {
        let mut segments = Vec::new();

        for raw in template.split(['/', '\\']) {
            let mut pieces = Vec::new();
            let mut rest = raw;

            while let Some(open) = rest.find('{') {
                if open > 0 {
                    pieces.push(Piece::Literal(rest[..open].to_string()));
                }
                let after = &rest[open + 1..];
                let close = after
                    .find('}')
                    .ok_or_else(|| RuleError::Unterminated(template.to_string()))?;
                let name = &after[..close];
                let token =
                    Token::parse(name).ok_or_else(|| RuleError::UnknownToken(name.to_string()))?;
                pieces.push(Piece::Token(token));
                rest = &after[close + 1..];
            }
            if !rest.is_empty() {
                pieces.push(Piece::Literal(rest.to_string()));
            }

            if !pieces.is_empty() {
                segments.push(pieces);
            }
        }

        Ok(Self { segments })
    }

    /// Render to a relative path. Empty, `.` and `..` segments are dropped.
    pub fn render(&self, ctx: &TemplateContext<'_>) -> PathBuf {
        let mut out = PathBuf::new();

        for pieces in &self.segments {
            let mut segment = String::new();
            for piece in pieces {
                match piece {
                    Piece::Literal(s) => segment.push_str(s),
                    Piece::Token(token) => segment.push_str(&sanitize(&token_value(*token, ctx))),
                }
            }
            let segment = segment.trim();
            if segment.is_empty() || segment == "." || segment == ".." {
                continue;
            }
            out.push(segment);
        }

        out
    }
}

fn token_value(token: Token, ctx: &TemplateContext<'_>) -> String {
    let last_component = |p: &Path| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };

    match token {
        Token::Label => ctx.label.to_string(),
        Token::Identity => ctx.identity.to_string(),
        Token::Profile => ctx.profile.to_string(),
        Token::Session => ctx.session_start.format("%Y%m%d_%H%M%S").to_string(),
        Token::SourceDir => last_component(ctx.source_dir),
        Token::Year => format!("{:04}", ctx.date.year()),
        Token::Month => format!("{:02}", ctx.date.month()),
        Token::Day => format!("{:02}", ctx.date.day()),
        Token::Parent => ctx.parent.to_string_lossy().into_owned(),
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect()
}
