//! Profile matching
//!
//! Maps a mounted volume to the first configured `GrabProfile` whose device
//! matcher accepts it. Every predicate a matcher sets must hold; a matcher
//! with no predicates accepts any device.

use crate::core::config::{DeviceMatcher, GrabProfile};
use crate::core::rules::RuleError;
use crate::device::traits::MountedVolume;
use globset::{GlobBuilder, GlobMatcher};

/// A `DeviceMatcher` with its globs compiled
#[derive(Debug, Clone)]
pub struct CompiledMatcher {
    label: Option<GlobMatcher>,
    uuid: Option<String>,
    mount: Option<GlobMatcher>,
}

fn compile(pattern: &str, case_insensitive: bool) -> Result<GlobMatcher, RuleError> {
    GlobBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .literal_separator(false)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| RuleError::Pattern {
            pattern: pattern.to_string(),
            message: e.kind().to_string(),
        })
}

impl CompiledMatcher {
    pub fn new(matcher: &DeviceMatcher) -> Result<Self, RuleError> {
        Ok(Self {
            label: matcher.label.as_deref().map(|p| compile(p, true)).transpose()?,
            uuid: matcher.uuid.as_ref().map(|u| u.to_lowercase()),
            mount: matcher
                .mount_glob
                .as_deref()
                .map(|p| compile(p, false))
                .transpose()?,
        })
    }

    pub fn matches(&self, volume: &MountedVolume) -> bool {
        let identity = &volume.identity;

        if let Some(label) = &self.label {
            if !label.is_match(identity.label_or_name()) {
                return false;
            }
        }
        if let Some(uuid) = &self.uuid {
            match &identity.uuid {
                Some(actual) if actual.to_lowercase() == *uuid => {}
                _ => return false,
            }
        }
        if let Some(mount) = &self.mount {
            if !mount.is_match(&volume.mount_path) {
                return false;
            }
        }
        true
    }
}

/// Ordered profiles with compiled matchers
#[derive(Debug, Clone)]
pub struct ProfileMatcher {
    profiles: Vec<(GrabProfile, CompiledMatcher)>,
}

impl ProfileMatcher {
    pub fn new(profiles: &[GrabProfile]) -> Result<Self, RuleError> {
        let profiles = profiles
            .iter()
            .map(|p| Ok((p.clone(), CompiledMatcher::new(&p.matcher)?)))
            .collect::<Result<Vec<_>, RuleError>>()?;
        Ok(Self { profiles })
    }

    /// First profile, in configuration order, that accepts the volume
    pub fn select(&self, volume: &MountedVolume) -> Option<&GrabProfile> {
        self.profiles
            .iter()
            .find(|(_, matcher)| matcher.matches(volume))
            .map(|(profile, _)| profile)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceIdentity;
    use std::path::Path;

    fn profile(name: &str, matcher: DeviceMatcher) -> GrabProfile {
        GrabProfile {
            name: name.to_string(),
            matcher,
            ..GrabProfile::default()
        }
    }

    fn volume(label: Option<&str>, uuid: Option<&str>, path: &str) -> MountedVolume {
        MountedVolume::new(
            DeviceIdentity::new(
                label.map(String::from),
                uuid.map(String::from),
                None,
                Path::new(path),
            ),
            path,
        )
    }

    #[test]
    fn test_first_match_wins() {
        let matcher = ProfileMatcher::new(&[
            profile(
                "sony",
                DeviceMatcher {
                    label: Some("sony*".into()),
                    ..Default::default()
                },
            ),
            profile("fallback", DeviceMatcher::default()),
        ])
        .unwrap();
        assert_eq!(matcher.len(), 2);

        let sony = volume(Some("SONY_A7"), None, "/media/SONY_A7");
        let other = volume(Some("EOS_DIGITAL"), None, "/media/EOS_DIGITAL");
        assert_eq!(matcher.select(&sony).unwrap().name, "sony");
        assert_eq!(matcher.select(&other).unwrap().name, "fallback");
    }

    #[test]
    fn test_all_predicates_must_hold() {
        let matcher = ProfileMatcher::new(&[profile(
            "strict",
            DeviceMatcher {
                label: Some("CARD".into()),
                uuid: Some("ABCD-1234".into()),
                mount_glob: Some("/media/**".into()),
            },
        )])
        .unwrap();

        assert!(matcher
            .select(&volume(Some("card"), Some("abcd-1234"), "/media/user/card"))
            .is_some());
        assert!(matcher
            .select(&volume(Some("card"), None, "/media/user/card"))
            .is_none());
        assert!(matcher
            .select(&volume(Some("card"), Some("abcd-1234"), "/mnt/card"))
            .is_none());
        assert!(matcher
            .select(&volume(Some("other"), Some("abcd-1234"), "/media/other"))
            .is_none());
    }

    #[test]
    fn test_label_glob_uses_fallback_name() {
        let matcher = ProfileMatcher::new(&[profile(
            "by-dir",
            DeviceMatcher {
                label: Some("DCIM_*".into()),
                ..Default::default()
            },
        )])
        .unwrap();
        assert!(matcher
            .select(&volume(None, None, "/media/DCIM_01"))
            .is_some());
    }

    #[test]
    fn test_no_profiles_matches_nothing() {
        let matcher = ProfileMatcher::new(&[]).unwrap();
        assert!(matcher.is_empty());
        assert!(matcher.select(&volume(Some("A"), None, "/media/A")).is_none());
    }

    #[test]
    fn test_bad_glob_rejected() {
        let err = ProfileMatcher::new(&[profile(
            "bad",
            DeviceMatcher {
                label: Some("[unterminated".into()),
                ..Default::default()
            },
        )])
        .unwrap_err();
        assert!(matches!(err, RuleError::Pattern { .. }));
    }
}
