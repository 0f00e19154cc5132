use core::{fmt, str::FromStr};

use log::{error, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("version string is empty")]
    Empty,
    #[error("`{input}` has {found} component(s), expected 3")]
    WrongComponentCount { input: String, found: usize },
    #[error("`{component}` in `{input}` is not a non-negative integer")]
    InvalidComponent { input: String, component: String },
}

impl Version {
    pub const ZERO: Version = Version::new(0, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Accepts `1.2.3`, `v1.2.3` and `V1.2.3`, nothing looser.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        let bare = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        if bare.is_empty() {
            return Err(VersionError::Empty);
        }

        let components: Vec<&str> = bare.split('.').collect();
        if components.len() != 3 {
            return Err(VersionError::WrongComponentCount {
                input: input.to_string(),
                found: components.len(),
            });
        }

        let mut parsed = [0_u32; 3];
        for (slot, component) in parsed.iter_mut().zip(&components) {
            if component.is_empty() || !component.bytes().all(|b| b.is_ascii_digit()) {
                return Err(VersionError::InvalidComponent {
                    input: input.to_string(),
                    component: component.to_string(),
                });
            }
            *slot = component
                .parse()
                .map_err(|_| VersionError::InvalidComponent {
                    input: input.to_string(),
                    component: component.to_string(),
                })?;
        }

        Ok(Self::new(parsed[0], parsed[1], parsed[2]))
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

pub fn compare(a: Version, b: Version) -> core::cmp::Ordering {
    a.cmp(&b)
}

pub fn update_needed(current: Version, candidate: Version) -> bool {
    candidate > current
}

/// Caller policy over raw strings: an unparsable current version counts as
/// `0.0.0`, an unparsable candidate never triggers an update.
pub fn evaluate_update(current: &str, candidate: &str) -> bool {
    let current = match Version::parse(current) {
        Ok(version) => version,
        Err(err) => {
            error!("installed version unusable ({err}); treating it as {}", Version::ZERO);
            Version::ZERO
        }
    };

    match Version::parse(candidate) {
        Ok(candidate) => update_needed(current, candidate),
        Err(err) => {
            warn!("ignoring release with unusable version: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use core::cmp::Ordering;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn prefix_is_optional() {
        assert_eq!(Version::parse("v1.2.3"), Ok(Version::new(1, 2, 3)));
        assert_eq!(Version::parse("V1.2.3"), Ok(Version::new(1, 2, 3)));
        assert_eq!(Version::parse("1.2.3"), Ok(Version::new(1, 2, 3)));
        assert_eq!(" v10.0.7 ".parse::<Version>(), Ok(Version::new(10, 0, 7)));
    }

    #[test]
    fn rejects_short_and_long_versions() {
        assert!(matches!(
            Version::parse("1.2"),
            Err(VersionError::WrongComponentCount { found: 2, .. })
        ));
        assert!(matches!(
            Version::parse("1.2.3.4"),
            Err(VersionError::WrongComponentCount { found: 4, .. })
        ));
        assert_eq!(Version::parse(""), Err(VersionError::Empty));
        assert_eq!(Version::parse("v"), Err(VersionError::Empty));
    }

    #[test]
    fn rejects_non_numeric_components() {
        for input in ["1.2.x", "1.-2.3", "1..3", "1.2.3-rc1", "+1.2.3"] {
            assert!(
                matches!(
                    Version::parse(input),
                    Err(VersionError::InvalidComponent { .. })
                        | Err(VersionError::WrongComponentCount { .. })
                ),
                "{input} should not parse"
            );
        }
    }

    #[test]
    fn orders_lexicographically() {
        assert_eq!(
            compare(Version::new(1, 0, 0), Version::new(1, 0, 1)),
            Ordering::Less
        );
        assert_eq!(
            compare(Version::new(2, 0, 0), Version::new(1, 9, 9)),
            Ordering::Greater
        );
        assert_eq!(
            compare(Version::new(1, 10, 0), Version::new(1, 9, 0)),
            Ordering::Greater
        );
        assert_eq!(
            compare(Version::new(3, 1, 4), Version::new(3, 1, 4)),
            Ordering::Equal
        );
    }

    #[test]
    fn equal_version_needs_no_update() {
        assert!(!update_needed(Version::new(1, 0, 0), Version::new(1, 0, 0)));
        assert!(!update_needed(Version::new(1, 0, 1), Version::new(1, 0, 0)));
        assert!(update_needed(Version::new(1, 0, 0), Version::new(1, 0, 1)));
    }

    #[test]
    fn unparsable_current_defaults_to_zero() {
        assert!(evaluate_update("", "v1.0.0"));
        assert!(evaluate_update("garbage", "0.0.1"));
        assert!(!evaluate_update("", "0.0.0"));
    }

    #[test]
    fn unparsable_candidate_is_never_needed() {
        assert!(!evaluate_update("1.0.0", "nightly"));
        assert!(!evaluate_update("", "2.0"));
    }
}
