//! Version gate for polling nodes and gateways.
//!
//! Versions are `major.minor.patch`. A candidate is compatible with a
//! required minimum when the major versions are equal and the candidate's
//! minor version is at least the required one; the patch component is
//! informational only.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Version {
        Version { major, minor, patch }
    }

    /// Whether `candidate` satisfies `self` as a required minimum.
    pub fn is_compatible(&self, candidate: &Version) -> bool {
        self.major == candidate.major && candidate.minor >= self.minor
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("could not parse version string {0:?}")]
pub struct VersionParseError(pub String);

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Version, VersionParseError> {
        let mut parts = s.trim().splitn(3, '.');
        let mut next = || -> Result<u32, VersionParseError> {
            parts
                .next()
                .ok_or_else(|| VersionParseError(s.to_string()))?
                .parse::<u32>()
                .map_err(|_| VersionParseError(s.to_string()))
        };
        let major = next()?;
        let minor = next()?;
        let patch = next()?;
        Ok(Version { major, minor, patch })
    }
}
