use crate::{Error, Result};
use semver::{Prerelease, Version};
use std::cmp::Ordering;

/// Product version as found in specs and image tags.
///
/// Parsing is tolerant: `v2.5`, `2.5.4-20210902` and `2.5.4@sha256:...`
/// are all accepted. A purely numeric dash suffix is a build stamp and does
/// not take part in comparisons; any other suffix is a pre-release.
#[derive(Clone, Debug)]
pub struct Semver {
    pub version: Version,
    pub use_v: bool,
    pub build: Option<String>,
}

/// Image references pinned by digest only carry no comparable version
pub fn is_digest(str: &str) -> bool {
    let s = str.trim();
    s.starts_with("sha256:") || s.starts_with("@sha256:")
}

impl Semver {
    pub fn parse(str: &str) -> Result<Self> {
        let raw = str.trim();
        if is_digest(raw) {
            return Err(Error::Other(format!("{raw} is a digest, not a version")));
        }
        let raw = raw.split_once('@').map(|(v, _)| v).unwrap_or(raw);
        let use_v = raw.starts_with('v') || raw.starts_with('V');
        let raw = if use_v { &raw[1..] } else { raw };
        let (core, suffix) = match raw.split_once('-') {
            Some((core, suffix)) => (core, Some(suffix)),
            None => (raw, None),
        };
        let mut parts = core.split('.');
        let mut next = || -> Result<u64> {
            match parts.next() {
                None => Ok(0),
                Some(p) => p
                    .parse::<u64>()
                    .map_err(|_| Error::Other(format!("invalid version {str}"))),
            }
        };
        let (major, minor, patch) = (next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(Error::Other(format!("invalid version {str}")));
        }
        let mut version = Version::new(major, minor, patch);
        let mut build = None;
        match suffix {
            Some(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => build = Some(s.to_string()),
            Some(s) => version.pre = Prerelease::new(s)?,
            None => {}
        }
        Ok(Self { version, use_v, build })
    }

    pub fn opt_parse(str: &str) -> Option<Self> {
        Self::parse(str).ok()
    }

    /// `from < boundary <= to`, false when either side is not comparable
    pub fn crosses(from: &str, to: &str, boundary: &Semver) -> bool {
        match (Self::opt_parse(from), Self::opt_parse(to)) {
            (Some(from), Some(to)) => from < *boundary && *boundary <= to,
            _ => false,
        }
    }
}

impl PartialEq for Semver {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Semver {}

impl PartialOrd for Semver {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Semver {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version.cmp(&other.version)
    }
}

impl std::fmt::Display for Semver {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.use_v {
            write!(formatter, "v")?;
        }
        write!(formatter, "{}", self.version)?;
        if let Some(build) = &self.build {
            write!(formatter, "-{build}")?;
        }
        Ok(())
    }
}
