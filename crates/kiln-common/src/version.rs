//! Opaque, ordered runtime versions.
//!
//! Runtimes report versions in slightly different shapes
//! (`24.0.7`, `v1.13.1`, `20.10.21+dfsg1`, `27.0.0-rc.1`). Callers only
//! ever compare them, so [`RuntimeVersion`] keeps the raw text for display
//! and orders on the numeric release followed by the pre-release tag.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KilnError;

/// A comparable runtime version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RuntimeVersion {
    raw: String,
    release: Vec<u64>,
    pre: Option<String>,
}

impl RuntimeVersion {
    /// Parse a version string.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidVersion`] if no numeric release is found.
    pub fn parse(value: &str) -> Result<Self, KilnError> {
        let invalid = || KilnError::InvalidVersion {
            value: value.to_string(),
        };

        let trimmed = value.trim();
        let unprefixed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let without_build = unprefixed.split('+').next().unwrap_or_default();
        let (release, pre) = match without_build.split_once('-') {
            Some((release, pre)) => (release, Some(pre.to_string())),
            None => (without_build, None),
        };

        if release.is_empty() {
            return Err(invalid());
        }

        let release = release
            .split('.')
            .map(|part| part.parse::<u64>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: trimmed.to_string(),
            release,
            pre: pre.filter(|p| !p.is_empty()),
        })
    }

    /// Numeric release components.
    #[must_use]
    pub fn release(&self) -> &[u64] {
        &self.release
    }

    /// Whether this version is a pre-release.
    #[must_use]
    pub const fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }

    /// Whether this version is greater than or equal to `other`.
    #[must_use]
    pub fn at_least(&self, other: &Self) -> bool {
        self >= other
    }

    fn component(&self, index: usize) -> u64 {
        self.release.get(index).copied().unwrap_or(0)
    }
}

impl Ord for RuntimeVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let width = self.release.len().max(other.release.len());
        for index in 0..width {
            match self.component(index).cmp(&other.component(index)) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
        }

        match (&self.pre, &other.pre) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for RuntimeVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RuntimeVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RuntimeVersion {}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for RuntimeVersion {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RuntimeVersion {
    type Error = KilnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RuntimeVersion> for String {
    fn from(version: RuntimeVersion) -> Self {
        version.raw
    }
}
