//! API versions and inclusive version ranges

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid API version '{0}': expected <major>.<minor>")]
pub struct VersionParseError(pub String);

/// A `<major>.<minor>` API version as used by the Platform and Buildpack APIs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl FromStr for ApiVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let (major, minor) = trimmed
            .split_once('.')
            .ok_or_else(|| VersionParseError(s.to_string()))?;
        let major = major
            .parse::<u32>()
            .map_err(|_| VersionParseError(s.to_string()))?;
        let minor = minor
            .parse::<u32>()
            .map_err(|_| VersionParseError(s.to_string()))?;
        Ok(Self { major, minor })
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Serialize for ApiVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ApiVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Inclusive range `[min, max]`; a single declared version is `[v, v]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApiRange {
    pub min: ApiVersion,
    pub max: ApiVersion,
}

impl ApiRange {
    pub fn new(min: ApiVersion, max: ApiVersion) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn exact(version: ApiVersion) -> Self {
        Self {
            min: version,
            max: version,
        }
    }

    pub fn contains(&self, version: ApiVersion) -> bool {
        self.min <= version && version <= self.max
    }

    /// Overlap of two ranges, if any
    pub fn intersect(&self, other: &ApiRange) -> Option<ApiRange> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        (min <= max).then_some(ApiRange { min, max })
    }

    /// Range spanning a list of supported versions, e.g. a label's `supported` array
    pub fn from_versions<'a>(
        versions: impl IntoIterator<Item = &'a str>,
    ) -> Result<Option<ApiRange>, VersionParseError> {
        let mut range: Option<ApiRange> = None;
        for raw in versions {
            let version: ApiVersion = raw.parse()?;
            range = Some(match range {
                None => ApiRange::exact(version),
                Some(r) => ApiRange::new(r.min.min(version), r.max.max(version)),
            });
        }
        Ok(range)
    }
}

impl FromStr for ApiRange {
    type Err = VersionParseError;

    /// Accepts `0.7` or `0.4-0.9`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((min, max)) => Ok(ApiRange::new(min.parse()?, max.parse()?)),
            None => Ok(ApiRange::exact(s.parse()?)),
        }
    }
}

impl fmt::Display for ApiRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "[{}, {}]", self.min, self.max)
        }
    }
}

impl Serialize for ApiRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}
