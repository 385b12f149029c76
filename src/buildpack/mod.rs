//! Buildpack references and their resolution
//!
//! A buildpack identifier supplied by a user or a builder can point at a local
//! directory or archive, a packaged buildpack image, a registry entry, or a
//! buildpack already bundled inside the builder. [`BuildpackResolver`] turns any of
//! those into a [`BuildpackRef`] the lifecycle can execute.

pub mod descriptor;
pub mod local;
pub mod locator;
pub mod registry;
pub mod resolver;

use crate::compat::ApiVersion;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

pub use descriptor::BuildpackDescriptor;
pub use local::{LocalBuildpack, LocalStore};
pub use locator::Locator;
pub use registry::{
    BuildpackRegistry, IndexRegistry, RegistryConfig, RegistryEntry, RegistryError, RegistryKind,
};
pub use resolver::{BuildpackResolver, ResolveError};

/// Where a buildpack reference was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Local,
    PackagedImage,
    Registry,
    Builder,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Local => "local",
            SourceKind::PackagedImage => "packaged-image",
            SourceKind::Registry => "registry",
            SourceKind::Builder => "builder",
        };
        write!(f, "{}", name)
    }
}

/// Where the resolved buildpack content lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum ResolvedLocation {
    /// Already present in the builder image
    Builder,
    /// Extracted into the local content store
    Directory(PathBuf),
    /// A locally present buildpack image
    Image(String),
}

/// A fully resolved, executable buildpack
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildpackRef {
    pub id: String,
    pub version: String,
    pub source: SourceKind,
    pub location: ResolvedLocation,
    /// Buildpack API declared by the buildpack, when known
    pub api: Option<ApiVersion>,
    /// Opts in to network access during detect and build
    pub network: bool,
    /// Content digest of the stored copy or image id
    pub digest: Option<String>,
}

impl BuildpackRef {
    pub fn new(id: impl Into<String>, version: impl Into<String>, source: SourceKind) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            source,
            location: ResolvedLocation::Builder,
            api: None,
            network: false,
            digest: None,
        }
    }

    pub fn with_location(mut self, location: ResolvedLocation) -> Self {
        self.location = location;
        self
    }

    pub fn with_api(mut self, api: ApiVersion) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_network(mut self, network: bool) -> Self {
        self.network = network;
        self
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// `id@version`, the form the lifecycle prints in detect output
    pub fn display_name(&self) -> String {
        if self.version.is_empty() {
            self.id.clone()
        } else {
            format!("{}@{}", self.id, self.version)
        }
    }

    /// Id with `/` replaced, as used for directory names under `/cnb/buildpacks`
    pub fn escaped_id(&self) -> String {
        self.id.replace('/', "_")
    }
}

/// Orders version strings numerically by dotted component, falling back to text
pub(crate) fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    fn components(v: &str) -> Vec<Result<u64, &str>> {
        v.split(['.', '-', '+'])
            .map(|part| part.parse::<u64>().map_err(|_| part))
            .collect()
    }

    let (left, right) = (components(a), components(b));
    for (l, r) in left.iter().zip(right.iter()) {
        let ordering = match (l, r) {
            (Ok(x), Ok(y)) => x.cmp(y),
            (Ok(_), Err(_)) => std::cmp::Ordering::Greater,
            (Err(_), Ok(_)) => std::cmp::Ordering::Less,
            (Err(x), Err(y)) => x.cmp(y),
        };
        if ordering != std::cmp::Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}
