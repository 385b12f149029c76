//! Buildpack registry index lookup
//!
//! A registry is a git-hosted index: one file per `namespace/name`, stored under a
//! directory derived from the name length, holding newline-delimited JSON entries
//! `{"ns","name","version","yanked","addr"}`. The `addr` of an entry is the
//! packaged buildpack image to pull.

use super::compare_versions;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_REGISTRY_NAME: &str = "official";
pub const DEFAULT_REGISTRY_URL: &str = "https://github.com/buildpacks/registry-index";

const GITHUB_PREFIX: &str = "https://github.com/";
const RAW_GITHUB_PREFIX: &str = "https://raw.githubusercontent.com/";
const INDEX_BRANCH: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Invalid registry id '{0}': expected <namespace>/<name>")]
    InvalidId(String),

    #[error("Buildpack {id}{} not found in registry", .version.as_ref().map(|v| format!("@{}", v)).unwrap_or_default())]
    NotFound { id: String, version: Option<String> },

    #[error("Registry unreachable: {0}")]
    Unreachable(String),

    #[error("Malformed registry entry: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    #[default]
    Github,
}

impl FromStr for RegistryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(RegistryKind::Github),
            _ => Err(format!("Invalid registry type: {}. Valid options: github", s)),
        }
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryKind::Github => write!(f, "github"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RegistryKind,
    pub url: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_REGISTRY_NAME.to_string(),
            kind: RegistryKind::Github,
            url: DEFAULT_REGISTRY_URL.to_string(),
        }
    }
}

/// One published version of a buildpack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub ns: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub yanked: bool,
    pub addr: String,
}

impl RegistryEntry {
    pub fn id(&self) -> String {
        format!("{}/{}", self.ns, self.name)
    }
}

/// Looks up buildpack entries by `namespace/name`
#[async_trait]
pub trait BuildpackRegistry: Send + Sync {
    /// Newest non-yanked entry, or the exact version when given
    async fn locate(&self, id: &str, version: Option<&str>)
        -> Result<RegistryEntry, RegistryError>;

    fn name(&self) -> &str;
}

/// Registry backed by an HTTP(S) or `file://` index
pub struct IndexRegistry {
    config: RegistryConfig,
    client: reqwest::Client,
}

impl IndexRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Base URL that index paths are appended to
    fn content_base(&self) -> String {
        let url = self.config.url.trim_end_matches('/');
        match url.strip_prefix(GITHUB_PREFIX) {
            Some(repo) => format!(
                "{}{}/{}",
                RAW_GITHUB_PREFIX,
                repo.trim_end_matches(".git"),
                INDEX_BRANCH
            ),
            None => url.to_string(),
        }
    }

    async fn fetch_index(&self, ns: &str, name: &str) -> Result<String, RegistryError> {
        let path = index_path(ns, name)?;
        let base = self.content_base();

        if let Some(dir) = base.strip_prefix("file://") {
            let file = std::path::Path::new(dir).join(&path);
            return match tokio::fs::read_to_string(&file).await {
                Ok(content) => Ok(content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(RegistryError::NotFound {
                        id: format!("{}/{}", ns, name),
                        version: None,
                    })
                }
                Err(e) => Err(RegistryError::Unreachable(e.to_string())),
            };
        }

        let url = format!("{}/{}", base, path);
        debug!(registry = %self.config.name, url = %url, "Fetching registry index");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound {
                id: format!("{}/{}", ns, name),
                version: None,
            });
        }
        if !response.status().is_success() {
            return Err(RegistryError::Unreachable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| RegistryError::Unreachable(e.to_string()))
    }
}

#[async_trait]
impl BuildpackRegistry for IndexRegistry {
    async fn locate(
        &self,
        id: &str,
        version: Option<&str>,
    ) -> Result<RegistryEntry, RegistryError> {
        let (ns, name) = split_id(id)?;
        let content = self.fetch_index(ns, name).await?;
        let entries = parse_entries(&content)?;
        select_entry(entries, id, version)
    }

    fn name(&self) -> &str {
        &self.config.name
    }
}

fn split_id(id: &str) -> Result<(&str, &str), RegistryError> {
    match id.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((ns, name))
        }
        _ => Err(RegistryError::InvalidId(id.to_string())),
    }
}

/// Index file path for `ns/name`: `1/`, `2/`, `3/<ab>/` or `<ab>/<cd>/` by name length
pub fn index_path(ns: &str, name: &str) -> Result<String, RegistryError> {
    let valid = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    };
    if !valid(ns) || !valid(name) {
        return Err(RegistryError::InvalidId(format!("{}/{}", ns, name)));
    }

    let dir = match name.len() {
        1 => "1".to_string(),
        2 => "2".to_string(),
        3 => format!("3/{}", &name[..2]),
        _ => format!("{}/{}", &name[..2], &name[2..4]),
    };
    Ok(format!("{}/{}_{}", dir, ns, name))
}

pub fn parse_entries(content: &str) -> Result<Vec<RegistryEntry>, RegistryError> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<RegistryEntry>(line)
                .map_err(|e| RegistryError::Malformed(format!("{}: {}", e, line)))
        })
        .collect()
}

fn select_entry(
    entries: Vec<RegistryEntry>,
    id: &str,
    version: Option<&str>,
) -> Result<RegistryEntry, RegistryError> {
    let live = entries.into_iter().filter(|e| !e.yanked);
    let found = match version {
        Some(wanted) => live.into_iter().find(|e| e.version == wanted),
        None => live.max_by(|a, b| compare_versions(&a.version, &b.version)),
    };
    found.ok_or_else(|| RegistryError::NotFound {
        id: id.to_string(),
        version: version.map(str::to_string),
    })
}
