//! `buildpack.toml` parsing

use crate::compat::ApiVersion;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;

pub const DESCRIPTOR_FILE: &str = "buildpack.toml";

#[derive(Debug, Deserialize)]
struct DescriptorToml {
    api: Option<String>,
    buildpack: BuildpackTable,
    #[serde(default)]
    metadata: Option<toml::Table>,
}

#[derive(Debug, Deserialize)]
struct BuildpackTable {
    id: String,
    #[serde(default)]
    version: String,
    name: Option<String>,
}

/// The parts of a buildpack's own descriptor the build needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildpackDescriptor {
    pub id: String,
    pub version: String,
    pub name: Option<String>,
    pub api: Option<ApiVersion>,
    pub network: bool,
}

impl BuildpackDescriptor {
    pub fn parse(content: &str) -> Result<Self> {
        let raw: DescriptorToml = toml::from_str(content).context("Invalid buildpack.toml")?;

        if raw.buildpack.id.trim().is_empty() {
            return Err(anyhow!("buildpack.toml has an empty buildpack id"));
        }

        let api = raw
            .api
            .as_deref()
            .map(str::parse::<ApiVersion>)
            .transpose()
            .context("Invalid api in buildpack.toml")?;

        let network = raw
            .metadata
            .as_ref()
            .and_then(|m| m.get("network"))
            .and_then(toml::Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            id: raw.buildpack.id,
            version: raw.buildpack.version,
            name: raw.buildpack.name,
            api,
            network,
        })
    }

    pub fn read_from(dir: &Path) -> Result<Self> {
        let path = dir.join(DESCRIPTOR_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("No {} in {}", DESCRIPTOR_FILE, dir.display()))?;
        Self::parse(&content)
    }
}
