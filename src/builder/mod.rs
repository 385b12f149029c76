//! Builder image metadata
//!
//! A builder image carries everything the build needs to know about it in its
//! config labels: the bundled buildpacks, the default order, the lifecycle it
//! ships and the Platform/Buildpack APIs that lifecycle supports.

use crate::buildpack::resolver::{LayersLabel, BUILDPACK_LAYERS_LABEL};
use crate::buildpack::{BuildpackRef, SourceKind};
use crate::compat::{ApiRange, ApiVersion, VersionParseError};
use crate::engine::{ensure_image, ContainerEngine, EngineError, ImageInfo, PullOptions};
use crate::order::{EntrySpec, GroupSpec, OrderSpec};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const BUILDER_METADATA_LABEL: &str = "io.buildpacks.builder.metadata";
pub const BUILDER_ORDER_LABEL: &str = "io.buildpacks.buildpack.order";
pub const LIFECYCLE_APIS_LABEL: &str = "io.buildpacks.lifecycle.apis";
pub const LIFECYCLE_VERSION_LABEL: &str = "io.buildpacks.lifecycle.version";

#[derive(Debug, Clone, Error)]
pub enum BuilderError {
    #[error("Image {image} is missing label {label}")]
    MissingLabel { image: String, label: &'static str },

    #[error("Invalid label {label} on {image}: {message}")]
    InvalidLabel {
        image: String,
        label: &'static str,
        message: String,
    },

    #[error("Image {0} does not declare a supported Platform API")]
    MissingPlatformApi(String),

    #[error("Failed to fetch {image}: {source}")]
    Fetch {
        image: String,
        #[source]
        source: EngineError,
    },
}

#[derive(Debug, Deserialize)]
struct BuilderMetadataLabel {
    #[serde(default)]
    description: String,
    #[serde(default)]
    buildpacks: Vec<BundledBuildpack>,
    #[serde(default)]
    stack: Option<StackMetadata>,
    #[serde(default)]
    lifecycle: LifecycleMetadata,
    #[serde(default, rename = "createdBy")]
    created_by: Option<CreatedBy>,
}

#[derive(Debug, Deserialize)]
struct BundledBuildpack {
    id: String,
    #[serde(default)]
    version: String,
}

#[derive(Debug, Deserialize)]
struct StackMetadata {
    #[serde(rename = "runImage")]
    run_image: Option<RunImageMetadata>,
}

#[derive(Debug, Deserialize)]
struct RunImageMetadata {
    image: String,
    #[serde(default)]
    mirrors: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LifecycleMetadata {
    #[serde(default)]
    version: String,
    /// Single-version form written by older builders
    #[serde(default)]
    api: Option<LegacyApis>,
    #[serde(default)]
    apis: Option<LifecycleApis>,
}

#[derive(Debug, Deserialize)]
struct LegacyApis {
    buildpack: Option<String>,
    platform: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LifecycleApis {
    #[serde(default)]
    buildpack: ApiSet,
    #[serde(default)]
    platform: ApiSet,
}

#[derive(Debug, Default, Deserialize)]
struct ApiSet {
    #[serde(default)]
    deprecated: Vec<String>,
    #[serde(default)]
    supported: Vec<String>,
}

impl ApiSet {
    fn range(&self) -> Result<Option<ApiRange>, VersionParseError> {
        ApiRange::from_versions(
            self.supported
                .iter()
                .chain(self.deprecated.iter())
                .map(String::as_str),
        )
    }
}

#[derive(Debug, Deserialize)]
struct CreatedBy {
    name: Option<String>,
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderGroupLabel {
    #[serde(default)]
    group: Vec<OrderEntryLabel>,
}

#[derive(Debug, Deserialize)]
struct OrderEntryLabel {
    id: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    optional: bool,
}

/// Lifecycle version and the API ranges it can run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleDescriptor {
    pub version: String,
    pub platform_api: ApiRange,
    pub buildpack_api: Option<ApiRange>,
}

impl LifecycleDescriptor {
    /// Reads a standalone lifecycle image's labels
    pub fn from_image(reference: &str, info: &ImageInfo) -> Result<Self, BuilderError> {
        let raw = info
            .label(LIFECYCLE_APIS_LABEL)
            .ok_or_else(|| BuilderError::MissingLabel {
                image: reference.to_string(),
                label: LIFECYCLE_APIS_LABEL,
            })?;
        let apis: LifecycleApis = parse_label(reference, LIFECYCLE_APIS_LABEL, raw)?;
        let platform_api = apis
            .platform
            .range()
            .map_err(|e| invalid(reference, LIFECYCLE_APIS_LABEL, e))?
            .ok_or_else(|| BuilderError::MissingPlatformApi(reference.to_string()))?;
        let buildpack_api = apis
            .buildpack
            .range()
            .map_err(|e| invalid(reference, LIFECYCLE_APIS_LABEL, e))?;

        Ok(Self {
            version: info
                .label(LIFECYCLE_VERSION_LABEL)
                .unwrap_or_default()
                .to_string(),
            platform_api,
            buildpack_api,
        })
    }

    pub async fn fetch(
        engine: &dyn ContainerEngine,
        reference: &str,
        pull: &PullOptions,
    ) -> Result<Self, BuilderError> {
        let info = ensure_image(engine, reference, pull)
            .await
            .map_err(|source| BuilderError::Fetch {
                image: reference.to_string(),
                source,
            })?;
        Self::from_image(reference, &info)
    }
}

/// Everything the build reads from a builder image
#[derive(Debug, Clone, Serialize)]
pub struct Builder {
    pub reference: String,
    /// Image id; part of the cache key
    pub digest: String,
    pub description: String,
    pub created_by: Option<String>,
    /// Platform API range the builder declares
    pub platform_api: ApiRange,
    pub lifecycle: LifecycleDescriptor,
    pub buildpacks: Vec<BuildpackRef>,
    pub default_order: OrderSpec,
    pub run_image: Option<String>,
    pub run_image_mirrors: Vec<String>,
}

impl Builder {
    pub fn from_image(reference: &str, info: &ImageInfo) -> Result<Self, BuilderError> {
        let raw = info
            .label(BUILDER_METADATA_LABEL)
            .ok_or_else(|| BuilderError::MissingLabel {
                image: reference.to_string(),
                label: BUILDER_METADATA_LABEL,
            })?;
        let metadata: BuilderMetadataLabel = parse_label(reference, BUILDER_METADATA_LABEL, raw)?;

        let (platform_api, metadata_buildpack_api) = declared_apis(reference, &metadata.lifecycle)?;

        // A dedicated lifecycle label is authoritative for what the binary supports
        let lifecycle = match info.label(LIFECYCLE_APIS_LABEL) {
            Some(_) => {
                let mut lifecycle = LifecycleDescriptor::from_image(reference, info)?;
                if lifecycle.version.is_empty() {
                    lifecycle.version = metadata.lifecycle.version.clone();
                }
                lifecycle
            }
            None => LifecycleDescriptor {
                version: metadata.lifecycle.version.clone(),
                platform_api,
                buildpack_api: metadata_buildpack_api,
            },
        };

        let layers: LayersLabel = match info.label(BUILDPACK_LAYERS_LABEL) {
            Some(raw) => parse_label(reference, BUILDPACK_LAYERS_LABEL, raw)?,
            None => LayersLabel::new(),
        };
        let buildpacks = metadata
            .buildpacks
            .iter()
            .map(|bp| bundled_ref(reference, bp, &layers))
            .collect::<Result<Vec<_>, _>>()?;

        let default_order = match info.label(BUILDER_ORDER_LABEL) {
            Some(raw) => {
                let groups: Vec<OrderGroupLabel> = parse_label(reference, BUILDER_ORDER_LABEL, raw)?;
                order_from_label(groups)
            }
            None => OrderSpec::default(),
        };

        let run_image = metadata
            .stack
            .as_ref()
            .and_then(|s| s.run_image.as_ref());

        let builder = Self {
            reference: reference.to_string(),
            digest: info.id.clone(),
            description: metadata.description.clone(),
            created_by: metadata.created_by.as_ref().map(|c| {
                format!(
                    "{} {}",
                    c.name.as_deref().unwrap_or("unknown"),
                    c.version.as_deref().unwrap_or_default()
                )
                .trim()
                .to_string()
            }),
            platform_api,
            lifecycle,
            buildpacks,
            default_order,
            run_image: run_image.map(|r| r.image.clone()),
            run_image_mirrors: run_image.map(|r| r.mirrors.clone()).unwrap_or_default(),
        };
        debug!(
            builder = %reference,
            buildpacks = builder.buildpacks.len(),
            groups = builder.default_order.groups.len(),
            "Parsed builder metadata"
        );
        Ok(builder)
    }

    /// Makes the builder image available per the pull policy and reads it
    pub async fn fetch(
        engine: &dyn ContainerEngine,
        reference: &str,
        pull: &PullOptions,
    ) -> Result<Self, BuilderError> {
        let info = ensure_image(engine, reference, pull)
            .await
            .map_err(|source| BuilderError::Fetch {
                image: reference.to_string(),
                source,
            })?;
        let builder = Self::from_image(reference, &info)?;
        info!(
            builder = %reference,
            lifecycle = %builder.lifecycle.version,
            platform_api = %builder.platform_api,
            "Using builder"
        );
        Ok(builder)
    }
}

fn declared_apis(
    reference: &str,
    lifecycle: &LifecycleMetadata,
) -> Result<(ApiRange, Option<ApiRange>), BuilderError> {
    if let Some(apis) = &lifecycle.apis {
        let platform = apis
            .platform
            .range()
            .map_err(|e| invalid(reference, BUILDER_METADATA_LABEL, e))?;
        let buildpack = apis
            .buildpack
            .range()
            .map_err(|e| invalid(reference, BUILDER_METADATA_LABEL, e))?;
        if let Some(platform) = platform {
            return Ok((platform, buildpack));
        }
    }

    if let Some(legacy) = &lifecycle.api {
        let parse = |raw: &Option<String>| -> Result<Option<ApiRange>, BuilderError> {
            raw.as_deref()
                .map(|v| {
                    v.parse::<ApiVersion>()
                        .map(ApiRange::exact)
                        .map_err(|e| invalid(reference, BUILDER_METADATA_LABEL, e))
                })
                .transpose()
        };
        if let Some(platform) = parse(&legacy.platform)? {
            return Ok((platform, parse(&legacy.buildpack)?));
        }
    }

    Err(BuilderError::MissingPlatformApi(reference.to_string()))
}

fn bundled_ref(
    reference: &str,
    bp: &BundledBuildpack,
    layers: &LayersLabel,
) -> Result<BuildpackRef, BuilderError> {
    let mut buildpack = BuildpackRef::new(&bp.id, &bp.version, SourceKind::Builder);
    if let Some(layer) = layers.get(&bp.id).and_then(|v| v.get(&bp.version)) {
        buildpack.network = layer.network;
        buildpack.api = layer
            .api
            .as_deref()
            .map(str::parse::<ApiVersion>)
            .transpose()
            .map_err(|e| invalid(reference, BUILDPACK_LAYERS_LABEL, e))?;
    }
    Ok(buildpack)
}

fn order_from_label(groups: Vec<OrderGroupLabel>) -> OrderSpec {
    OrderSpec {
        groups: groups
            .into_iter()
            .map(|group| GroupSpec {
                entries: group
                    .group
                    .into_iter()
                    .map(|entry| {
                        let reference = match entry.version {
                            Some(version) if !version.is_empty() => {
                                format!("urn:cnb:builder:{}@{}", entry.id, version)
                            }
                            _ => format!("urn:cnb:builder:{}", entry.id),
                        };
                        EntrySpec {
                            reference,
                            optional: entry.optional,
                        }
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn parse_label<T: serde::de::DeserializeOwned>(
    image: &str,
    label: &'static str,
    raw: &str,
) -> Result<T, BuilderError> {
    serde_json::from_str(raw).map_err(|e| invalid(image, label, e))
}

fn invalid(image: &str, label: &'static str, err: impl std::fmt::Display) -> BuilderError {
    BuilderError::InvalidLabel {
        image: image.to_string(),
        label,
        message: err.to_string(),
    }
}
