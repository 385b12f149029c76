//! Per-build ephemeral resources
//!
//! A build owns a layers volume shared by all its phases, a host platform
//! directory (`env/` files and `order.toml`), and whatever it took to make
//! non-builder buildpacks visible to the lifecycle. All of it is torn down by
//! [`BuildResources::teardown`] on every exit path; the scoped guards remove
//! anything left behind if the build future is dropped instead.

use super::plan::BUILDPACKS_DIR;
use crate::buildpack::{BuildpackRef, ResolvedLocation};
use crate::engine::{
    CleanupWarning, ContainerEngine, ContainerSpec, EngineError, MountSpec, NetworkMode,
    ScopedContainer, ScopedVolume,
};
use crate::order::Order;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

const PROVISION_ENTRYPOINT: &str = "/cnb/lifecycle/provision";

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to prepare platform directory: {0}")]
    Platform(String),
}

pub struct BuildResources {
    build_id: String,
    layers: Option<ScopedVolume>,
    platform_dir: Option<TempDir>,
    buildpack_volumes: Vec<ScopedVolume>,
    buildpack_mounts: Vec<MountSpec>,
}

impl BuildResources {
    /// Creates everything a build needs before its first phase
    pub async fn allocate(
        engine: Arc<dyn ContainerEngine>,
        build_id: &str,
        order: &Order,
        env: &[(String, String)],
    ) -> Result<Self, SetupError> {
        let platform_dir = tempfile::Builder::new()
            .prefix("cnbpack-platform-")
            .tempdir()
            .map_err(|e| SetupError::Platform(e.to_string()))?;
        write_platform_dir(platform_dir.path(), order, env)?;

        let layers =
            ScopedVolume::create(engine.clone(), format!("cnbpack-layers-{}", build_id)).await?;

        let mut resources = Self {
            build_id: build_id.to_string(),
            layers: Some(layers),
            platform_dir: Some(platform_dir),
            buildpack_volumes: Vec::new(),
            buildpack_mounts: Vec::new(),
        };

        if let Err(e) = resources.provision_buildpacks(engine, order).await {
            for warning in resources.teardown().await {
                warn!("{}", warning);
            }
            return Err(e);
        }

        debug!(
            build = %build_id,
            buildpack_mounts = resources.buildpack_mounts.len(),
            "Allocated build resources"
        );
        Ok(resources)
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn layers_volume(&self) -> &str {
        self.layers.as_ref().map(ScopedVolume::name).unwrap_or_default()
    }

    pub fn platform_dir(&self) -> &Path {
        self.platform_dir
            .as_ref()
            .map(TempDir::path)
            .unwrap_or_else(|| Path::new(""))
    }

    pub fn buildpack_mounts(&self) -> &[MountSpec] {
        &self.buildpack_mounts
    }

    /// Makes each non-builder buildpack visible under `/cnb/buildpacks/<id>/<version>`
    async fn provision_buildpacks(
        &mut self,
        engine: Arc<dyn ContainerEngine>,
        order: &Order,
    ) -> Result<(), SetupError> {
        let mut seen = HashSet::new();
        for buildpack in order.buildpacks() {
            if !seen.insert(buildpack.display_name()) {
                continue;
            }
            let target = buildpack_target(buildpack);
            match &buildpack.location {
                ResolvedLocation::Builder => {}
                ResolvedLocation::Directory(dir) => {
                    self.buildpack_mounts
                        .push(MountSpec::bind(dir, target, true));
                }
                ResolvedLocation::Image(image) => {
                    let volume = self
                        .populate_volume(engine.clone(), buildpack, image, &target)
                        .await?;
                    self.buildpack_mounts
                        .push(MountSpec::volume(volume, target, true));
                }
            }
        }
        Ok(())
    }

    /// Copies a buildpack image's content into a fresh volume. The engine fills an
    /// empty volume from the image when a container mounting it is created, so the
    /// helper container is never started.
    async fn populate_volume(
        &mut self,
        engine: Arc<dyn ContainerEngine>,
        buildpack: &BuildpackRef,
        image: &str,
        target: &str,
    ) -> Result<String, SetupError> {
        let name = format!(
            "cnbpack-bp-{}-{}-{}",
            self.build_id,
            buildpack.escaped_id(),
            sanitize(&buildpack.version)
        );
        let volume = ScopedVolume::create(engine.clone(), name.clone()).await?;
        self.buildpack_volumes.push(volume);

        let mut spec = ContainerSpec::new(image);
        spec.entrypoint = vec![PROVISION_ENTRYPOINT.to_string()];
        spec.mounts = vec![MountSpec::volume(&name, target, false)];
        spec.network = NetworkMode::Isolated;

        let helper = ScopedContainer::create(engine, &spec).await?;
        if let Err(warning) = helper.release().await {
            warn!("{}", warning);
        }
        debug!(buildpack = %buildpack.display_name(), volume = %name, "Provisioned buildpack");
        Ok(name)
    }

    /// Removes everything; failures become warnings
    pub async fn teardown(mut self) -> Vec<CleanupWarning> {
        let mut warnings = Vec::new();

        for volume in self.buildpack_volumes.drain(..) {
            if let Err(warning) = volume.release().await {
                warnings.push(warning);
            }
        }
        if let Some(layers) = self.layers.take() {
            if let Err(warning) = layers.release().await {
                warnings.push(warning);
            }
        }
        if let Some(dir) = self.platform_dir.take() {
            let path = dir.path().display().to_string();
            if let Err(e) = dir.close() {
                warnings.push(CleanupWarning::new(
                    format!("platform directory {}", path),
                    e.to_string(),
                ));
            }
        }

        debug!(build = %self.build_id, warnings = warnings.len(), "Released build resources");
        warnings
    }
}

fn buildpack_target(buildpack: &BuildpackRef) -> String {
    format!(
        "{}/{}/{}",
        BUILDPACKS_DIR,
        buildpack.escaped_id(),
        buildpack.version
    )
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn write_platform_dir(
    dir: &Path,
    order: &Order,
    env: &[(String, String)],
) -> Result<(), SetupError> {
    let env_dir = dir.join("env");
    std::fs::create_dir_all(&env_dir).map_err(|e| SetupError::Platform(e.to_string()))?;
    for (key, value) in env {
        if key.is_empty() || key.contains('/') || key.contains('=') {
            return Err(SetupError::Platform(format!(
                "invalid environment variable name '{}'",
                key
            )));
        }
        std::fs::write(env_dir.join(key), value)
            .map_err(|e| SetupError::Platform(e.to_string()))?;
    }

    let order_toml = order
        .to_toml()
        .map_err(|e| SetupError::Platform(e.to_string()))?;
    std::fs::write(dir.join("order.toml"), order_toml)
        .map_err(|e| SetupError::Platform(e.to_string()))
}
