//! Per-phase container specifications
//!
//! Every phase container gets the per-build layers volume read-write and the
//! platform directory read-only. What else a phase sees (the application, the
//! caches, buildpack content, the engine socket and the network) is decided here
//! from the phase and the build's settings.

use super::phase::PhaseName;
use super::resources::BuildResources;
use crate::cache::CacheHandle;
use crate::compat::ApiVersion;
use crate::engine::{ContainerSpec, MountSpec, NetworkMode};
use crate::order::{Group, Order};
use std::path::PathBuf;

pub const APP_DIR: &str = "/workspace";
pub const LAYERS_DIR: &str = "/layers";
pub const PLATFORM_DIR: &str = "/platform";
pub const CACHE_DIR: &str = "/cache";
pub const KANIKO_DIR: &str = "/kaniko";
pub const LAUNCH_CACHE_DIR: &str = "/launch-cache";
pub const BUILDPACKS_DIR: &str = "/cnb/buildpacks";
pub const ORDER_PATH: &str = "/platform/order.toml";
pub const GROUP_PATH: &str = "/layers/group.toml";
pub const PLAN_PATH: &str = "/layers/plan.toml";
pub const DOCKER_SOCKET_TARGET: &str = "/var/run/docker.sock";

pub const PLATFORM_API_ENV: &str = "CNB_PLATFORM_API";
pub const BUILD_LABEL: &str = "io.cnbpack.build";
pub const PHASE_LABEL: &str = "io.cnbpack.phase";

const ROOT_USER: &str = "root";
const DETECT_LOG_LEVEL: &str = "debug";

/// Caches acquired for one build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseCaches {
    pub layer: Option<CacheHandle>,
    pub kaniko: Option<CacheHandle>,
    pub launch: Option<CacheHandle>,
}

/// Build-wide settings every phase container is derived from
#[derive(Debug, Clone)]
pub struct PhasePlan {
    pub builder_image: String,
    /// Separate lifecycle image for analyze/restore/export, if any
    pub lifecycle_image: Option<String>,
    pub app_dir: PathBuf,
    pub target_image: String,
    pub run_image: Option<String>,
    pub platform_api: ApiVersion,
    /// Export to a registry instead of the local daemon
    pub publish: bool,
    /// Run the single fused `create` phase
    pub fused: bool,
    pub log_level: String,
    /// Network used by phases that have network access
    pub network: Option<String>,
    pub docker_socket: PathBuf,
    pub detect_uses_cache: bool,
    pub caches: PhaseCaches,
    pub order: Order,
}

impl PhasePlan {
    pub fn container_spec(
        &self,
        phase: PhaseName,
        resources: &BuildResources,
        group: Option<&Group>,
    ) -> ContainerSpec {
        let mut spec = ContainerSpec::new(self.image_for(phase));
        spec.name = Some(format!("cnbpack-{}-{}", resources.build_id(), phase));
        spec.entrypoint = vec![phase.binary_path()];
        spec.args = self.args_for(phase);
        spec.env = vec![(PLATFORM_API_ENV.to_string(), self.platform_api.to_string())];
        spec.mounts = self.mounts_for(phase, resources);
        spec.network = self.network_for(phase, group);
        if self.uses_daemon(phase) {
            spec.user = Some(ROOT_USER.to_string());
        }
        spec.labels
            .insert(BUILD_LABEL.to_string(), resources.build_id().to_string());
        spec.labels
            .insert(PHASE_LABEL.to_string(), phase.to_string());
        spec
    }

    fn image_for(&self, phase: PhaseName) -> &str {
        match (phase, &self.lifecycle_image) {
            (PhaseName::Analyze | PhaseName::Restore | PhaseName::Export, Some(lifecycle)) => {
                lifecycle
            }
            _ => &self.builder_image,
        }
    }

    /// Phases that talk to the local daemon instead of a registry
    fn uses_daemon(&self, phase: PhaseName) -> bool {
        !self.publish
            && matches!(
                phase,
                PhaseName::Analyze | PhaseName::Export | PhaseName::Create
            )
    }

    fn connected(&self) -> NetworkMode {
        match &self.network {
            Some(name) => NetworkMode::Named(name.clone()),
            None => NetworkMode::Default,
        }
    }

    fn network_for(&self, phase: PhaseName, group: Option<&Group>) -> NetworkMode {
        // Unknown group: nothing is known to participate, so nothing opts in
        let group_wants = || group.is_some_and(Group::wants_network);
        let image_cache = self
            .caches
            .layer
            .as_ref()
            .is_some_and(|c| c.image().is_some());

        let allowed = match phase {
            PhaseName::Detect => self.order.wants_network(),
            PhaseName::Analyze | PhaseName::Restore => true,
            PhaseName::Build => group_wants(),
            PhaseName::Export => self.publish || image_cache || group_wants(),
            PhaseName::Create => self.publish || image_cache || self.order.wants_network(),
        };

        if allowed {
            self.connected()
        } else {
            NetworkMode::Isolated
        }
    }

    fn args_for(&self, phase: PhaseName) -> Vec<String> {
        let mut args = vec![
            "-log-level".to_string(),
            self.log_level_for(phase).to_string(),
            "-layers".to_string(),
            LAYERS_DIR.to_string(),
        ];
        let mut push = |flag: &str, value: &str| {
            args.push(flag.to_string());
            args.push(value.to_string());
        };

        match phase {
            PhaseName::Detect => {
                push("-app", APP_DIR);
                push("-platform", PLATFORM_DIR);
                push("-order", ORDER_PATH);
                push("-group", GROUP_PATH);
                push("-plan", PLAN_PATH);
            }
            PhaseName::Analyze => {}
            PhaseName::Restore => {
                push("-group", GROUP_PATH);
            }
            PhaseName::Build => {
                push("-app", APP_DIR);
                push("-platform", PLATFORM_DIR);
                push("-group", GROUP_PATH);
                push("-plan", PLAN_PATH);
            }
            PhaseName::Export => {
                push("-app", APP_DIR);
                push("-group", GROUP_PATH);
            }
            PhaseName::Create => {
                push("-app", APP_DIR);
                push("-platform", PLATFORM_DIR);
                push("-order", ORDER_PATH);
            }
        }

        if matches!(
            phase,
            PhaseName::Restore | PhaseName::Export | PhaseName::Create
        ) {
            match &self.caches.layer {
                Some(CacheHandle::Image { reference, .. }) => push("-cache-image", reference),
                Some(CacheHandle::Volume { .. }) => push("-cache-dir", CACHE_DIR),
                None => {}
            }
        }

        if matches!(phase, PhaseName::Export | PhaseName::Create)
            && !self.publish
            && self.caches.launch.is_some()
        {
            push("-launch-cache", LAUNCH_CACHE_DIR);
        }

        if matches!(
            phase,
            PhaseName::Analyze | PhaseName::Export | PhaseName::Create
        ) {
            if let Some(run_image) = &self.run_image {
                push("-run-image", run_image);
            }
            if self.uses_daemon(phase) {
                args.push("-daemon".to_string());
            }
            args.push(self.target_image.clone());
        }

        args
    }

    /// The detector reports per-buildpack verdicts only at debug level or finer
    fn log_level_for(&self, phase: PhaseName) -> &str {
        match (phase, self.log_level.as_str()) {
            (PhaseName::Detect, "trace") => "trace",
            (PhaseName::Detect, _) => DETECT_LOG_LEVEL,
            (_, level) => level,
        }
    }

    fn mounts_for(&self, phase: PhaseName, resources: &BuildResources) -> Vec<MountSpec> {
        let mut mounts = vec![
            MountSpec::volume(resources.layers_volume(), LAYERS_DIR, false),
            MountSpec::bind(resources.platform_dir(), PLATFORM_DIR, true),
        ];

        match phase {
            PhaseName::Detect | PhaseName::Analyze => {
                mounts.push(MountSpec::bind(&self.app_dir, APP_DIR, true));
            }
            PhaseName::Build | PhaseName::Export | PhaseName::Create => {
                mounts.push(MountSpec::bind(&self.app_dir, APP_DIR, false));
            }
            PhaseName::Restore => {}
        }

        let layer_cache = match phase {
            PhaseName::Detect => self.detect_uses_cache,
            _ => true,
        };
        if layer_cache {
            if let Some(volume) = self.caches.layer.as_ref().and_then(CacheHandle::volume) {
                mounts.push(MountSpec::volume(volume, CACHE_DIR, false));
            }
        }

        if matches!(
            phase,
            PhaseName::Restore | PhaseName::Build | PhaseName::Create
        ) {
            if let Some(volume) = self.caches.kaniko.as_ref().and_then(CacheHandle::volume) {
                mounts.push(MountSpec::volume(volume, KANIKO_DIR, false));
            }
        }

        if matches!(phase, PhaseName::Export | PhaseName::Create) && !self.publish {
            if let Some(volume) = self.caches.launch.as_ref().and_then(CacheHandle::volume) {
                mounts.push(MountSpec::volume(volume, LAUNCH_CACHE_DIR, false));
            }
        }

        if matches!(
            phase,
            PhaseName::Detect | PhaseName::Build | PhaseName::Create
        ) {
            mounts.extend(resources.buildpack_mounts().iter().cloned());
        }

        if self.uses_daemon(phase) {
            mounts.push(MountSpec::bind(
                &self.docker_socket,
                DOCKER_SOCKET_TARGET,
                false,
            ));
        }

        mounts
    }
}
