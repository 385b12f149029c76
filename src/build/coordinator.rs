//! Build coordination
//!
//! The coordinator turns one [`BuildRequest`] into one [`BuildResult`]:
//! 1. Validates the request and configuration
//! 2. Reads the builder (and lifecycle) image metadata
//! 3. Negotiates the Platform API
//! 4. Merges and resolves the buildpack order, then checks Buildpack APIs
//! 5. Acquires caches and per-build resources
//! 6. Drives the phase orchestrator
//! 7. Tears everything down and reports
//!
//! Steps 1-5 fail fast with a [`BuildError`] before any phase container exists.
//! Failures of step 6 are reported through a `BuildResult` with `success: false`;
//! [`BuildResult::into_result`] converts them into errors.
//!
//! # Example
//!
//! ```no_run
//! use cnbpack::{BuildCoordinator, BuildRequest, CnbpackConfig, DockerEngine};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Arc::new(DockerEngine::connect()?);
//! let coordinator = BuildCoordinator::new(engine, CnbpackConfig::default());
//!
//! let request = BuildRequest::new(".", "paketobuildpacks/builder-jammy-base", "myapp:latest");
//! let result = coordinator.build(&request, CancellationToken::new()).await?;
//! println!("built {:?}", result.image);
//! # Ok(())
//! # }
//! ```

use super::request::BuildRequest;
use super::result::BuildResult;
use crate::buildpack::{BuildpackRef, BuildpackRegistry, BuildpackResolver, IndexRegistry};
use crate::builder::{Builder, LifecycleDescriptor};
use crate::cache::{CacheHandle, CacheKey, CacheKind, CacheManager};
use crate::compat::{check_buildpack_apis, negotiate_platform_api, CLIENT_PLATFORM_API};
use crate::config::CnbpackConfig;
use crate::engine::{ContainerEngine, EngineError, PullOptions};
use crate::error::BuildError;
use crate::lifecycle::{BuildResources, PhaseCaches, PhaseOrchestrator, PhasePlan};
use crate::order::{merge_order, resolve_order};
use crate::progress::{NoOpHandler, ProgressEvent, ProgressHandler};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BUILD_ID_LEN: usize = 12;

pub struct BuildCoordinator {
    engine: Arc<dyn ContainerEngine>,
    config: CnbpackConfig,
    /// Replaces the configured registry lookup
    registry: Option<Arc<dyn BuildpackRegistry>>,
    progress: Arc<dyn ProgressHandler>,
}

impl std::fmt::Debug for BuildCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildCoordinator")
            .field("config", &self.config)
            .field("registry", &self.registry.as_ref().map(|r| r.name().to_string()))
            .finish()
    }
}

impl BuildCoordinator {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: CnbpackConfig) -> Self {
        Self {
            engine,
            config,
            registry: None,
            progress: Arc::new(NoOpHandler),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn BuildpackRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressHandler>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &CnbpackConfig {
        &self.config
    }

    /// Runs one build; `cancel` aborts it at any point
    pub async fn build(
        &self,
        request: &BuildRequest,
        cancel: CancellationToken,
    ) -> Result<BuildResult, BuildError> {
        let started = Instant::now();
        let result = self.run(request, cancel, started).await;
        if let Err(e) = &result {
            self.emit(ProgressEvent::Failed {
                phase: None,
                error: e.to_string(),
            });
        }
        result
    }

    /// Resolves one buildpack and stores it locally, without a builder
    pub async fn pull_buildpack(
        &self,
        reference: &str,
        registry: Option<&str>,
    ) -> Result<BuildpackRef, BuildError> {
        self.config.validate()?;
        let resolver = self.resolver(registry, self.config.pull_options(), Vec::new())?;
        Ok(resolver.resolve(reference).await?)
    }

    async fn run(
        &self,
        request: &BuildRequest,
        cancel: CancellationToken,
        started: Instant,
    ) -> Result<BuildResult, BuildError> {
        self.config.validate()?;
        request.validate()?;
        let app_dir = request.app_source()?;
        self.emit(ProgressEvent::Started {
            image: request.image.clone(),
            builder: request.builder.clone(),
        });

        let pull = match request.pull_policy {
            Some(policy) => self.config.pull_options_with(policy),
            None => self.config.pull_options(),
        };

        let builder = unless_cancelled(
            &cancel,
            Builder::fetch(self.engine.as_ref(), &request.builder, &pull),
        )
        .await?;
        self.emit(ProgressEvent::BuilderResolved {
            builder: builder.reference.clone(),
            lifecycle_version: builder.lifecycle.version.clone(),
            buildpacks: builder.buildpacks.len(),
        });

        let lifecycle = match &request.lifecycle_image {
            Some(image) => {
                unless_cancelled(
                    &cancel,
                    LifecycleDescriptor::fetch(self.engine.as_ref(), image, &pull),
                )
                .await?
            }
            None => builder.lifecycle.clone(),
        };

        let platform_api =
            negotiate_platform_api(CLIENT_PLATFORM_API, builder.platform_api, lifecycle.platform_api)?;
        self.emit(ProgressEvent::PlatformApiNegotiated {
            version: platform_api,
        });

        let resolver = self.resolver(
            request.registry.as_deref(),
            pull,
            builder.buildpacks.clone(),
        )?;
        let spec = merge_order(&builder.default_order, &request.buildpacks)?;
        let order = unless_cancelled(&cancel, resolve_order(&spec, &resolver)).await?;
        self.emit(ProgressEvent::OrderResolved {
            groups: order.groups().len(),
            buildpacks: order.buildpacks().count(),
        });
        check_buildpack_apis(order.buildpacks(), lifecycle.buildpack_api)?;

        let key = CacheKey::derive(&request.image, &builder.digest);
        let caches = unless_cancelled(&cancel, async {
            self.acquire_caches(&key, request)
                .await
                .map_err(BuildError::Cache)
        })
        .await?;

        // Allocation runs to completion so that everything it created is torn down
        let build_id = new_build_id();
        let resources =
            BuildResources::allocate(self.engine.clone(), &build_id, &order, &request.env).await?;
        if cancel.is_cancelled() {
            info!(build = %build_id, "Build cancelled while provisioning buildpacks");
            for warning in resources.teardown().await {
                warn!("{}", warning);
            }
            return Err(BuildError::Cancelled { phase: None });
        }

        let plan = PhasePlan {
            builder_image: request.builder.clone(),
            lifecycle_image: request.lifecycle_image.clone(),
            app_dir,
            target_image: request.image.clone(),
            run_image: request.run_image.clone().or_else(|| builder.run_image.clone()),
            platform_api,
            publish: request.publish,
            fused: request.trust_builder,
            log_level: self.config.log_level.clone(),
            network: request.network.clone(),
            docker_socket: self.config.docker_socket.clone(),
            detect_uses_cache: request.cache.in_detect,
            caches: caches.clone(),
            order,
        };

        info!(build = %build_id, image = %request.image, platform_api = %platform_api, "Starting build");
        let outcome = self.orchestrate(&plan, &resources, &cancel).await;

        let mut warnings: Vec<String> = outcome.warnings.iter().map(|w| w.to_string()).collect();
        for warning in resources.teardown().await {
            self.record_warning(&mut warnings, warning.to_string());
        }

        let exported = outcome.exported();
        for handle in [&caches.layer, &caches.kaniko, &caches.launch]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.release_cache(handle, exported).await {
                self.record_warning(&mut warnings, format!("cache {}: {}", handle.kind(), e));
            }
        }

        let failure = outcome.failure.clone();
        let result = BuildResult {
            success: outcome.succeeded(),
            build_id,
            image: outcome.succeeded().then(|| request.image.clone()),
            failed_phase: failure.as_ref().map(|f| f.phase),
            reason: failure.as_ref().map(|f| f.reason.clone()),
            diagnostics: failure.map(|f| f.diagnostics).unwrap_or_default(),
            warnings,
            platform_api,
            completed_phases: outcome.completed.clone(),
            group: outcome
                .group
                .as_ref()
                .map(|g| g.display_names())
                .unwrap_or_default(),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if result.success {
            info!(image = %request.image, "Build succeeded");
            self.emit(ProgressEvent::Completed {
                image: request.image.clone(),
                total_time: started.elapsed(),
            });
        } else {
            let error = match (&result.failed_phase, &result.reason) {
                (Some(phase), Some(reason)) => format!("{} {}", phase, reason),
                _ => "build failed".to_string(),
            };
            warn!(build = %result.build_id, "{}", error);
            self.emit(ProgressEvent::Failed {
                phase: result.failed_phase,
                error,
            });
        }
        Ok(result)
    }

    /// Runs the phases; a configured timeout cancels a child of `cancel`
    async fn orchestrate(
        &self,
        plan: &PhasePlan,
        resources: &BuildResources,
        cancel: &CancellationToken,
    ) -> crate::lifecycle::OrchestrationOutcome {
        let token = cancel.child_token();
        let timer = self.config.build_timeout().map(|timeout| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(timeout_secs = timeout.as_secs(), "Build timed out");
                token.cancel();
            })
        });

        let orchestrator = PhaseOrchestrator::new(
            self.engine.clone(),
            self.progress.clone(),
            self.config.diagnostic_lines,
        );
        let outcome = orchestrator.run(plan, resources, &token).await;

        if let Some(timer) = timer {
            timer.abort();
        }
        outcome
    }

    fn resolver(
        &self,
        registry: Option<&str>,
        pull: PullOptions,
        bundled: Vec<BuildpackRef>,
    ) -> Result<BuildpackResolver, BuildError> {
        let registry: Arc<dyn BuildpackRegistry> = match &self.registry {
            Some(registry) => registry.clone(),
            None => Arc::new(IndexRegistry::new(self.config.registry(registry)?)),
        };
        Ok(
            BuildpackResolver::new(self.engine.clone(), self.config.local_store(), pull)
                .with_registry(registry)
                .with_bundled(bundled),
        )
    }

    async fn acquire_caches(
        &self,
        key: &CacheKey,
        request: &BuildRequest,
    ) -> Result<PhaseCaches, EngineError> {
        let manager = CacheManager::new(self.engine.clone());
        let mut kinds = vec![CacheKind::LayerCache];
        if request.cache.kaniko {
            kinds.push(CacheKind::Kaniko);
        }
        if !request.publish {
            kinds.push(CacheKind::Launch);
        }

        if request.cache.clear {
            for kind in &kinds {
                match manager.clear(key, *kind).await {
                    Ok(()) | Err(EngineError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let mut caches = PhaseCaches::default();
        for kind in kinds {
            let handle = manager.acquire(key, kind, &request.cache.backend).await?;
            match kind {
                CacheKind::LayerCache => caches.layer = Some(handle),
                CacheKind::Kaniko => caches.kaniko = Some(handle),
                CacheKind::Launch => caches.launch = Some(handle),
            }
        }
        debug!(key = %key.as_str(), "Caches ready");
        Ok(caches)
    }

    async fn release_cache(&self, handle: &CacheHandle, exported: bool) -> Result<(), EngineError> {
        CacheManager::new(self.engine.clone())
            .release(handle, exported)
            .await
    }

    fn record_warning(&self, warnings: &mut Vec<String>, message: String) {
        warn!("{}", message);
        self.emit(ProgressEvent::CleanupWarning {
            message: message.clone(),
        });
        warnings.push(message);
    }

    fn emit(&self, event: ProgressEvent) {
        self.progress.on_progress(&event);
    }
}

/// Runs pre-phase work unless `cancel` fires first
async fn unless_cancelled<T, E>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, E>>,
) -> Result<T, BuildError>
where
    BuildError: From<E>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            info!("Build cancelled before the first phase");
            Err(BuildError::Cancelled { phase: None })
        }
        result = work => Ok(result?),
    }
}

fn new_build_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(BUILD_ID_LEN);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::CachePreference;
    use crate::engine::{EngineCall, MockEngine};
    use tempfile::TempDir;

    fn coordinator(engine: Arc<MockEngine>) -> BuildCoordinator {
        let mut config = CnbpackConfig::default();
        config.log_level = "info".to_string();
        BuildCoordinator::new(engine, config)
    }

    #[test]
    fn test_build_ids_are_short_and_unique() {
        let a = new_build_id();
        let b = new_build_id();
        assert_eq!(a.len(), BUILD_ID_LEN);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_cache_kinds_follow_request() {
        let engine = Arc::new(MockEngine::new());
        let coordinator = coordinator(engine.clone());
        let dir = TempDir::new().unwrap();
        let key = CacheKey::derive("app", "sha256:b");

        let daemon = BuildRequest::new(dir.path(), "builder", "app");
        let caches = coordinator.acquire_caches(&key, &daemon).await.unwrap();
        assert!(caches.layer.is_some());
        assert!(caches.launch.is_some());
        assert!(caches.kaniko.is_none());

        let published = BuildRequest::new(dir.path(), "builder", "app")
            .with_publish(true)
            .with_cache(CachePreference {
                kaniko: true,
                ..Default::default()
            });
        let caches = coordinator.acquire_caches(&key, &published).await.unwrap();
        assert!(caches.launch.is_none());
        assert!(caches.kaniko.is_some());
    }

    #[tokio::test]
    async fn test_clear_cache_removes_before_acquire() {
        let engine = Arc::new(MockEngine::new());
        let coordinator = coordinator(engine.clone());
        let dir = TempDir::new().unwrap();
        let key = CacheKey::derive("app", "sha256:b");

        let request = BuildRequest::new(dir.path(), "builder", "app")
            .with_publish(true)
            .with_cache(CachePreference {
                clear: true,
                ..Default::default()
            });
        coordinator.acquire_caches(&key, &request).await.unwrap();

        let name = key.volume_name(CacheKind::LayerCache);
        assert_eq!(
            engine.calls(),
            vec![
                EngineCall::RemoveVolume(name.clone()),
                EngineCall::CreateVolume(name)
            ]
        );
    }
}
