//! Turns raw buildpack identifiers into executable [`BuildpackRef`]s
//!
//! Resolution is idempotent per identifier within one resolver: the first call
//! fetches, later calls for the same identifier return the cached result without
//! touching the engine, the registry or the filesystem again.

use super::local::LocalStore;
use super::locator::Locator;
use super::registry::{BuildpackRegistry, RegistryError};
use super::{compare_versions, BuildpackRef, ResolvedLocation, SourceKind};
use crate::compat::ApiVersion;
use crate::engine::{ensure_image, ContainerEngine, EngineError, ImageInfo, PullOptions};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const BUILDPACKAGE_METADATA_LABEL: &str = "io.buildpacks.buildpackage.metadata";
pub const BUILDPACK_LAYERS_LABEL: &str = "io.buildpacks.buildpack.layers";

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("Cannot resolve buildpack '{reference}': {reason}")]
    UnresolvableReference { reference: String, reason: String },

    #[error("Buildpack '{0}' not found")]
    NotFound(String),

    #[error("Buildpack source for '{reference}' unreachable: {message}")]
    SourceUnreachable { reference: String, message: String },
}

impl ResolveError {
    fn unresolvable(reference: &str, reason: impl Into<String>) -> Self {
        ResolveError::UnresolvableReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    fn from_engine(reference: &str, err: EngineError) -> Self {
        match err {
            EngineError::NotFound(_) => ResolveError::NotFound(reference.to_string()),
            other => ResolveError::SourceUnreachable {
                reference: reference.to_string(),
                message: other.to_string(),
            },
        }
    }

    fn from_registry(reference: &str, err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { .. } => ResolveError::NotFound(reference.to_string()),
            RegistryError::InvalidId(_) | RegistryError::Malformed(_) => {
                ResolveError::unresolvable(reference, err.to_string())
            }
            RegistryError::Unreachable(message) => ResolveError::SourceUnreachable {
                reference: reference.to_string(),
                message,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct BuildpackageMetadata {
    id: String,
    #[serde(default)]
    version: String,
}

/// `{id: {version: {api, network}}}` as found on builder and buildpackage images
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct LayerInfo {
    pub api: Option<String>,
    #[serde(default)]
    pub network: bool,
}

pub(crate) type LayersLabel = HashMap<String, HashMap<String, LayerInfo>>;

pub struct BuildpackResolver {
    engine: Arc<dyn ContainerEngine>,
    registry: Option<Arc<dyn BuildpackRegistry>>,
    store: LocalStore,
    bundled: Vec<BuildpackRef>,
    pull: PullOptions,
    base_dir: PathBuf,
    resolved: Mutex<HashMap<String, BuildpackRef>>,
}

impl BuildpackResolver {
    pub fn new(engine: Arc<dyn ContainerEngine>, store: LocalStore, pull: PullOptions) -> Self {
        Self {
            engine,
            registry: None,
            store,
            bundled: Vec::new(),
            pull,
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn BuildpackRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Buildpacks already present in the builder image
    pub fn with_bundled(mut self, bundled: Vec<BuildpackRef>) -> Self {
        self.bundled = bundled;
        self
    }

    /// Directory relative local paths are resolved against
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub async fn resolve(&self, raw: &str) -> Result<BuildpackRef, ResolveError> {
        let mut resolved = self.resolved.lock().await;
        if let Some(hit) = resolved.get(raw) {
            debug!(reference = %raw, "Buildpack already resolved");
            return Ok(hit.clone());
        }

        let buildpack = self.resolve_uncached(raw).await?;
        info!(
            reference = %raw,
            buildpack = %buildpack.display_name(),
            source = %buildpack.source,
            "Resolved buildpack"
        );
        resolved.insert(raw.to_string(), buildpack.clone());
        Ok(buildpack)
    }

    async fn resolve_uncached(&self, raw: &str) -> Result<BuildpackRef, ResolveError> {
        let locator = Locator::parse(raw, &self.base_dir).ok_or_else(|| {
            ResolveError::unresolvable(raw, "not a path, image reference or buildpack id")
        })?;
        debug!(reference = %raw, locator = ?locator, "Classified buildpack reference");

        match locator {
            Locator::LocalPath(path) => self.resolve_local(raw, path).await,
            Locator::Image(reference) => {
                self.resolve_image(raw, &reference.to_string(), SourceKind::PackagedImage)
                    .await
            }
            Locator::Builder { id, version } => self
                .find_bundled(&id, version.as_deref())
                .ok_or_else(|| ResolveError::NotFound(raw.to_string())),
            Locator::Registry { id, version } => {
                self.resolve_registry(raw, &id, version.as_deref()).await
            }
            Locator::Shorthand { id, version } => {
                if let Some(bundled) = self.find_bundled(&id, version.as_deref()) {
                    return Ok(bundled);
                }
                if self.registry.is_some() {
                    return self.resolve_registry(raw, &id, version.as_deref()).await;
                }
                Err(ResolveError::NotFound(raw.to_string()))
            }
        }
    }

    async fn resolve_local(&self, raw: &str, path: PathBuf) -> Result<BuildpackRef, ResolveError> {
        let store = self.store.clone();
        let stored = tokio::task::spawn_blocking(move || store.import(&path))
            .await
            .map_err(|e| ResolveError::unresolvable(raw, e.to_string()))?
            .map_err(|e| ResolveError::unresolvable(raw, format!("{:#}", e)))?;

        let descriptor = stored.descriptor;
        let mut buildpack = BuildpackRef::new(descriptor.id, descriptor.version, SourceKind::Local)
            .with_location(ResolvedLocation::Directory(stored.dir))
            .with_network(descriptor.network)
            .with_digest(stored.digest);
        buildpack.api = descriptor.api;
        Ok(buildpack)
    }

    async fn resolve_image(
        &self,
        raw: &str,
        image: &str,
        source: SourceKind,
    ) -> Result<BuildpackRef, ResolveError> {
        let info = ensure_image(self.engine.as_ref(), image, &self.pull)
            .await
            .map_err(|e| ResolveError::from_engine(raw, e))?;
        buildpack_from_image(raw, image, &info, source)
    }

    async fn resolve_registry(
        &self,
        raw: &str,
        id: &str,
        version: Option<&str>,
    ) -> Result<BuildpackRef, ResolveError> {
        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| ResolveError::unresolvable(raw, "no buildpack registry configured"))?;

        let entry = registry
            .locate(id, version)
            .await
            .map_err(|e| ResolveError::from_registry(raw, e))?;
        debug!(
            registry = %registry.name(),
            id = %id,
            version = %entry.version,
            addr = %entry.addr,
            "Registry entry located"
        );

        self.resolve_image(raw, &entry.addr, SourceKind::Registry)
            .await
    }

    fn find_bundled(&self, id: &str, version: Option<&str>) -> Option<BuildpackRef> {
        let candidates = self.bundled.iter().filter(|bp| bp.id == id);
        match version {
            Some(wanted) => candidates.into_iter().find(|bp| bp.version == wanted).cloned(),
            None => candidates
                .max_by(|a, b| compare_versions(&a.version, &b.version))
                .cloned(),
        }
    }
}

/// Reads identity, API and network opt-in from a packaged buildpack image
fn buildpack_from_image(
    raw: &str,
    image: &str,
    info: &ImageInfo,
    source: SourceKind,
) -> Result<BuildpackRef, ResolveError> {
    let label = info.label(BUILDPACKAGE_METADATA_LABEL).ok_or_else(|| {
        ResolveError::unresolvable(
            raw,
            format!("{} is not a buildpack image: missing {}", image, BUILDPACKAGE_METADATA_LABEL),
        )
    })?;
    let metadata: BuildpackageMetadata = serde_json::from_str(label).map_err(|e| {
        ResolveError::unresolvable(raw, format!("invalid {}: {}", BUILDPACKAGE_METADATA_LABEL, e))
    })?;

    let layer = info
        .label(BUILDPACK_LAYERS_LABEL)
        .and_then(|raw_layers| serde_json::from_str::<LayersLabel>(raw_layers).ok())
        .and_then(|layers| {
            layers
                .get(&metadata.id)
                .and_then(|versions| versions.get(&metadata.version))
                .cloned()
        })
        .unwrap_or_default();

    let api = layer
        .api
        .as_deref()
        .map(str::parse::<ApiVersion>)
        .transpose()
        .map_err(|e| ResolveError::unresolvable(raw, e.to_string()))?;

    let mut buildpack = BuildpackRef::new(metadata.id, metadata.version, source)
        .with_location(ResolvedLocation::Image(image.to_string()))
        .with_network(layer.network)
        .with_digest(info.id.clone());
    buildpack.api = api;
    Ok(buildpack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildpack::registry::RegistryEntry;
    use crate::engine::{MockEngine, PullPolicy};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    fn buildpack_image(id: &str, version: &str, network: bool) -> ImageInfo {
        ImageInfo::new(format!("sha256:{}", id.len()))
            .with_label(
                BUILDPACKAGE_METADATA_LABEL,
                format!(r#"{{"id":"{}","version":"{}"}}"#, id, version),
            )
            .with_label(
                BUILDPACK_LAYERS_LABEL,
                format!(
                    r#"{{"{}":{{"{}":{{"api":"0.8","network":{}}}}}}}"#,
                    id, version, network
                ),
            )
    }

    fn options(policy: PullPolicy) -> PullOptions {
        PullOptions {
            policy,
            retries: 2,
            backoff: Duration::from_millis(1),
        }
    }

    struct StaticRegistry(Vec<RegistryEntry>);

    #[async_trait]
    impl BuildpackRegistry for StaticRegistry {
        async fn locate(
            &self,
            id: &str,
            version: Option<&str>,
        ) -> Result<RegistryEntry, RegistryError> {
            self.0
                .iter()
                .find(|e| e.id() == id && version.map_or(true, |v| v == e.version))
                .cloned()
                .ok_or_else(|| RegistryError::NotFound {
                    id: id.to_string(),
                    version: version.map(str::to_string),
                })
        }

        fn name(&self) -> &str {
            "static"
        }
    }

    fn resolver(engine: Arc<MockEngine>, store: &TempDir) -> BuildpackResolver {
        BuildpackResolver::new(
            engine,
            LocalStore::new(store.path()),
            options(PullPolicy::Always),
        )
    }

    #[tokio::test]
    async fn test_image_resolution_is_idempotent() {
        let engine = Arc::new(MockEngine::new());
        engine.add_remote_image("example/go:1.0", buildpack_image("example/go", "1.0.0", false));
        let store = TempDir::new().unwrap();
        let resolver = resolver(engine.clone(), &store);

        let first = resolver.resolve("example/go:1.0").await.unwrap();
        let second = resolver.resolve("example/go:1.0").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.source, SourceKind::PackagedImage);
        assert_eq!(first.api, Some(ApiVersion::new(0, 8)));
        assert_eq!(engine.pulls_of("example/go:1.0"), 1);
    }

    #[tokio::test]
    async fn test_network_opt_in_read_from_layers_label() {
        let engine = Arc::new(MockEngine::new());
        engine.add_remote_image("example/npm:2", buildpack_image("example/npm", "2.0.0", true));
        let store = TempDir::new().unwrap();

        let bp = resolver(engine, &store)
            .resolve("docker://example/npm:2")
            .await
            .unwrap();
        assert!(bp.network);
        assert_eq!(bp.location, ResolvedLocation::Image("example/npm:2".to_string()));
    }

    #[tokio::test]
    async fn test_non_buildpack_image_unresolvable() {
        let engine = Arc::new(MockEngine::new());
        engine.add_remote_image("library/alpine:3", ImageInfo::new("sha256:alpine"));
        let store = TempDir::new().unwrap();

        let err = resolver(engine, &store)
            .resolve("library/alpine:3")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnresolvableReference { .. }));
    }

    #[tokio::test]
    async fn test_missing_image_not_found() {
        let engine = Arc::new(MockEngine::new());
        let store = TempDir::new().unwrap();

        let err = resolver(engine, &store)
            .resolve("example/missing:1")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(ref r) if r == "example/missing:1"));
    }

    #[tokio::test]
    async fn test_transient_failures_surface_as_unreachable() {
        let engine = Arc::new(MockEngine::new());
        engine.add_remote_image("example/flaky:1", buildpack_image("example/flaky", "1", false));
        engine.fail_pulls("example/flaky:1", 10);
        let store = TempDir::new().unwrap();

        let err = resolver(engine.clone(), &store)
            .resolve("example/flaky:1")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::SourceUnreachable { .. }));
        assert_eq!(engine.pulls_of("example/flaky:1"), 3);
    }

    #[tokio::test]
    async fn test_shorthand_prefers_builder() {
        let engine = Arc::new(MockEngine::new());
        let store = TempDir::new().unwrap();
        let bundled = vec![
            BuildpackRef::new("example/java", "1.0.0", SourceKind::Builder),
            BuildpackRef::new("example/java", "1.2.0", SourceKind::Builder),
        ];
        let registry = StaticRegistry(vec![RegistryEntry {
            ns: "example".to_string(),
            name: "java".to_string(),
            version: "9.9.9".to_string(),
            yanked: false,
            addr: "example/java:9.9.9".to_string(),
        }]);

        let resolver = resolver(engine.clone(), &store)
            .with_bundled(bundled)
            .with_registry(Arc::new(registry));

        let newest = resolver.resolve("example/java").await.unwrap();
        assert_eq!(newest.version, "1.2.0");
        assert_eq!(newest.source, SourceKind::Builder);

        let pinned = resolver.resolve("example/java@1.0.0").await.unwrap();
        assert_eq!(pinned.version, "1.0.0");
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_shorthand_falls_back_to_registry() {
        let engine = Arc::new(MockEngine::new());
        engine.add_remote_image("example/ruby:0.5", buildpack_image("example/ruby", "0.5.0", false));
        let store = TempDir::new().unwrap();
        let registry = StaticRegistry(vec![RegistryEntry {
            ns: "example".to_string(),
            name: "ruby".to_string(),
            version: "0.5.0".to_string(),
            yanked: false,
            addr: "example/ruby:0.5".to_string(),
        }]);

        let bp = resolver(engine, &store)
            .with_registry(Arc::new(registry))
            .resolve("example/ruby@0.5.0")
            .await
            .unwrap();
        assert_eq!(bp.source, SourceKind::Registry);
        assert_eq!(bp.version, "0.5.0");
    }

    #[tokio::test]
    async fn test_shorthand_without_registry_not_found() {
        let engine = Arc::new(MockEngine::new());
        let store = TempDir::new().unwrap();

        let err = resolver(engine, &store)
            .resolve("example/unknown")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_local_directory() {
        let engine = Arc::new(MockEngine::new());
        let store = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        std::fs::write(
            src.path().join("buildpack.toml"),
            "api = \"0.7\"\n[buildpack]\nid = \"local/php\"\nversion = \"0.1.0\"\n[metadata]\nnetwork = true\n",
        )
        .unwrap();

        let bp = resolver(engine, &store)
            .resolve(&format!("file://{}", src.path().display()))
            .await
            .unwrap();
        assert_eq!(bp.display_name(), "local/php@0.1.0");
        assert_eq!(bp.source, SourceKind::Local);
        assert!(bp.network);
        match bp.location {
            ResolvedLocation::Directory(dir) => assert!(dir.starts_with(store.path())),
            other => panic!("unexpected location: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_unresolvable() {
        let engine = Arc::new(MockEngine::new());
        let store = TempDir::new().unwrap();

        let err = resolver(engine, &store)
            .resolve("??? nope")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnresolvableReference { .. }));
    }
}
