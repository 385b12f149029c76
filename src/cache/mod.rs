//! Persistent build caches
//!
//! Caches outlive individual builds. Each is keyed by the target image and the
//! builder digest so two different builds never share one, while rebuilding the
//! same image with the same builder finds the previous cache again. A layer cache
//! is either an engine volume or a registry image; image caches are only pushed
//! back when the build exported successfully.

use crate::engine::{ContainerEngine, EngineError, ImageReference};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

const VOLUME_PREFIX: &str = "cnbpack-cache";
const KEY_HASH_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheKind {
    /// Buildpack layers cached between builds
    LayerCache,
    /// Image-extension (Dockerfile) build cache
    Kaniko,
    /// Launch layers reused when exporting to the daemon
    Launch,
}

impl CacheKind {
    fn suffix(&self) -> &'static str {
        match self {
            CacheKind::LayerCache => "build",
            CacheKind::Kaniko => "kaniko",
            CacheKind::Launch => "launch",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// Where a layer cache is stored
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "type", content = "image", rename_all = "kebab-case")]
pub enum CacheBackend {
    #[default]
    Volume,
    Image(String),
}

/// Stable identity of a cache: sanitized target name plus a hash of target and builder
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(target: &str, builder_digest: &str) -> Self {
        let normalized = ImageReference::parse(target)
            .map(|r| {
                let mut r = r;
                if r.tag.is_none() && r.digest.is_none() {
                    r.tag = Some("latest".to_string());
                }
                r.to_string()
            })
            .unwrap_or_else(|_| target.to_string());

        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update([0]);
        hasher.update(builder_digest.as_bytes());
        let hash = hex::encode(hasher.finalize());

        let name: String = normalized
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();

        Self(format!("{}-{}", name, &hash[..KEY_HASH_LEN]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn volume_name(&self, kind: CacheKind) -> String {
        format!("{}-{}.{}", VOLUME_PREFIX, self.0, kind.suffix())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An acquired cache, ready to be mounted or referenced by the lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CacheHandle {
    Volume { kind: CacheKind, name: String },
    Image { kind: CacheKind, reference: String },
}

impl CacheHandle {
    pub fn kind(&self) -> CacheKind {
        match self {
            CacheHandle::Volume { kind, .. } | CacheHandle::Image { kind, .. } => *kind,
        }
    }

    pub fn volume(&self) -> Option<&str> {
        match self {
            CacheHandle::Volume { name, .. } => Some(name),
            CacheHandle::Image { .. } => None,
        }
    }

    pub fn image(&self) -> Option<&str> {
        match self {
            CacheHandle::Image { reference, .. } => Some(reference),
            CacheHandle::Volume { .. } => None,
        }
    }
}

pub struct CacheManager {
    engine: Arc<dyn ContainerEngine>,
}

impl CacheManager {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Makes the cache available, creating its volume if missing
    pub async fn acquire(
        &self,
        key: &CacheKey,
        kind: CacheKind,
        backend: &CacheBackend,
    ) -> Result<CacheHandle, EngineError> {
        match backend {
            CacheBackend::Image(reference) if kind == CacheKind::LayerCache => {
                debug!(cache = %reference, "Using image-backed layer cache");
                Ok(CacheHandle::Image {
                    kind,
                    reference: reference.clone(),
                })
            }
            _ => {
                let name = key.volume_name(kind);
                self.engine.create_volume(&name).await?;
                debug!(cache = %name, "Acquired cache volume");
                Ok(CacheHandle::Volume { kind, name })
            }
        }
    }

    /// Finishes with a cache: image caches are pushed only after a successful export
    pub async fn release(
        &self,
        handle: &CacheHandle,
        export_succeeded: bool,
    ) -> Result<(), EngineError> {
        match handle {
            CacheHandle::Volume { .. } => Ok(()),
            CacheHandle::Image { reference, .. } if export_succeeded => {
                info!(cache = %reference, "Pushing cache image");
                self.engine.push_image(reference).await
            }
            CacheHandle::Image { reference, .. } => {
                debug!(cache = %reference, "Build did not export; cache image left untouched");
                Ok(())
            }
        }
    }

    /// Deletes a cache volume so the next build starts cold
    pub async fn clear(&self, key: &CacheKey, kind: CacheKind) -> Result<(), EngineError> {
        let name = key.volume_name(kind);
        info!(cache = %name, "Clearing cache");
        self.engine.remove_volume(&name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineCall, ImageInfo, MockEngine};

    #[test]
    fn test_key_is_deterministic() {
        let a = CacheKey::derive("example/app", "sha256:builder");
        let b = CacheKey::derive("example/app:latest", "sha256:builder");
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("example_app_latest-"));
    }

    #[test]
    fn test_key_varies_with_target_and_builder() {
        let base = CacheKey::derive("example/app", "sha256:one");
        assert_ne!(base, CacheKey::derive("example/other", "sha256:one"));
        assert_ne!(base, CacheKey::derive("example/app", "sha256:two"));
    }

    #[test]
    fn test_volume_names_by_kind() {
        let key = CacheKey::derive("app", "sha256:b");
        assert!(key.volume_name(CacheKind::LayerCache).ends_with(".build"));
        assert!(key.volume_name(CacheKind::Kaniko).ends_with(".kaniko"));
        assert!(key
            .volume_name(CacheKind::Launch)
            .starts_with("cnbpack-cache-app_latest-"));
    }

    #[tokio::test]
    async fn test_volume_cache_lifecycle() {
        let engine = Arc::new(MockEngine::new());
        let manager = CacheManager::new(engine.clone());
        let key = CacheKey::derive("app", "sha256:b");

        let handle = manager
            .acquire(&key, CacheKind::LayerCache, &CacheBackend::Volume)
            .await
            .unwrap();
        assert_eq!(handle.volume(), Some(key.volume_name(CacheKind::LayerCache).as_str()));

        manager.release(&handle, true).await.unwrap();
        assert_eq!(engine.volumes_removed(), 0);

        manager.clear(&key, CacheKind::LayerCache).await.unwrap();
        assert_eq!(engine.live_volumes(), 0);
    }

    #[tokio::test]
    async fn test_image_cache_pushed_only_on_success() {
        let engine = Arc::new(MockEngine::new());
        engine.add_local_image("registry.io/app-cache", ImageInfo::new("sha256:c"));
        let manager = CacheManager::new(engine.clone());
        let key = CacheKey::derive("app", "sha256:b");
        let backend = CacheBackend::Image("registry.io/app-cache".to_string());

        let handle = manager
            .acquire(&key, CacheKind::LayerCache, &backend)
            .await
            .unwrap();
        assert_eq!(handle.image(), Some("registry.io/app-cache"));
        assert!(!engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::CreateVolume(_))));

        manager.release(&handle, false).await.unwrap();
        assert_eq!(engine.pushes_of("registry.io/app-cache"), 0);

        manager.release(&handle, true).await.unwrap();
        assert_eq!(engine.pushes_of("registry.io/app-cache"), 1);
    }

    #[tokio::test]
    async fn test_kaniko_cache_always_a_volume() {
        let engine = Arc::new(MockEngine::new());
        let manager = CacheManager::new(engine);
        let key = CacheKey::derive("app", "sha256:b");

        let handle = manager
            .acquire(&key, CacheKind::Kaniko, &CacheBackend::Image("x/cache".to_string()))
            .await
            .unwrap();
        assert_eq!(handle.kind(), CacheKind::Kaniko);
        assert!(handle.volume().is_some());
    }
}
