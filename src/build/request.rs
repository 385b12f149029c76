//! What the caller asks a build to do

use crate::cache::CacheBackend;
use crate::engine::{ImageReference, PullPolicy};
use crate::error::BuildError;
use crate::order::{GroupSpec, OrderOverride, OrderSpec};
use serde::Serialize;
use std::path::PathBuf;

/// How the build uses its persistent caches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CachePreference {
    /// Layer cache storage
    pub backend: CacheBackend,
    /// Drop volume caches before the build
    pub clear: bool,
    /// Acquire a kaniko cache for image extensions
    pub kaniko: bool,
    /// Also mount the layer cache into detect
    pub in_detect: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildRequest {
    /// Application source directory
    pub app_dir: PathBuf,
    /// Builder image reference
    pub builder: String,
    /// Target image reference
    pub image: String,
    /// Changes to the builder's default order, applied in the given sequence
    pub buildpacks: Vec<OrderOverride>,
    /// Registry name used for shorthand buildpack lookups
    pub registry: Option<String>,
    pub cache: CachePreference,
    /// Export to a registry instead of the local daemon
    pub publish: bool,
    /// Build-time environment handed to buildpacks
    pub env: Vec<(String, String)>,
    pub run_image: Option<String>,
    pub lifecycle_image: Option<String>,
    pub network: Option<String>,
    /// Run the fused `create` phase inside the builder
    pub trust_builder: bool,
    /// Overrides the configured pull policy for this build
    pub pull_policy: Option<PullPolicy>,
}

impl BuildRequest {
    pub fn new(
        app_dir: impl Into<PathBuf>,
        builder: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            app_dir: app_dir.into(),
            builder: builder.into(),
            image: image.into(),
            buildpacks: Vec::new(),
            registry: None,
            cache: CachePreference::default(),
            publish: false,
            env: Vec::new(),
            run_image: None,
            lifecycle_image: None,
            network: None,
            trust_builder: false,
            pull_policy: None,
        }
    }

    /// Tries `group` before the builder's groups
    pub fn with_group(mut self, group: GroupSpec) -> Self {
        self.buildpacks.push(OrderOverride::Prepend(group));
        self
    }

    /// Uses `order` instead of the builder's default order
    pub fn with_order(mut self, order: OrderSpec) -> Self {
        self.buildpacks.push(OrderOverride::Replace(order));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_cache(mut self, cache: CachePreference) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_publish(mut self, publish: bool) -> Self {
        self.publish = publish;
        self
    }

    pub fn with_trust_builder(mut self, trust_builder: bool) -> Self {
        self.trust_builder = trust_builder;
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_lifecycle_image(mut self, image: impl Into<String>) -> Self {
        self.lifecycle_image = Some(image.into());
        self
    }

    pub fn with_run_image(mut self, image: impl Into<String>) -> Self {
        self.run_image = Some(image.into());
        self
    }

    /// Checks everything that can be checked without the engine
    pub fn validate(&self) -> Result<(), BuildError> {
        if !self.app_dir.exists() {
            return Err(BuildError::InvalidRequest(format!(
                "application path {} does not exist",
                self.app_dir.display()
            )));
        }
        if !self.app_dir.is_dir() {
            return Err(BuildError::InvalidRequest(format!(
                "application path {} is not a directory",
                self.app_dir.display()
            )));
        }

        check_reference("builder", &self.builder)?;
        check_reference("image", &self.image)?;
        for (what, reference) in [
            ("run image", &self.run_image),
            ("lifecycle image", &self.lifecycle_image),
        ] {
            if let Some(reference) = reference {
                check_reference(what, reference)?;
            }
        }

        if let CacheBackend::Image(reference) = &self.cache.backend {
            check_reference("cache image", reference)?;
            if !self.publish {
                return Err(BuildError::InvalidRequest(
                    "a cache image requires publishing the image".to_string(),
                ));
            }
            if reference == &self.image {
                return Err(BuildError::InvalidRequest(
                    "the cache image must differ from the target image".to_string(),
                ));
            }
        }

        for (key, _) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('/') {
                return Err(BuildError::InvalidRequest(format!(
                    "invalid environment variable name '{}'",
                    key
                )));
            }
        }

        if matches!(&self.network, Some(name) if name.trim().is_empty()) {
            return Err(BuildError::InvalidRequest(
                "network name cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Absolute, symlink-free form of `app_dir`, as bind-mounted into phase containers
    pub fn app_source(&self) -> Result<PathBuf, BuildError> {
        std::fs::canonicalize(&self.app_dir).map_err(|e| {
            BuildError::InvalidRequest(format!(
                "cannot resolve application path {}: {}",
                self.app_dir.display(),
                e
            ))
        })
    }
}

fn check_reference(what: &str, reference: &str) -> Result<(), BuildError> {
    if reference.trim().is_empty() {
        return Err(BuildError::InvalidRequest(format!("{} is required", what)));
    }
    ImageReference::parse(reference)
        .map(|_| ())
        .map_err(|e| BuildError::InvalidRequest(format!("invalid {} '{}': {}", what, reference, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(dir: &TempDir) -> BuildRequest {
        BuildRequest::new(dir.path(), "example/builder:base", "myimage:latest")
    }

    #[test]
    fn test_valid_request() {
        let dir = TempDir::new().unwrap();
        assert!(request(&dir).with_env("BP_X", "1").validate().is_ok());
    }

    #[test]
    fn test_missing_app_dir() {
        let result = BuildRequest::new("/nonexistent/app", "builder", "image").validate();
        assert!(matches!(result, Err(BuildError::InvalidRequest(m)) if m.contains("does not exist")));
    }

    #[test]
    fn test_app_path_is_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("app.txt");
        std::fs::write(&file, "x").unwrap();
        let result = BuildRequest::new(&file, "builder", "image").validate();
        assert!(matches!(result, Err(BuildError::InvalidRequest(m)) if m.contains("not a directory")));
    }

    #[test]
    fn test_app_source_is_absolute() {
        let source = BuildRequest::new(".", "builder", "image").app_source().unwrap();
        assert!(source.is_absolute());
        assert_eq!(source, std::env::current_dir().unwrap().canonicalize().unwrap());
    }

    #[test]
    fn test_empty_builder() {
        let dir = TempDir::new().unwrap();
        let result = BuildRequest::new(dir.path(), "", "image").validate();
        assert!(matches!(result, Err(BuildError::InvalidRequest(m)) if m.contains("builder")));
    }

    #[test]
    fn test_cache_image_requires_publish() {
        let dir = TempDir::new().unwrap();
        let cache = CachePreference {
            backend: CacheBackend::Image("registry.example.com/app-cache".to_string()),
            ..Default::default()
        };

        let daemon = request(&dir).with_cache(cache.clone());
        assert!(daemon.validate().is_err());

        let published = request(&dir).with_cache(cache).with_publish(true);
        assert!(published.validate().is_ok());
    }

    #[test]
    fn test_invalid_env_name() {
        let dir = TempDir::new().unwrap();
        assert!(request(&dir).with_env("A=B", "1").validate().is_err());
        assert!(request(&dir).with_env("", "1").validate().is_err());
    }

    #[test]
    fn test_overrides_keep_sequence() {
        let dir = TempDir::new().unwrap();
        let request = request(&dir)
            .with_group(GroupSpec::parse("a").unwrap())
            .with_order(OrderSpec::default());
        assert!(matches!(request.buildpacks[0], OrderOverride::Prepend(_)));
        assert!(matches!(request.buildpacks[1], OrderOverride::Replace(_)));
    }
}
