//! Scoped engine resources with guaranteed release
//!
//! [`ScopedContainer`] and [`ScopedVolume`] own one engine resource each. The normal
//! path releases them explicitly with `release().await`, which reports failures as
//! [`CleanupWarning`]s. If a guard is dropped without being released (the owning
//! future was cancelled or panicked), `Drop` schedules the removal on the current
//! tokio runtime so nothing leaks.

use super::{ContainerEngine, ContainerSpec, EngineError};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// A resource that could not be torn down; never changes the build outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupWarning {
    pub resource: String,
    pub message: String,
}

impl CleanupWarning {
    pub fn new(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to remove {}: {}", self.resource, self.message)
    }
}

pub struct ScopedContainer {
    engine: Arc<dyn ContainerEngine>,
    id: Option<String>,
}

impl ScopedContainer {
    pub async fn create(
        engine: Arc<dyn ContainerEngine>,
        spec: &ContainerSpec,
    ) -> Result<Self, EngineError> {
        let id = engine.create_container(spec).await?;
        debug!(container = %id, image = %spec.image, "Created container");
        Ok(Self {
            engine,
            id: Some(id),
        })
    }

    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    /// Force-removes the container
    pub async fn release(mut self) -> Result<(), CleanupWarning> {
        let Some(id) = self.id.take() else {
            return Ok(());
        };
        match self.engine.remove_container(&id).await {
            Ok(()) => {
                debug!(container = %id, "Removed container");
                Ok(())
            }
            Err(e) => {
                let warning = CleanupWarning::new(format!("container {}", id), e.to_string());
                warn!("{}", warning);
                Err(warning)
            }
        }
    }
}

impl Drop for ScopedContainer {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            spawn_release(self.engine.clone(), Resource::Container(id));
        }
    }
}

pub struct ScopedVolume {
    engine: Arc<dyn ContainerEngine>,
    name: Option<String>,
}

impl ScopedVolume {
    pub async fn create(
        engine: Arc<dyn ContainerEngine>,
        name: impl Into<String>,
    ) -> Result<Self, EngineError> {
        let name = name.into();
        engine.create_volume(&name).await?;
        debug!(volume = %name, "Created volume");
        Ok(Self {
            engine,
            name: Some(name),
        })
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    pub async fn release(mut self) -> Result<(), CleanupWarning> {
        let Some(name) = self.name.take() else {
            return Ok(());
        };
        match self.engine.remove_volume(&name).await {
            Ok(()) => {
                debug!(volume = %name, "Removed volume");
                Ok(())
            }
            Err(e) => {
                let warning = CleanupWarning::new(format!("volume {}", name), e.to_string());
                warn!("{}", warning);
                Err(warning)
            }
        }
    }
}

impl Drop for ScopedVolume {
    fn drop(&mut self) {
        if let Some(name) = self.name.take() {
            spawn_release(self.engine.clone(), Resource::Volume(name));
        }
    }
}

enum Resource {
    Container(String),
    Volume(String),
}

fn spawn_release(engine: Arc<dyn ContainerEngine>, resource: Resource) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        match resource {
            Resource::Container(id) => warn!(container = %id, "Leaked container: no runtime to remove it"),
            Resource::Volume(name) => warn!(volume = %name, "Leaked volume: no runtime to remove it"),
        }
        return;
    };

    handle.spawn(async move {
        let (label, result) = match &resource {
            Resource::Container(id) => (format!("container {}", id), engine.remove_container(id).await),
            Resource::Volume(name) => (format!("volume {}", name), engine.remove_volume(name).await),
        };
        match result {
            Ok(()) => debug!("Removed unreleased {}", label),
            Err(e) => warn!("{}", CleanupWarning::new(label, e.to_string())),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use std::time::Duration;

    #[tokio::test]
    async fn test_release_removes_container() {
        let engine = Arc::new(MockEngine::new());
        let spec = ContainerSpec::new("builder");

        let container = ScopedContainer::create(engine.clone(), &spec).await.unwrap();
        assert!(!container.id().is_empty());
        container.release().await.unwrap();

        assert_eq!(engine.containers_created(), 1);
        assert_eq!(engine.containers_removed(), 1);
    }

    #[tokio::test]
    async fn test_drop_schedules_removal() {
        let engine = Arc::new(MockEngine::new());
        {
            let _volume = ScopedVolume::create(engine.clone(), "layers-1").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(engine.volumes_created(), 1);
        assert_eq!(engine.volumes_removed(), 1);
    }

    #[tokio::test]
    async fn test_release_failure_is_a_warning() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_removals();
        let volume = ScopedVolume::create(engine.clone(), "layers-2").await.unwrap();

        let warning = volume.release().await.unwrap_err();
        assert_eq!(warning.resource, "volume layers-2");
    }
}
