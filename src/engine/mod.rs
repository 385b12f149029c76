//! Container engine capability set
//!
//! The lifecycle orchestration only ever talks to a container engine through the
//! [`ContainerEngine`] trait: create/start/wait/stream-logs/stop/remove containers,
//! create/remove volumes, and pull/push/inspect images. Any engine exposing that
//! capability set is substitutable.
//!
//! - [`DockerEngine`] drives a Docker (or Podman) daemon through `bollard`
//! - [`MockEngine`] records every call and replays scripted phase output, for tests
//!
//! Engine handles are always constructed explicitly and passed in as
//! `Arc<dyn ContainerEngine>`; there is no process-wide connection.

pub mod docker;
pub mod mock;
pub mod pull;
pub mod reference;
pub mod scoped;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub use docker::DockerEngine;
pub use mock::{EngineCall, MockEngine, PhaseScript};
pub use pull::{ensure_image, pull_with_retry, PullOptions, PullPolicy};
pub use reference::{ImageReference, ReferenceError};
pub use scoped::{CleanupWarning, ScopedContainer, ScopedVolume};

/// Errors reported by a container engine
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The engine could not be reached at all
    #[error("Container engine unavailable: {0}")]
    Unavailable(String),

    /// The image, container or volume does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The engine rejected or failed the operation
    #[error("{operation} failed: {message}")]
    Api {
        operation: String,
        status: Option<u16>,
        message: String,
    },
}

impl EngineError {
    pub fn api(operation: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Api {
            operation: operation.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Whether retrying the same call could plausibly succeed
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Unavailable(_) => true,
            EngineError::NotFound(_) => false,
            EngineError::Api { status, .. } => match status {
                None => true,
                Some(code) => *code >= 500,
            },
        }
    }
}

/// Which output stream a chunk of container output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// A raw chunk of container output; may hold several lines or a partial one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub stream: LogStream,
    pub text: String,
}

impl LogChunk {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stderr,
            text: text.into(),
        }
    }
}

/// Locally present image: engine id plus config labels
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub labels: HashMap<String, String>,
}

impl ImageInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            labels: HashMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// Named engine volume
    Volume(String),
    /// Host path
    Bind(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

impl MountSpec {
    pub fn volume(name: impl Into<String>, target: impl Into<String>, read_only: bool) -> Self {
        Self {
            source: MountSource::Volume(name.into()),
            target: target.into(),
            read_only,
        }
    }

    pub fn bind(path: impl Into<PathBuf>, target: impl Into<String>, read_only: bool) -> Self {
        Self {
            source: MountSource::Bind(path.into()),
            target: target.into(),
            read_only,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMode {
    /// No network access at all
    Isolated,
    /// The engine's default network
    Default,
    /// A user-selected network
    Named(String),
}

impl NetworkMode {
    pub fn is_isolated(&self) -> bool {
        matches!(self, NetworkMode::Isolated)
    }

    /// Value understood by the engine's `NetworkMode` host setting
    pub fn as_engine_value(&self) -> &str {
        match self {
            NetworkMode::Isolated => "none",
            NetworkMode::Default => "default",
            NetworkMode::Named(name) => name,
        }
    }
}

/// Everything needed to create one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: Option<String>,
    pub entrypoint: Vec<String>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<MountSpec>,
    pub network: NetworkMode,
    pub user: Option<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: None,
            entrypoint: Vec::new(),
            args: Vec::new(),
            env: Vec::new(),
            mounts: Vec::new(),
            network: NetworkMode::Default,
            user: None,
            labels: HashMap::new(),
        }
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn mount_at(&self, target: &str) -> Option<&MountSpec> {
        self.mounts.iter().find(|m| m.target == target)
    }
}

/// The abstract container engine the orchestrator is written against
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn pull_image(&self, reference: &str) -> Result<(), EngineError>;

    async fn push_image(&self, reference: &str) -> Result<(), EngineError>;

    /// Returns `None` when the image is not present locally
    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>, EngineError>;

    /// Creating a volume that already exists returns the existing one
    async fn create_volume(&self, name: &str) -> Result<(), EngineError>;

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Blocks until the container exits and returns its exit code
    async fn wait_container(&self, id: &str) -> Result<i64, EngineError>;

    /// Follows the container's combined output until it exits
    fn logs(&self, id: &str) -> BoxStream<'_, Result<LogChunk, EngineError>>;

    async fn stop_container(&self, id: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::Unavailable("socket".to_string()).is_transient());
        assert!(!EngineError::NotFound("img".to_string()).is_transient());
        assert!(EngineError::api("pull", "connection reset").is_transient());
        assert!(EngineError::Api {
            operation: "pull".to_string(),
            status: Some(503),
            message: "unavailable".to_string(),
        }
        .is_transient());
        assert!(!EngineError::Api {
            operation: "pull".to_string(),
            status: Some(401),
            message: "unauthorized".to_string(),
        }
        .is_transient());
    }

    #[test]
    fn test_network_mode_values() {
        assert_eq!(NetworkMode::Isolated.as_engine_value(), "none");
        assert_eq!(NetworkMode::Default.as_engine_value(), "default");
        assert_eq!(
            NetworkMode::Named("buildnet".to_string()).as_engine_value(),
            "buildnet"
        );
    }

    #[test]
    fn test_container_spec_lookup() {
        let mut spec = ContainerSpec::new("builder:latest");
        spec.env.push(("CNB_PLATFORM_API".to_string(), "0.7".to_string()));
        spec.mounts.push(MountSpec::volume("layers", "/layers", false));

        assert_eq!(spec.env_value("CNB_PLATFORM_API"), Some("0.7"));
        assert!(spec.env_value("MISSING").is_none());
        assert!(spec.mount_at("/layers").is_some());
        assert!(spec.mount_at("/workspace").is_none());
    }
}
