//! cnbpack - Cloud Native Buildpacks lifecycle orchestration
//!
//! This library turns application source into a container image by driving the
//! buildpacks lifecycle (detect, analyze, restore, build, export) in containers.
//! It resolves the buildpacks to run, agrees on a Platform API with the builder and
//! its lifecycle, provisions caches and per-build volumes, and runs every phase
//! with the right mounts, credentials and network isolation.
//!
//! # Core Concepts
//!
//! - **Builder**: an image bundling buildpacks, a default detection order and a
//!   lifecycle binary
//! - **Order**: prioritized groups of buildpacks; detection picks the first group
//!   that passes
//! - **Platform API**: the contract version between this client and the lifecycle,
//!   negotiated before any container starts
//! - **Container engine**: everything runs through the [`ContainerEngine`] trait
//!
//! # Example Usage
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
//! let request = BuildRequest::new("./app", "paketobuildpacks/builder-jammy-base", "myapp")
//!     .with_env("BP_NODE_VERSION", "20");
//! let result = coordinator
//!     .build(&request, CancellationToken::new())
//!     .await?
//!     .into_result()?;
//! println!("Built {:?} with {:?}", result.image, result.group);
//! # Ok(())
//! # }
//! ```
//!
//! # Project Structure
//!
//! - [`buildpack`]: buildpack references, local store, registry, resolution
//! - [`builder`]: builder and lifecycle image metadata
//! - [`order`]: order merging, resolution and group selection
//! - [`compat`]: API versions and Platform API negotiation
//! - [`cache`]: persistent cache volumes and images
//! - [`lifecycle`]: phase plans, per-build resources and the phase orchestrator
//! - [`build`]: the build coordinator tying it all together

pub mod build;
pub mod builder;
pub mod buildpack;
pub mod cache;
pub mod cli;
pub mod compat;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod order;
pub mod progress;
pub mod util;

pub use build::{BuildCoordinator, BuildRequest, BuildResult, CachePreference};
pub use config::{CnbpackConfig, ConfigError};
pub use engine::{ContainerEngine, DockerEngine, EngineError, MockEngine};
pub use error::{BuildError, BuildStage};
pub use progress::{
    CollectingHandler, LoggingHandler, NoOpHandler, ProgressEvent, ProgressHandler,
};
pub use util::{init_default, init_from_env, init_logging, LoggingConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
