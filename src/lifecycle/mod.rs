//! Lifecycle phase execution
//!
//! - [`phase`]: phase names, the build state machine, exit-code conventions
//! - [`plan`]: the container spec of each phase (mounts, args, network)
//! - [`resources`]: per-build volumes and platform directory
//! - [`orchestrator`]: runs the phases against a container engine

pub mod orchestrator;
pub mod phase;
pub mod plan;
pub mod resources;

pub use orchestrator::{FailureReason, OrchestrationOutcome, PhaseFailure, PhaseOrchestrator};
pub use phase::{failed_detect_exit_code, PhaseName, PhaseState};
pub use plan::{PhaseCaches, PhasePlan};
pub use resources::{BuildResources, SetupError};
