//! The terminal value of a build

use crate::compat::ApiVersion;
use crate::error::BuildError;
use crate::lifecycle::{FailureReason, PhaseName};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    pub success: bool,
    pub build_id: String,
    /// Produced image reference; set only on success
    pub image: Option<String>,
    /// Phase that failed; set only on failure
    pub failed_phase: Option<PhaseName>,
    pub reason: Option<FailureReason>,
    /// Tail of the failing phase's output
    pub diagnostics: Vec<String>,
    /// Cleanup problems; never change the outcome
    pub warnings: Vec<String>,
    pub platform_api: ApiVersion,
    pub completed_phases: Vec<PhaseName>,
    /// Buildpacks of the group chosen by detection, as `id@version`
    pub group: Vec<String>,
    pub duration_ms: u64,
}

impl BuildResult {
    /// Turns a failed build into the matching [`BuildError`]
    pub fn into_result(self) -> Result<BuildResult, BuildError> {
        if self.success {
            return Ok(self);
        }

        let phase = self.failed_phase;
        match (self.reason, phase) {
            (Some(FailureReason::DetectionFailed), _) => Err(BuildError::DetectionFailed {
                diagnostics: self.diagnostics,
            }),
            (Some(FailureReason::Cancelled), _) | (None, _) => Err(BuildError::Cancelled { phase }),
            (Some(reason), Some(phase)) => Err(BuildError::PhaseExecution {
                phase,
                reason,
                diagnostics: self.diagnostics,
            }),
            (Some(_), None) => Err(BuildError::Cancelled { phase: None }),
        }
    }
}
