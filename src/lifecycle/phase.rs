//! Phase names and the build state machine

use crate::compat::ApiVersion;
use serde::Serialize;
use std::fmt;

pub const LIFECYCLE_DIR: &str = "/cnb/lifecycle";

/// Platform API from which detect signals "no group passed" with exit 20
const DETECT_EXIT_CHANGE: ApiVersion = ApiVersion::new(0, 6);
const DETECT_FAILED_CURRENT: i64 = 20;
const DETECT_FAILED_LEGACY: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseName {
    Detect,
    Analyze,
    Restore,
    Build,
    Export,
    /// All five phases fused into one container, for trusted builders
    Create,
}

impl PhaseName {
    /// The lifecycle binary that runs this phase
    pub fn binary(&self) -> &'static str {
        match self {
            PhaseName::Detect => "detector",
            PhaseName::Analyze => "analyzer",
            PhaseName::Restore => "restorer",
            PhaseName::Build => "builder",
            PhaseName::Export => "exporter",
            PhaseName::Create => "creator",
        }
    }

    pub fn binary_path(&self) -> String {
        format!("{}/{}", LIFECYCLE_DIR, self.binary())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Detect => "detect",
            PhaseName::Analyze => "analyze",
            PhaseName::Restore => "restore",
            PhaseName::Build => "build",
            PhaseName::Export => "export",
            PhaseName::Create => "create",
        }
    }

    /// Whether this phase runs buildpack detection
    pub fn detects(&self) -> bool {
        matches!(self, PhaseName::Detect | PhaseName::Create)
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Exit code with which the detector reports that no group passed
pub fn failed_detect_exit_code(platform_api: ApiVersion) -> i64 {
    if platform_api >= DETECT_EXIT_CHANGE {
        DETECT_FAILED_CURRENT
    } else {
        DETECT_FAILED_LEGACY
    }
}

/// Where a build is.
///
/// `Pending → Detecting → Analyzing → Restoring → Building → Exporting → Done`,
/// or `Pending → Creating → Done` for a trusted builder. Any running state can
/// move to `Failed`; `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "phase", rename_all = "lowercase")]
pub enum PhaseState {
    Pending,
    Detecting,
    Analyzing,
    Restoring,
    Building,
    Exporting,
    Creating,
    Done,
    Failed(Option<PhaseName>),
}

impl PhaseState {
    /// Leaves `Pending` for the first phase of the chosen path
    pub fn begin(self, fused: bool) -> PhaseState {
        match self {
            PhaseState::Pending if fused => PhaseState::Creating,
            PhaseState::Pending => PhaseState::Detecting,
            other => other,
        }
    }

    /// Phase being run in this state
    pub fn phase(&self) -> Option<PhaseName> {
        match self {
            PhaseState::Detecting => Some(PhaseName::Detect),
            PhaseState::Analyzing => Some(PhaseName::Analyze),
            PhaseState::Restoring => Some(PhaseName::Restore),
            PhaseState::Building => Some(PhaseName::Build),
            PhaseState::Exporting => Some(PhaseName::Export),
            PhaseState::Creating => Some(PhaseName::Create),
            PhaseState::Pending | PhaseState::Done | PhaseState::Failed(_) => None,
        }
    }

    /// Transition after the current phase exited successfully
    pub fn succeed(self) -> PhaseState {
        match self {
            PhaseState::Detecting => PhaseState::Analyzing,
            PhaseState::Analyzing => PhaseState::Restoring,
            PhaseState::Restoring => PhaseState::Building,
            PhaseState::Building => PhaseState::Exporting,
            PhaseState::Exporting | PhaseState::Creating => PhaseState::Done,
            other => other,
        }
    }

    /// Transition on failure or cancellation
    pub fn fail(self) -> PhaseState {
        match self {
            PhaseState::Done | PhaseState::Failed(_) => self,
            other => PhaseState::Failed(other.phase()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseState::Done | PhaseState::Failed(_))
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseState::Pending => write!(f, "pending"),
            PhaseState::Detecting => write!(f, "detecting"),
            PhaseState::Analyzing => write!(f, "analyzing"),
            PhaseState::Restoring => write!(f, "restoring"),
            PhaseState::Building => write!(f, "building"),
            PhaseState::Exporting => write!(f, "exporting"),
            PhaseState::Creating => write!(f, "creating"),
            PhaseState::Done => write!(f, "done"),
            PhaseState::Failed(Some(phase)) => write!(f, "failed during {}", phase),
            PhaseState::Failed(None) => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    #[test]
    fn test_split_path_order() {
        let mut state = PhaseState::Pending.begin(false);
        let mut phases = Vec::new();
        while let Some(phase) = state.phase() {
            phases.push(phase);
            state = state.succeed();
        }
        assert_eq!(
            phases,
            vec![
                PhaseName::Detect,
                PhaseName::Analyze,
                PhaseName::Restore,
                PhaseName::Build,
                PhaseName::Export
            ]
        );
        assert_eq!(state, PhaseState::Done);
    }

    #[test]
    fn test_fused_path() {
        let state = PhaseState::Pending.begin(true);
        assert_eq!(state.phase(), Some(PhaseName::Create));
        assert_eq!(state.succeed(), PhaseState::Done);
    }

    #[test]
    fn test_failure_records_phase() {
        let failed = PhaseState::Building.fail();
        assert_eq!(failed, PhaseState::Failed(Some(PhaseName::Build)));
        assert!(failed.is_terminal());
        assert_eq!(failed.succeed(), failed);
        assert_eq!(failed.fail(), failed);
        assert_eq!(PhaseState::Done.fail(), PhaseState::Done);
    }

    #[parameterized(
        legacy = { "0.5", 100 },
        boundary = { "0.6", 20 },
        current = { "0.12", 20 },
    )]
    fn test_failed_detect_code(api: &str, code: i64) {
        assert_eq!(failed_detect_exit_code(api.parse().unwrap()), code);
    }

    #[test]
    fn test_binaries() {
        assert_eq!(PhaseName::Export.binary_path(), "/cnb/lifecycle/exporter");
        assert_eq!(PhaseName::Create.binary(), "creator");
        assert!(PhaseName::Create.detects());
        assert!(!PhaseName::Build.detects());
    }
}
