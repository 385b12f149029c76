//! Build error taxonomy
//!
//! Every error a build can surface names the stage it came from. Errors before
//! the first container (validation, resolution, negotiation, setup) abort the
//! build; phase errors come back through [`crate::build::BuildResult`] and are
//! turned into a [`BuildError`] by [`crate::build::BuildResult::into_result`].

use crate::buildpack::ResolveError;
use crate::builder::BuilderError;
use crate::compat::NegotiationError;
use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::lifecycle::{FailureReason, PhaseName, SetupError};
use crate::order::OrderError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Where in a build an error happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStage {
    Validation,
    Resolution,
    Negotiation,
    Detection,
    Phase(PhaseName),
    Setup,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStage::Validation => write!(f, "validation"),
            BuildStage::Resolution => write!(f, "resolution"),
            BuildStage::Negotiation => write!(f, "negotiation"),
            BuildStage::Detection => write!(f, "detection"),
            BuildStage::Phase(phase) => write!(f, "{} phase", phase),
            BuildStage::Setup => write!(f, "setup"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid build request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Buildpack resolution failed: {0}")]
    Resolution(#[from] ResolveError),

    #[error("Builder resolution failed: {0}")]
    Builder(#[from] BuilderError),

    #[error("Order resolution failed: {0}")]
    OrderResolution(#[from] OrderError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("No buildpack group passed detection")]
    DetectionFailed { diagnostics: Vec<String> },

    #[error("Phase {phase} failed: {reason}")]
    PhaseExecution {
        phase: PhaseName,
        reason: FailureReason,
        diagnostics: Vec<String>,
    },

    #[error("Build cancelled{}", .phase.map(|p| format!(" during {}", p)).unwrap_or_default())]
    Cancelled { phase: Option<PhaseName> },

    #[error("Failed to set up build: {0}")]
    Setup(#[from] SetupError),

    #[error("Cache error: {0}")]
    Cache(EngineError),
}

impl BuildError {
    pub fn stage(&self) -> BuildStage {
        match self {
            BuildError::InvalidRequest(_) | BuildError::Config(_) => BuildStage::Validation,
            BuildError::Resolution(_)
            | BuildError::Builder(_)
            | BuildError::OrderResolution(_) => BuildStage::Resolution,
            BuildError::Negotiation(_) => BuildStage::Negotiation,
            BuildError::DetectionFailed { .. } => BuildStage::Detection,
            BuildError::PhaseExecution { phase, .. } => BuildStage::Phase(*phase),
            BuildError::Cancelled { phase: Some(phase) } => BuildStage::Phase(*phase),
            BuildError::Cancelled { phase: None } | BuildError::Setup(_) | BuildError::Cache(_) => {
                BuildStage::Setup
            }
        }
    }

    /// Captured tail of the failing phase's output
    pub fn diagnostics(&self) -> &[String] {
        match self {
            BuildError::DetectionFailed { diagnostics }
            | BuildError::PhaseExecution { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }

    /// Returns a user-friendly error message with troubleshooting hints
    pub fn help_message(&self) -> String {
        let mut message = format!("Error ({}): {}\n", self.stage(), self);

        let hint = match self {
            BuildError::InvalidRequest(_) | BuildError::Config(_) => Some(
                "Help: Check the command line flags and CNBPACK_* environment variables.",
            ),
            BuildError::Resolution(ResolveError::SourceUnreachable { .. })
            | BuildError::Builder(BuilderError::Fetch { .. }) => Some(
                "Help: The image could not be fetched. Try:\n\
                 - Check network connectivity and registry credentials\n\
                 - Check that the container engine is running\n\
                 - Use --pull-policy never for images that are already local",
            ),
            BuildError::Resolution(_) | BuildError::OrderResolution(_) => Some(
                "Help: Buildpacks can be given as a local path, an image reference \
                 (docker://...), or <id>@<version> from the builder or a registry.",
            ),
            BuildError::Builder(_) => Some(
                "Help: The image does not look like a buildpacks builder. \
                 Inspect it with: cnbpack inspect-builder <image>",
            ),
            BuildError::Negotiation(_) => Some(
                "Help: The builder, the lifecycle and cnbpack do not share an API version. \
                 Try a newer builder or a different --lifecycle-image.",
            ),
            BuildError::DetectionFailed { .. } => Some(
                "Help: None of the builder's buildpack groups recognized the application. \
                 Check the --path, or pick buildpacks explicitly with --buildpack.",
            ),
            BuildError::Setup(_) | BuildError::Cache(_) => {
                Some("Help: Check that the container engine is running and reachable.")
            }
            BuildError::PhaseExecution { .. } | BuildError::Cancelled { .. } => None,
        };
        if let Some(hint) = hint {
            message.push('\n');
            message.push_str(hint);
            message.push('\n');
        }

        let diagnostics = self.diagnostics();
        if !diagnostics.is_empty() {
            message.push_str("\nLast output:\n");
            for line in diagnostics {
                message.push_str("  ");
                message.push_str(line);
                message.push('\n');
            }
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat::{ApiRange, ApiVersion};

    #[test]
    fn test_stage_of_each_error() {
        assert_eq!(
            BuildError::InvalidRequest("x".into()).stage(),
            BuildStage::Validation
        );
        assert_eq!(
            BuildError::OrderResolution(OrderError::EmptyOrder).stage(),
            BuildStage::Resolution
        );
        assert_eq!(
            BuildError::Negotiation(NegotiationError::IncompatiblePlatformApi {
                client: ApiRange::exact(ApiVersion::new(0, 3)),
                builder: ApiRange::exact(ApiVersion::new(0, 9)),
                lifecycle: ApiRange::exact(ApiVersion::new(0, 9)),
            })
            .stage(),
            BuildStage::Negotiation
        );
        assert_eq!(
            BuildError::DetectionFailed {
                diagnostics: vec![]
            }
            .stage(),
            BuildStage::Detection
        );
        assert_eq!(
            BuildError::Cancelled {
                phase: Some(PhaseName::Build)
            }
            .stage(),
            BuildStage::Phase(PhaseName::Build)
        );
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(BuildStage::Phase(PhaseName::Export).to_string(), "export phase");
        assert_eq!(BuildStage::Negotiation.to_string(), "negotiation");
    }

    #[test]
    fn test_help_message_includes_diagnostics() {
        let error = BuildError::PhaseExecution {
            phase: PhaseName::Build,
            reason: FailureReason::NonZeroExit { code: 51 },
            diagnostics: vec!["npm ERR! missing script: build".to_string()],
        };
        let help = error.help_message();
        assert!(help.contains("build phase"));
        assert!(help.contains("exited with code 51"));
        assert!(help.contains("npm ERR! missing script: build"));
    }

    #[test]
    fn test_cancelled_display() {
        let error = BuildError::Cancelled {
            phase: Some(PhaseName::Restore),
        };
        assert_eq!(error.to_string(), "Build cancelled during restore");
        assert_eq!(
            BuildError::Cancelled { phase: None }.to_string(),
            "Build cancelled"
        );
    }
}
