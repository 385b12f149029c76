//! Logging-based progress handler

use super::{ProgressEvent, ProgressHandler};
use crate::engine::LogStream;
use tracing::{debug, info, warn};

/// Handler that logs progress events using tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl ProgressHandler for LoggingHandler {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started { image, builder } => {
                info!(image = %image, builder = %builder, "Starting build");
            }
            ProgressEvent::BuilderResolved {
                builder,
                lifecycle_version,
                buildpacks,
            } => {
                info!(
                    builder = %builder,
                    lifecycle = %lifecycle_version,
                    buildpacks,
                    "Builder resolved"
                );
            }
            ProgressEvent::PlatformApiNegotiated { version } => {
                info!(platform_api = %version, "Platform API negotiated");
            }
            ProgressEvent::OrderResolved { groups, buildpacks } => {
                debug!(groups, buildpacks, "Build order resolved");
            }
            ProgressEvent::PhaseStarted { phase } => {
                info!(phase = %phase, "Starting phase");
            }
            ProgressEvent::PhaseOutput {
                phase,
                stream,
                line,
            } => match stream {
                LogStream::Stdout => debug!(phase = %phase, "{}", line),
                LogStream::Stderr => debug!(phase = %phase, stream = "stderr", "{}", line),
            },
            ProgressEvent::PhaseComplete {
                phase,
                exit_code,
                duration,
                success,
            } => {
                if *success {
                    info!(
                        phase = %phase,
                        duration_ms = duration.as_millis(),
                        "Phase complete"
                    );
                } else {
                    warn!(
                        phase = %phase,
                        exit_code = ?exit_code,
                        duration_ms = duration.as_millis(),
                        "Phase failed"
                    );
                }
            }
            ProgressEvent::GroupSelected { buildpacks } => {
                info!(group = %buildpacks.join(", "), "Detection selected group");
            }
            ProgressEvent::CleanupWarning { message } => {
                warn!("Cleanup: {}", message);
            }
            ProgressEvent::Completed { image, total_time } => {
                info!(
                    image = %image,
                    total_time_ms = total_time.as_millis(),
                    "Build complete"
                );
            }
            ProgressEvent::Failed { phase, error } => match phase {
                Some(phase) => warn!(phase = %phase, error = %error, "Build failed"),
                None => warn!(error = %error, "Build failed"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::PhaseName;
    use std::time::Duration;

    #[test]
    fn test_logging_handler() {
        let handler = LoggingHandler;

        handler.on_progress(&ProgressEvent::Started {
            image: "example/app".to_string(),
            builder: "example/builder".to_string(),
        });
        handler.on_progress(&ProgressEvent::PhaseOutput {
            phase: PhaseName::Detect,
            stream: LogStream::Stderr,
            line: "warning".to_string(),
        });
        handler.on_progress(&ProgressEvent::PhaseComplete {
            phase: PhaseName::Build,
            exit_code: Some(1),
            duration: Duration::from_secs(2),
            success: false,
        });
        handler.on_progress(&ProgressEvent::Failed {
            phase: None,
            error: "cancelled".to_string(),
        });
    }
}
