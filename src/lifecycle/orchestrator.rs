//! Runs lifecycle phases as containers, in order, one at a time
//!
//! Each phase container is created, started, and supervised until it exits while
//! its output is split into lines and forwarded live. Cancellation stops the
//! running container and fails the build at that phase. Every container created
//! here is removed before the next phase starts, whatever happened to it.

use super::phase::{failed_detect_exit_code, PhaseName, PhaseState};
use super::plan::PhasePlan;
use super::resources::BuildResources;
use crate::engine::{
    CleanupWarning, ContainerEngine, ContainerSpec, LogChunk, LogStream, ScopedContainer,
};
use crate::order::{select_group, DetectResults, Group};
use crate::progress::{ProgressEvent, ProgressHandler};
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a phase ended the build
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FailureReason {
    /// No group passed detection
    DetectionFailed,
    /// The phase binary exited non-zero
    NonZeroExit { code: i64 },
    /// The engine could not run the container
    ContainerError { message: String },
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::DetectionFailed => write!(f, "no buildpack group passed detection"),
            FailureReason::NonZeroExit { code } => write!(f, "exited with code {}", code),
            FailureReason::ContainerError { message } => write!(f, "container error: {}", message),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseFailure {
    pub phase: PhaseName,
    pub reason: FailureReason,
    /// Last lines of the phase's output
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestrationOutcome {
    pub state: PhaseState,
    pub completed: Vec<PhaseName>,
    /// Group chosen by detection, when known
    pub group: Option<Group>,
    pub failure: Option<PhaseFailure>,
    pub warnings: Vec<CleanupWarning>,
}

impl OrchestrationOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == PhaseState::Done
    }

    /// Whether the image was exported
    pub fn exported(&self) -> bool {
        self.succeeded()
            && self
                .completed
                .iter()
                .any(|p| matches!(p, PhaseName::Export | PhaseName::Create))
    }
}

/// What one phase container did
struct PhaseRun {
    exit: Result<i64, FailureReason>,
    output: OutputCollector,
    warning: Option<CleanupWarning>,
}

pub struct PhaseOrchestrator {
    engine: Arc<dyn ContainerEngine>,
    progress: Arc<dyn ProgressHandler>,
    diagnostic_lines: usize,
}

impl PhaseOrchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        progress: Arc<dyn ProgressHandler>,
        diagnostic_lines: usize,
    ) -> Self {
        Self {
            engine,
            progress,
            diagnostic_lines: diagnostic_lines.max(1),
        }
    }

    pub async fn run(
        &self,
        plan: &PhasePlan,
        resources: &BuildResources,
        cancel: &CancellationToken,
    ) -> OrchestrationOutcome {
        let mut outcome = OrchestrationOutcome {
            state: PhaseState::Pending.begin(plan.fused),
            completed: Vec::new(),
            group: None,
            failure: None,
            warnings: Vec::new(),
        };
        let failed_detect = failed_detect_exit_code(plan.platform_api);

        while let Some(phase) = outcome.state.phase() {
            if cancel.is_cancelled() {
                info!(phase = %phase, "Build cancelled before phase started");
                outcome.fail(phase, FailureReason::Cancelled, Vec::new());
                break;
            }

            let spec = plan.container_spec(phase, resources, outcome.group.as_ref());
            self.progress
                .on_progress(&ProgressEvent::PhaseStarted { phase });
            let started = Instant::now();

            let run = self.run_phase(phase, &spec, cancel).await;
            if let Some(warning) = run.warning {
                self.warn_cleanup(&warning);
                outcome.warnings.push(warning);
            }

            let exit_code = run.exit.as_ref().ok().copied();
            let verdict = match run.exit {
                Err(reason) => Err(reason),
                Ok(code) if phase.detects() && code == failed_detect => {
                    Err(FailureReason::DetectionFailed)
                }
                Ok(0) => Ok(()),
                Ok(code) => Err(FailureReason::NonZeroExit { code }),
            };

            if verdict.is_ok() && phase.detects() {
                self.select(plan, &run.output.detect, &mut outcome);
            }

            self.progress.on_progress(&ProgressEvent::PhaseComplete {
                phase,
                exit_code,
                duration: started.elapsed(),
                success: verdict.is_ok(),
            });

            match verdict {
                Ok(()) => {
                    outcome.completed.push(phase);
                    outcome.state = outcome.state.succeed();
                }
                Err(reason) => {
                    warn!(phase = %phase, reason = %reason, "Phase failed");
                    outcome.fail(phase, reason, run.output.into_tail());
                    break;
                }
            }
        }

        outcome
    }

    /// Picks the build group from detect output after the detector accepted one
    ///
    /// The detector's exit status decides whether detection passed. When its
    /// output names no group of the order, the build goes on with the group
    /// unknown, which keeps build and export off the network.
    fn select(
        &self,
        plan: &PhasePlan,
        results: &DetectResults,
        outcome: &mut OrchestrationOutcome,
    ) {
        if results.is_empty() {
            warn!("Detector reported no group; build and export stay isolated");
            return;
        }
        match select_group(&plan.order, results) {
            Some(group) => {
                debug!(group = ?group.display_names(), "Group selected");
                self.progress.on_progress(&ProgressEvent::GroupSelected {
                    buildpacks: group.display_names(),
                });
                outcome.group = Some(group);
            }
            None => warn!(
                "Detector passed but its output matches no group in the order; \
                 build and export stay isolated"
            ),
        }
    }

    async fn run_phase(
        &self,
        phase: PhaseName,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> PhaseRun {
        let mut output = OutputCollector::new(phase, self.diagnostic_lines, self.progress.clone());

        let container = match ScopedContainer::create(self.engine.clone(), spec).await {
            Ok(container) => container,
            Err(e) => {
                return PhaseRun {
                    exit: Err(FailureReason::ContainerError {
                        message: e.to_string(),
                    }),
                    output,
                    warning: None,
                }
            }
        };

        let exit = self.supervise(container.id(), &mut output, cancel).await;
        let warning = container.release().await.err();
        PhaseRun {
            exit,
            output,
            warning,
        }
    }

    /// Starts the container, then drains its output and waits for exit unless
    /// cancelled first
    async fn supervise(
        &self,
        id: &str,
        output: &mut OutputCollector,
        cancel: &CancellationToken,
    ) -> Result<i64, FailureReason> {
        self.engine
            .start_container(id)
            .await
            .map_err(|e| FailureReason::ContainerError {
                message: e.to_string(),
            })?;

        let finished = {
            let drain = drain_logs(self.engine.as_ref(), id, output);
            let wait = self.engine.wait_container(id);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                (_, exit) = async { tokio::join!(drain, wait) } => Some(exit),
            }
        };
        output.flush();

        match finished {
            Some(Ok(code)) => Ok(code),
            Some(Err(e)) => Err(FailureReason::ContainerError {
                message: e.to_string(),
            }),
            None => {
                if let Err(e) = self.engine.stop_container(id).await {
                    warn!(container = %id, error = %e, "Failed to stop cancelled container");
                }
                Err(FailureReason::Cancelled)
            }
        }
    }

    fn warn_cleanup(&self, warning: &CleanupWarning) {
        self.progress.on_progress(&ProgressEvent::CleanupWarning {
            message: warning.to_string(),
        });
    }
}

impl OrchestrationOutcome {
    fn fail(&mut self, phase: PhaseName, reason: FailureReason, diagnostics: Vec<String>) {
        self.state = self.state.fail();
        self.failure = Some(PhaseFailure {
            phase,
            reason,
            diagnostics,
        });
    }
}

async fn drain_logs(engine: &dyn ContainerEngine, id: &str, output: &mut OutputCollector) {
    let mut logs = engine.logs(id);
    while let Some(chunk) = logs.next().await {
        match chunk {
            Ok(chunk) => output.push(chunk),
            Err(e) => {
                warn!(container = %id, error = %e, "Log stream ended early");
                break;
            }
        }
    }
}

/// Splits raw chunks into lines per stream, forwards each line, and keeps the
/// most recent ones for diagnostics
struct OutputCollector {
    phase: PhaseName,
    progress: Arc<dyn ProgressHandler>,
    partial: HashMap<LogStream, String>,
    tail: VecDeque<String>,
    capacity: usize,
    detect: DetectResults,
}

impl OutputCollector {
    fn new(phase: PhaseName, capacity: usize, progress: Arc<dyn ProgressHandler>) -> Self {
        Self {
            phase,
            progress,
            partial: HashMap::new(),
            tail: VecDeque::with_capacity(capacity),
            capacity,
            detect: DetectResults::new(),
        }
    }

    fn push(&mut self, chunk: LogChunk) {
        let buffer = self.partial.entry(chunk.stream).or_default();
        buffer.push_str(&chunk.text);

        let mut lines = Vec::new();
        while let Some(pos) = buffer.find('\n') {
            let line: String = buffer.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        for line in lines {
            self.emit(chunk.stream, line);
        }
    }

    fn flush(&mut self) {
        let pending: Vec<(LogStream, String)> = self
            .partial
            .drain()
            .filter(|(_, rest)| !rest.is_empty())
            .collect();
        for (stream, rest) in pending {
            self.emit(stream, rest);
        }
    }

    fn emit(&mut self, stream: LogStream, line: String) {
        if self.phase.detects() {
            self.detect.observe(&line);
        }
        if self.tail.len() == self.capacity {
            self.tail.pop_front();
        }
        self.tail.push_back(line.clone());
        self.progress.on_progress(&ProgressEvent::PhaseOutput {
            phase: self.phase,
            stream,
            line,
        });
    }

    fn into_tail(self) -> Vec<String> {
        self.tail.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{CollectingHandler, NoOpHandler};

    fn collector(capacity: usize) -> (OutputCollector, Arc<CollectingHandler>) {
        let handler = Arc::new(CollectingHandler::new());
        (
            OutputCollector::new(PhaseName::Detect, capacity, handler.clone()),
            handler,
        )
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let (mut output, handler) = collector(10);
        output.push(LogChunk::stdout("pass: bp1@0.0.1\nbuil"));
        output.push(LogChunk::stderr("oops\n"));
        output.push(LogChunk::stdout("ding\r\n"));
        output.push(LogChunk::stdout("trailing"));
        output.flush();

        assert_eq!(
            handler.lines_for(PhaseName::Detect),
            vec!["pass: bp1@0.0.1", "oops", "building", "trailing"]
        );
        assert!(!output.detect.is_empty());
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let (mut output, _) = collector(2);
        output.push(LogChunk::stdout("one\ntwo\nthree\n"));
        assert_eq!(output.into_tail(), vec!["two", "three"]);
    }

    #[test]
    fn test_outcome_exported() {
        let outcome = OrchestrationOutcome {
            state: PhaseState::Done,
            completed: vec![PhaseName::Create],
            group: None,
            failure: None,
            warnings: Vec::new(),
        };
        assert!(outcome.exported());

        let failed = OrchestrationOutcome {
            state: PhaseState::Failed(Some(PhaseName::Export)),
            completed: vec![PhaseName::Detect],
            ..outcome
        };
        assert!(!failed.exported());
    }

    #[test]
    fn test_minimum_diagnostics() {
        let orchestrator = PhaseOrchestrator::new(
            Arc::new(crate::engine::MockEngine::new()),
            Arc::new(NoOpHandler),
            0,
        );
        assert_eq!(orchestrator.diagnostic_lines, 1);
    }
}
