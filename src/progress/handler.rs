//! Progress handler trait and events

use crate::compat::ApiVersion;
use crate::engine::LogStream;
use crate::lifecycle::PhaseName;
use std::sync::Mutex;
use std::time::Duration;

/// Events emitted while a build runs
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Build accepted
    Started { image: String, builder: String },

    /// Builder image read
    BuilderResolved {
        builder: String,
        lifecycle_version: String,
        buildpacks: usize,
    },

    /// Platform API agreed
    PlatformApiNegotiated { version: ApiVersion },

    /// Order resolved and validated
    OrderResolved { groups: usize, buildpacks: usize },

    /// Phase container started
    PhaseStarted { phase: PhaseName },

    /// One line of phase output, emitted as it arrives
    PhaseOutput {
        phase: PhaseName,
        stream: LogStream,
        line: String,
    },

    /// Phase container exited
    PhaseComplete {
        phase: PhaseName,
        exit_code: Option<i64>,
        duration: Duration,
        success: bool,
    },

    /// Detection picked the build group
    GroupSelected { buildpacks: Vec<String> },

    /// A resource could not be cleaned up; the outcome is unaffected
    CleanupWarning { message: String },

    /// Build finished successfully
    Completed { image: String, total_time: Duration },

    /// Build failed
    Failed {
        phase: Option<PhaseName>,
        error: String,
    },
}

/// Trait for handling progress events during a build
pub trait ProgressHandler: Send + Sync {
    /// Called when a progress event occurs
    fn on_progress(&self, event: &ProgressEvent);
}

/// No-op handler that ignores all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

impl ProgressHandler for NoOpHandler {
    fn on_progress(&self, _event: &ProgressEvent) {
        // Intentionally empty
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct CollectingHandler {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Output lines of one phase, in arrival order
    pub fn lines_for(&self, phase: PhaseName) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::PhaseOutput { phase: p, line, .. } if p == phase => Some(line),
                _ => None,
            })
            .collect()
    }

    /// Phases that started, in order
    pub fn started_phases(&self) -> Vec<PhaseName> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::PhaseStarted { phase } => Some(phase),
                _ => None,
            })
            .collect()
    }
}

impl ProgressHandler for CollectingHandler {
    fn on_progress(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
