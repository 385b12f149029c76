//! Output formatting for multiple formats
//!
//! Final reports (build results, builder metadata, configuration) are rendered
//! as JSON, YAML or human-readable text. Live build output goes through
//! [`ConsoleHandler`], which prints phase headers and prefixed phase lines.

use anyhow::{Context, Result};
use std::io::Write;
use std::sync::Mutex;

use crate::build::BuildResult;
use crate::builder::Builder;
use crate::buildpack::BuildpackRef;
use crate::config::CnbpackConfig;
use crate::lifecycle::PhaseName;
use crate::progress::{ProgressEvent, ProgressHandler};

const RULE: &str = "\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}";
const BUILDER_URN_PREFIX: &str = "urn:cnb:builder:";

/// Output format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON format (machine-readable)
    Json,
    /// YAML format
    Yaml,
    /// Human-readable formatted text
    Human,
}

pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format_result(&self, result: &BuildResult) -> Result<String> {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result)
                .context("Failed to serialize build result to JSON"),
            OutputFormat::Yaml => {
                serde_yaml::to_string(result).context("Failed to serialize build result to YAML")
            }
            OutputFormat::Human => Ok(self.format_result_human(result)),
        }
    }

    pub fn format_builder(&self, builder: &Builder) -> Result<String> {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(builder).context("Failed to serialize builder to JSON")
            }
            OutputFormat::Yaml => {
                serde_yaml::to_string(builder).context("Failed to serialize builder to YAML")
            }
            OutputFormat::Human => Ok(self.format_builder_human(builder)),
        }
    }

    pub fn format_config(&self, config: &CnbpackConfig) -> Result<String> {
        let map: std::collections::BTreeMap<_, _> = config.to_display_map().into_iter().collect();
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&map).context("Failed to serialize config to JSON")
            }
            OutputFormat::Yaml => {
                serde_yaml::to_string(&map).context("Failed to serialize config to YAML")
            }
            OutputFormat::Human => Ok(config.to_string()),
        }
    }

    pub fn format_pulled(&self, uri: &str, buildpack: &BuildpackRef) -> String {
        format!(
            "Successfully pulled {} ({}, {})\n",
            uri,
            buildpack.display_name(),
            buildpack.source
        )
    }

    fn format_result_human(&self, result: &BuildResult) -> String {
        let mut output = String::new();

        if result.success {
            output.push_str("\u{2713} Build Succeeded\n");
        } else {
            output.push_str("\u{2717} Build Failed\n");
        }
        output.push_str(RULE);
        output.push_str("\n\n");

        if let Some(ref image) = result.image {
            output.push_str(&format!("Image:         {}\n", image));
        }
        output.push_str(&format!("Build:         {}\n", result.build_id));
        output.push_str(&format!("Platform API:  {}\n", result.platform_api));
        if !result.group.is_empty() {
            output.push_str("Buildpacks:\n");
            for (i, buildpack) in result.group.iter().enumerate() {
                let connector = if i == result.group.len() - 1 {
                    "\u{2514}\u{2500}"
                } else {
                    "\u{251C}\u{2500}"
                };
                output.push_str(&format!("{} {}\n", connector, buildpack));
            }
        }

        if let Some(phase) = result.failed_phase {
            output.push_str(&format!("\nFailed phase:  {}\n", phase));
            if let Some(ref reason) = result.reason {
                output.push_str(&format!("Reason:        {}\n", reason));
            }
            if !result.diagnostics.is_empty() {
                output.push_str("\nLast output:\n");
                for line in &result.diagnostics {
                    output.push_str(&format!("  {}\n", line));
                }
            }
        }

        if !result.warnings.is_empty() {
            output.push_str("\n\u{26A0} Warnings:\n");
            for warning in &result.warnings {
                output.push_str(&format!("  - {}\n", warning));
            }
        }

        output.push_str(&format!("\nFinished in {}ms\n", result.duration_ms));
        output
    }

    fn format_builder_human(&self, builder: &Builder) -> String {
        let mut output = String::new();

        output.push_str(&format!("Builder {}\n", builder.reference));
        output.push_str(RULE);
        output.push_str("\n\n");

        if !builder.description.is_empty() {
            output.push_str(&format!("Description:   {}\n", builder.description));
        }
        if let Some(ref created_by) = builder.created_by {
            output.push_str(&format!("Created By:    {}\n", created_by));
        }
        output.push_str(&format!("Image Id:      {}\n", builder.digest));
        if let Some(ref run_image) = builder.run_image {
            output.push_str(&format!("Run Image:     {}\n", run_image));
            for mirror in &builder.run_image_mirrors {
                output.push_str(&format!("  Mirror:      {}\n", mirror));
            }
        }

        output.push_str("\nLifecycle:\n");
        output.push_str(&format!(
            "\u{251C}\u{2500} Version:        {}\n",
            if builder.lifecycle.version.is_empty() {
                "(unknown)"
            } else {
                builder.lifecycle.version.as_str()
            }
        ));
        output.push_str(&format!(
            "\u{251C}\u{2500} Platform APIs:  {}\n",
            builder.lifecycle.platform_api
        ));
        match builder.lifecycle.buildpack_api {
            Some(range) => output.push_str(&format!("\u{2514}\u{2500} Buildpack APIs: {}\n", range)),
            None => output.push_str("\u{2514}\u{2500} Buildpack APIs: (not declared)\n"),
        }

        output.push_str("\nBuildpacks:\n");
        if builder.buildpacks.is_empty() {
            output.push_str("  (none)\n");
        }
        for buildpack in &builder.buildpacks {
            let api = buildpack
                .api
                .map(|api| format!("api {}", api))
                .unwrap_or_default();
            output.push_str(&format!("  {:<40} {}\n", buildpack.display_name(), api));
        }

        output.push_str("\nDetection Order:\n");
        if builder.default_order.groups.is_empty() {
            output.push_str("  (none)\n");
        }
        for (index, group) in builder.default_order.groups.iter().enumerate() {
            output.push_str(&format!("  Group #{}:\n", index + 1));
            for entry in &group.entries {
                let name = entry
                    .reference
                    .strip_prefix(BUILDER_URN_PREFIX)
                    .unwrap_or(&entry.reference);
                let optional = if entry.optional { " (optional)" } else { "" };
                output.push_str(&format!("    {}{}\n", name, optional));
            }
        }

        output
    }
}

/// Prints live build progress the way users expect from a buildpacks CLI:
/// a `===> PHASE` header per phase and each output line prefixed with the
/// phase binary.
pub struct ConsoleHandler<W: Write + Send> {
    out: Mutex<W>,
    quiet: bool,
}

impl ConsoleHandler<std::io::Stdout> {
    pub fn stdout(quiet: bool) -> Self {
        Self::new(std::io::stdout(), quiet)
    }
}

impl<W: Write + Send> ConsoleHandler<W> {
    pub fn new(out: W, quiet: bool) -> Self {
        Self {
            out: Mutex::new(out),
            quiet,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_line(&self, line: &str) {
        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Console output is best effort; a closed stdout must not fail the build
        let _ = writeln!(out, "{}", line);
    }
}

fn phase_header(phase: PhaseName) -> String {
    let verb = match phase {
        PhaseName::Detect => "DETECTING",
        PhaseName::Analyze => "ANALYZING",
        PhaseName::Restore => "RESTORING",
        PhaseName::Build => "BUILDING",
        PhaseName::Export => "EXPORTING",
        PhaseName::Create => "CREATING",
    };
    format!("===> {}", verb)
}

impl<W: Write + Send> ProgressHandler for ConsoleHandler<W> {
    fn on_progress(&self, event: &ProgressEvent) {
        if self.quiet {
            return;
        }
        match event {
            ProgressEvent::PhaseStarted { phase } => self.write_line(&phase_header(*phase)),
            ProgressEvent::PhaseOutput { phase, line, .. } => {
                self.write_line(&format!("[{}] {}", phase.binary(), line))
            }
            ProgressEvent::GroupSelected { buildpacks } => {
                for buildpack in buildpacks {
                    self.write_line(&format!("    {}", buildpack));
                }
            }
            ProgressEvent::CleanupWarning { message } => {
                self.write_line(&format!("Warning: {}", message))
            }
            ProgressEvent::Completed { image, .. } => {
                self.write_line(&format!("Successfully built image '{}'", image))
            }
            _ => {}
        }
    }
}
