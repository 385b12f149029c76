//! Detect output interpretation and group selection

use super::{Group, GroupEntry, Order};
use crate::buildpack::BuildpackRef;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

fn verdict_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|\s)(pass|fail|skip|err):\s+([^\s@]+)(?:@(\S+))?\s*$")
            .expect("valid regex")
    })
}

/// `<id> <version>` rows the detector prints for the group it chose
fn listing_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:\[\w+\]\s+)?([A-Za-z0-9][\w./-]*)\s+(\d[\w.+-]*)$").expect("valid regex")
    })
}

/// Per-buildpack detect verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectOutcome {
    Pass,
    Fail,
    Skip,
    Error,
}

/// Verdicts collected from detector output, keyed by id and optional version
///
/// Below debug level the detector prints no verdicts, only the chosen group as
/// `<id> <version>` rows. Listed buildpacks count as passed unless an explicit
/// verdict says otherwise.
#[derive(Debug, Clone, Default)]
pub struct DetectResults {
    verdicts: HashMap<(String, Option<String>), DetectOutcome>,
    listed: HashSet<(String, String)>,
}

impl DetectResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a verdict or group row if `line` is one; returns whether it was
    pub fn observe(&mut self, line: &str) -> bool {
        let line = line.trim();
        let Some(caps) = verdict_regex().captures(line) else {
            return match listing_regex().captures(line) {
                Some(caps) => {
                    self.listed.insert((caps[1].to_string(), caps[2].to_string()));
                    true
                }
                None => false,
            };
        };
        let outcome = match &caps[1] {
            "pass" => DetectOutcome::Pass,
            "fail" => DetectOutcome::Fail,
            "skip" => DetectOutcome::Skip,
            _ => DetectOutcome::Error,
        };
        let id = caps[2].to_string();
        let version = caps.get(3).map(|m| m.as_str().to_string());
        self.verdicts.insert((id, version), outcome);
        true
    }

    pub fn record(&mut self, buildpack: &BuildpackRef, outcome: DetectOutcome) {
        self.verdicts.insert(
            (buildpack.id.clone(), Some(buildpack.version.clone())),
            outcome,
        );
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty() && self.listed.is_empty()
    }

    pub fn outcome(&self, buildpack: &BuildpackRef) -> Option<DetectOutcome> {
        self.verdicts
            .get(&(buildpack.id.clone(), Some(buildpack.version.clone())))
            .or_else(|| self.verdicts.get(&(buildpack.id.clone(), None)))
            .copied()
    }

    pub fn passed(&self, buildpack: &BuildpackRef) -> bool {
        match self.outcome(buildpack) {
            Some(outcome) => outcome == DetectOutcome::Pass,
            None => self
                .listed
                .contains(&(buildpack.id.clone(), buildpack.version.clone())),
        }
    }
}

/// Picks the first group in which every required buildpack passed and at
/// least one buildpack participates; optional members that did not pass are
/// dropped from the selected group
pub fn select_group(order: &Order, results: &DetectResults) -> Option<Group> {
    order.groups().iter().find_map(|group| {
        let required_pass = group
            .entries
            .iter()
            .filter(|entry| !entry.optional)
            .all(|entry| results.passed(&entry.buildpack));
        if !required_pass {
            return None;
        }

        let participants: Vec<GroupEntry> = group
            .entries
            .iter()
            .filter(|entry| results.passed(&entry.buildpack))
            .cloned()
            .collect();
        (!participants.is_empty()).then_some(Group {
            entries: participants,
        })
    })
}
