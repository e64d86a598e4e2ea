//! Per-node results of a phase run

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Terminal (or in-flight) status of one host in a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    #[default]
    Unstarted,
    Running,
    Success,
    Failed,
}

impl HostStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, HostStatus::Success | HostStatus::Failed)
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostStatus::Unstarted => "unstarted",
            HostStatus::Running => "running",
            HostStatus::Success => "success",
            HostStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

fn is_false(value: &bool) -> bool {
    !value
}

/// Outcome of one stage on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    /// Chain the stage belongs to
    pub chain: String,
    /// Human-readable stage label
    pub stage: String,
    /// Command that was run (for copies: `["copy", local, remote]`)
    #[serde(default)]
    pub command: Vec<String>,
    /// Exit code, `-1` when the transport itself failed
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub duration_ms: u64,
    /// Failure of a best-effort chain, recorded but not counted
    #[serde(default, skip_serializing_if = "is_false")]
    pub tolerated: bool,
}

impl StageOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Whether this outcome makes its host fail
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !self.succeeded() && !self.tolerated
    }
}

/// All stage outcomes of one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResult {
    /// `address:port`
    pub host: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub outcomes: Vec<StageOutcome>,
    #[serde(default)]
    pub status: HostStatus,
}

impl NodeResult {
    #[must_use]
    pub fn new(host: impl Into<String>, tags: BTreeMap<String, String>) -> Self {
        Self {
            host: host.into(),
            tags,
            outcomes: Vec::new(),
            status: HostStatus::Running,
        }
    }

    /// Record an outcome and report whether the host may continue
    pub fn record(&mut self, outcome: StageOutcome) -> bool {
        let failed = outcome.is_failure();
        self.outcomes.push(outcome);
        !failed
    }

    /// Derive the terminal status from the recorded outcomes
    pub fn finish(&mut self) {
        self.status = if self.outcomes.iter().any(StageOutcome::is_failure) {
            HostStatus::Failed
        } else {
            HostStatus::Success
        };
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == HostStatus::Success
    }

    /// First stage that made this host fail
    #[must_use]
    pub fn failed_stage(&self) -> Option<&StageOutcome> {
        self.outcomes.iter().find(|o| o.is_failure())
    }

    #[must_use]
    pub fn role(&self) -> Option<&str> {
        self.tags.get("role").map(String::as_str)
    }
}

/// Counts over a set of node results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_hosts: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl RunSummary {
    #[must_use]
    pub fn from_results(results: &[NodeResult]) -> Self {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        Self {
            total_hosts: results.len(),
            succeeded,
            failed: results.len() - succeeded,
        }
    }

    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}
