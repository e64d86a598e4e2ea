//! Progress event types

use serde::{Deserialize, Serialize};

use crate::report::HostStatus;

/// Progress published by the driver while a phase runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    PhaseStarted {
        phase: String,
        hosts: usize,
    },
    StageStarted {
        phase: String,
        host: String,
        chain: String,
        stage: String,
    },
    StageFinished {
        phase: String,
        host: String,
        stage: String,
        exit_code: i32,
    },
    HostFinished {
        phase: String,
        host: String,
        status: HostStatus,
    },
    PhaseFinished {
        phase: String,
        succeeded: usize,
        failed: usize,
    },
}
