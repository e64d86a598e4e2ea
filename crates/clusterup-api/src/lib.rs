//! clusterup-api: Shared report and state types
//!
//! Contains the per-node result types, the persisted run-state document, and
//! progress event types used across the driver, the phase actions and the CLI.

pub mod events;
pub mod report;
pub mod state;

pub use events::RunEvent;
pub use report::{HostStatus, NodeResult, RunSummary, StageOutcome};
pub use state::{HostRecord, RunState};
