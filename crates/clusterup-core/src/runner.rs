//! Phase runner
//!
//! Binds a built [`Phase`] to a node set and hands it to a [`ChainDriver`],
//! either waiting for the results or detaching and returning a handle that
//! can be polled through the state file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::info;

use clusterup_api::{NodeResult, RunState};

use crate::chain::Phase;
use crate::driver::{ChainDriver, RunSettings};
use crate::error::CoreError;
use crate::node::Node;
use crate::state::StateFile;

/// How a phase run is started
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Wait for completion instead of returning a handle
    pub block: bool,
    /// Directory for per-phase state files; no persistence when unset
    pub state_dir: Option<PathBuf>,
    /// Keep host records already in the state file
    pub resume: bool,
}

impl RunRequest {
    pub fn blocking() -> Self {
        Self {
            block: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    fn state_file(&self, phase: &str) -> Option<StateFile> {
        self.state_dir
            .as_deref()
            .map(|dir| StateFile::for_phase(dir, phase))
    }
}

/// A phase running in the background
#[derive(Debug)]
pub struct RunHandle {
    phase: String,
    state_file: Option<StateFile>,
    task: JoinHandle<Result<Vec<NodeResult>, CoreError>>,
}

impl RunHandle {
    pub fn phase(&self) -> &str {
        &self.phase
    }

    /// Where progress is written, if persisted
    pub fn state_file(&self) -> Option<&Path> {
        self.state_file.as_ref().map(StateFile::path)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Current contents of the state file
    pub fn progress(&self) -> Option<RunState> {
        self.state_file.as_ref().map(StateFile::read)
    }

    /// # Errors
    /// Returns the driver's error, or `CoreError::Driver` if the task died
    pub async fn wait(self) -> Result<Vec<NodeResult>, CoreError> {
        self.task
            .await
            .map_err(|e| CoreError::Driver(format!("{} run aborted: {e}", self.phase)))?
    }
}

/// Result of starting a phase
#[derive(Debug)]
pub enum RunOutcome {
    Completed(Vec<NodeResult>),
    Detached(Vec<RunHandle>),
}

impl RunOutcome {
    /// Results, waiting on any detached runs in order
    ///
    /// # Errors
    /// Returns the first error of a detached run
    pub async fn wait(self) -> Result<Vec<NodeResult>, CoreError> {
        match self {
            RunOutcome::Completed(results) => Ok(results),
            RunOutcome::Detached(handles) => {
                let mut results = Vec::new();
                for handle in handles {
                    results.extend(handle.wait().await?);
                }
                Ok(results)
            }
        }
    }

    /// Append `other`; both must be of the same kind to stay meaningful
    pub(crate) fn chain(self, other: RunOutcome) -> RunOutcome {
        match (self, other) {
            (RunOutcome::Completed(mut a), RunOutcome::Completed(b)) => {
                a.extend(b);
                RunOutcome::Completed(a)
            }
            (RunOutcome::Detached(mut a), RunOutcome::Detached(b)) => {
                a.extend(b);
                RunOutcome::Detached(a)
            }
            (RunOutcome::Completed(_), detached @ RunOutcome::Detached(_))
            | (detached @ RunOutcome::Detached(_), RunOutcome::Completed(_)) => detached,
        }
    }
}

/// Starts phases on a driver
#[derive(Clone)]
pub struct PhaseRunner {
    driver: Arc<dyn ChainDriver>,
}

impl PhaseRunner {
    pub fn new(driver: Arc<dyn ChainDriver>) -> Self {
        Self { driver }
    }

    /// Run `phase` over `nodes`
    ///
    /// `extra_fields` land at the top level of the state document.
    ///
    /// # Errors
    /// Returns the driver's error when blocking
    pub async fn run(
        &self,
        phase: Phase,
        nodes: Vec<Node>,
        request: &RunRequest,
        extra_fields: Map<String, Value>,
    ) -> Result<RunOutcome, CoreError> {
        let state_file = request.state_file(phase.name());
        let settings = RunSettings {
            state_file: state_file.clone(),
            resume: request.resume,
            extra_fields,
        };
        info!(
            phase = %phase.name(),
            hosts = nodes.len(),
            block = request.block,
            "dispatching phase"
        );

        let phase = Arc::new(phase);
        if request.block {
            let results = self.driver.run(phase, nodes, settings).await?;
            return Ok(RunOutcome::Completed(results));
        }

        let driver = self.driver.clone();
        let name = phase.name().to_string();
        let task = tokio::spawn(async move { driver.run(phase, nodes, settings).await });
        Ok(RunOutcome::Detached(vec![RunHandle {
            phase: name,
            state_file,
            task,
        }]))
    }
}
