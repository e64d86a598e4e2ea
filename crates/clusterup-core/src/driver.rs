//! Multi-host driver
//!
//! Runs a [`Phase`] against a node set: up to `parallelism` nodes at once,
//! stages strictly in order per node, a node's failure confined to that node,
//! and the phase's cleanup chain run on every node that got a transport.
//! Progress goes to the state file and to a broadcast channel.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, instrument, warn};

use clusterup_api::{HostRecord, HostStatus, NodeResult, RunEvent, RunState, RunSummary, StageOutcome};
use clusterup_exec::{
    ConnectionInfo, ExecError, KeySource, LocalExecutor, RemoteExecutor, ResolvedKey, SshExecutor,
};

use crate::chain::{Chain, Phase, Stage};
use crate::config::SshSettings;
use crate::error::CoreError;
use crate::node::Node;
use crate::state::{self as state_file, StateFile};

/// Environment variable holding a base64 private key; takes precedence over
/// `ssh_key_path`
pub const SSH_KEY_ENV: &str = "CLUSTERUP_SSH_KEY";

/// Creates the transport used for one node
pub trait ExecutorFactory: Send + Sync {
    /// # Errors
    /// Returns `ExecError` if no transport can be built for the node
    fn executor_for(&self, node: &Node) -> Result<Arc<dyn RemoteExecutor>, ExecError>;
}

/// SSH transport for every node, sharing one resolved key
#[derive(Debug)]
pub struct SshExecutorFactory {
    user: String,
    key: Arc<ResolvedKey>,
}

impl SshExecutorFactory {
    /// # Errors
    /// Returns `ExecError::SshKeyError` if the configured key is unusable
    pub fn new(settings: &SshSettings) -> Result<Self, ExecError> {
        if !settings.extra_options.is_empty() {
            warn!(
                options = %settings.extra_options,
                "extra_ssh_options are OpenSSH client flags and are ignored by the built-in transport"
            );
        }

        let source = if std::env::var_os(SSH_KEY_ENV).is_some() {
            debug!("using SSH key from {SSH_KEY_ENV}");
            KeySource::Env(SSH_KEY_ENV.to_string())
        } else {
            KeySource::Path(settings.key_path.clone())
        };
        let key = source
            .resolve()
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

        Ok(Self {
            user: settings.user.clone(),
            key: Arc::new(key),
        })
    }
}

impl ExecutorFactory for SshExecutorFactory {
    fn executor_for(&self, node: &Node) -> Result<Arc<dyn RemoteExecutor>, ExecError> {
        let conn_info = ConnectionInfo::new(node.address(), &self.user).with_port(node.port());
        Ok(Arc::new(SshExecutor::with_resolved_key(
            conn_info,
            self.key.clone(),
        )))
    }
}

/// Runs every node's stages on the local machine
#[derive(Debug, Default)]
pub struct LocalExecutorFactory;

impl ExecutorFactory for LocalExecutorFactory {
    fn executor_for(&self, _node: &Node) -> Result<Arc<dyn RemoteExecutor>, ExecError> {
        Ok(Arc::new(LocalExecutor::new()))
    }
}

/// Per-run settings handed to a driver
#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    /// Where progress is persisted, if anywhere
    pub state_file: Option<StateFile>,
    /// Keep records of hosts not part of this run
    pub resume: bool,
    /// Merged into the top level of the state document
    pub extra_fields: Map<String, Value>,
}

/// Something that can run a phase over a node set
#[async_trait]
pub trait ChainDriver: Send + Sync {
    /// Run to completion and return one result per node, in input order
    async fn run(
        &self,
        phase: Arc<Phase>,
        nodes: Vec<Node>,
        settings: RunSettings,
    ) -> Result<Vec<NodeResult>, CoreError>;
}

/// Single writer for a run's state document
///
/// Updates are applied and encoded under `state`; the file write happens
/// afterwards on the blocking pool, serialised by `written` so an older
/// snapshot never replaces a newer one.
struct Recorder {
    file: Option<StateFile>,
    state: Mutex<(RunState, u64)>,
    written: Mutex<u64>,
}

impl Recorder {
    fn start(phase: &Phase, nodes: &[Node], settings: &RunSettings) -> Self {
        let file = settings.state_file.clone();
        let mut state = match (&file, settings.resume) {
            (Some(file), true) => file.read(),
            _ => RunState::default(),
        };

        for node in nodes {
            state.set_host(
                node.key(),
                &HostRecord {
                    host_status: HostStatus::Unstarted,
                    tags: node.tags().clone(),
                    commands: Vec::new(),
                },
            );
        }
        state.chain_name = Some(phase.name().to_string());
        state.total_hosts = Some(state.hosts.len() as u64);
        state.merge_fields(&settings.extra_fields);
        state.updated_at = Some(Utc::now());
        if let Some(file) = &file
            && let Err(e) = file.write(&state)
        {
            warn!(path = %file.path().display(), error = %e, "failed to persist run state");
        }

        Self {
            file,
            state: Mutex::new((state, 0)),
            written: Mutex::new(0),
        }
    }

    async fn update(&self, result: &NodeResult) {
        let snapshot = {
            let mut guard = self.state.lock().await;
            let (state, version) = &mut *guard;
            state.set_host(result.host.clone(), &HostRecord::from(result));
            state.updated_at = Some(Utc::now());
            *version += 1;
            self.file
                .as_ref()
                .map(|_| (*version, state_file::encode(state)))
        };

        if let (Some(file), Some((version, encoded))) = (&self.file, snapshot) {
            self.persist(file, version, encoded).await;
        }
    }

    async fn persist(&self, file: &StateFile, version: u64, encoded: io::Result<Vec<u8>>) {
        let mut written = self.written.lock().await;
        if version <= *written {
            return;
        }

        let target = file.clone();
        let outcome = match encoded {
            Ok(json) => tokio::task::spawn_blocking(move || target.write_bytes(&json))
                .await
                .unwrap_or_else(|e| Err(io::Error::other(e))),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => *written = version,
            Err(e) => warn!(path = %file.path().display(), error = %e, "failed to persist run state"),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Concurrent phase driver over a pluggable transport
pub struct MultiRunner {
    factory: Arc<dyn ExecutorFactory>,
    parallelism: usize,
    process_timeout: Duration,
    events: broadcast::Sender<RunEvent>,
}

impl MultiRunner {
    pub fn new(factory: Arc<dyn ExecutorFactory>, parallelism: usize, process_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            factory,
            parallelism: parallelism.max(1),
            process_timeout,
            events,
        }
    }

    /// Driver honouring the configured parallelism and timeout
    pub fn from_settings(settings: &SshSettings, factory: Arc<dyn ExecutorFactory>) -> Self {
        Self::new(factory, settings.parallelism, settings.process_timeout)
    }

    /// Progress events of every run started by this driver
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RunEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    async fn run_stage(
        &self,
        phase: &str,
        chain: &Chain,
        stage: &Stage,
        node: &Node,
        executor: &dyn RemoteExecutor,
    ) -> StageOutcome {
        let label = stage.label_for(node);
        let host = node.key();
        self.emit(RunEvent::StageStarted {
            phase: phase.to_string(),
            host: host.clone(),
            chain: chain.name().to_string(),
            stage: label.clone(),
        });

        let start = Instant::now();
        let (command, result) = match stage {
            Stage::Execute { argv, timeout, .. } => {
                let argv = argv.resolve(node);
                let result = executor
                    .execute(&argv, timeout.unwrap_or(self.process_timeout))
                    .await;
                (argv, result)
            }
            Stage::Copy {
                local_path,
                remote_path,
                ..
            } => {
                let command = vec![
                    "copy".to_string(),
                    local_path.display().to_string(),
                    remote_path.clone(),
                ];
                let result = executor
                    .copy(local_path, remote_path, self.process_timeout)
                    .await;
                (command, result)
            }
        };

        let outcome = match result {
            Ok(output) => StageOutcome {
                chain: chain.name().to_string(),
                stage: label,
                command,
                exit_code: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
                duration_ms: millis(output.duration),
                tolerated: chain.is_best_effort() && output.status != 0,
            },
            Err(e) => StageOutcome {
                chain: chain.name().to_string(),
                stage: label,
                command,
                exit_code: -1,
                stdout: String::new(),
                stderr: e.to_string(),
                duration_ms: millis(start.elapsed()),
                tolerated: chain.is_best_effort(),
            },
        };

        if outcome.succeeded() {
            debug!(host = %host, stage = %outcome.stage, "stage succeeded");
        } else {
            warn!(
                host = %host,
                chain = %outcome.chain,
                stage = %outcome.stage,
                exit_code = outcome.exit_code,
                tolerated = outcome.tolerated,
                stderr = %outcome.stderr.trim(),
                "stage failed"
            );
        }

        self.emit(RunEvent::StageFinished {
            phase: phase.to_string(),
            host,
            stage: outcome.stage.clone(),
            exit_code: outcome.exit_code,
        });
        outcome
    }

    /// Run `chain` on one node; false once a counted stage failed
    async fn run_chain(
        &self,
        phase: &str,
        chain: &Chain,
        node: &Node,
        executor: &dyn RemoteExecutor,
        result: &mut NodeResult,
        recorder: &Recorder,
    ) -> bool {
        for stage in chain.stages() {
            let outcome = self.run_stage(phase, chain, stage, node, executor).await;
            let proceed = result.record(outcome);
            recorder.update(result).await;
            if !proceed {
                return false;
            }
        }
        true
    }

    #[instrument(skip_all, fields(phase = %phase.name(), host = %node))]
    async fn run_node(&self, phase: &Phase, node: Node, recorder: &Recorder) -> NodeResult {
        let mut result = NodeResult::new(node.key(), node.tags().clone());
        recorder.update(&result).await;

        match self.factory.executor_for(&node) {
            Ok(executor) => {
                for chain in phase.chains() {
                    if !self
                        .run_chain(phase.name(), chain, &node, executor.as_ref(), &mut result, recorder)
                        .await
                    {
                        break;
                    }
                }

                if let Some(cleanup) = phase.cleanup() {
                    self.run_chain(phase.name(), cleanup, &node, executor.as_ref(), &mut result, recorder)
                        .await;
                }

                if let Err(e) = executor.close().await {
                    debug!(error = %e, "failed to close session");
                }
            }
            Err(e) => {
                warn!(error = %e, "no transport for host");
                result.record(StageOutcome {
                    chain: phase.name().to_string(),
                    stage: "Connecting".to_string(),
                    command: Vec::new(),
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    duration_ms: 0,
                    tolerated: false,
                });
            }
        }

        result.finish();
        recorder.update(&result).await;
        self.emit(RunEvent::HostFinished {
            phase: phase.name().to_string(),
            host: result.host.clone(),
            status: result.status,
        });
        result
    }
}

#[async_trait]
impl ChainDriver for MultiRunner {
    async fn run(
        &self,
        phase: Arc<Phase>,
        nodes: Vec<Node>,
        settings: RunSettings,
    ) -> Result<Vec<NodeResult>, CoreError> {
        info!(
            phase = %phase.name(),
            hosts = nodes.len(),
            parallelism = self.parallelism,
            "starting phase"
        );
        self.emit(RunEvent::PhaseStarted {
            phase: phase.name().to_string(),
            hosts: nodes.len(),
        });

        let recorder = Recorder::start(&phase, &nodes, &settings);

        let pending: Vec<_> = nodes
            .into_iter()
            .map(|node| self.run_node(&phase, node, &recorder))
            .collect();
        let results: Vec<NodeResult> = stream::iter(pending)
            .buffered(self.parallelism)
            .collect()
            .await;

        let summary = RunSummary::from_results(&results);
        info!(
            phase = %phase.name(),
            total = summary.total_hosts,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "phase finished"
        );
        self.emit(RunEvent::PhaseFinished {
            phase: phase.name().to_string(),
            succeeded: summary.succeeded,
            failed: summary.failed,
        });

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::node::Role;

    fn local_runner() -> MultiRunner {
        MultiRunner::new(Arc::new(LocalExecutorFactory), 4, Duration::from_secs(10))
    }

    fn nodes(n: usize) -> Vec<Node> {
        (0..n)
            .map(|i| Node::new("127.0.0.1", 2200 + u16::try_from(i).unwrap()).with_role(Role::Agent))
            .collect()
    }

    #[tokio::test]
    async fn test_failure_stops_chain_but_runs_cleanup() {
        let mut main = Chain::new("main");
        main.add_execute(["true"], "first")
            .add_execute(["exit", "3"], "fails")
            .add_execute(["true"], "never runs");
        let mut next = Chain::new("next");
        next.add_execute(["true"], "skipped chain");
        let mut cleanup = Chain::new("cleanup");
        cleanup.add_execute(["true"], "cleanup");
        let phase = Arc::new(Phase::new("test").with_chain(main).with_chain(next).with_cleanup(cleanup));

        let results = local_runner()
            .run(phase, nodes(1), RunSettings::default())
            .await
            .unwrap();

        let labels: Vec<_> = results[0].outcomes.iter().map(|o| o.stage.as_str()).collect();
        assert_eq!(labels, vec!["first", "fails", "cleanup"]);
        assert_eq!(results[0].status, HostStatus::Failed);
        assert_eq!(results[0].failed_stage().unwrap().exit_code, 3);
    }

    #[tokio::test]
    async fn test_best_effort_chain_continues() {
        let mut stale = Chain::best_effort("stale");
        stale
            .add_execute(["exit", "1"], "may fail")
            .add_execute(["true"], "still runs");
        let mut main = Chain::new("main");
        main.add_execute(["true"], "main");
        let phase = Arc::new(Phase::new("test").with_chain(stale).with_chain(main));

        let results = local_runner()
            .run(phase, nodes(1), RunSettings::default())
            .await
            .unwrap();

        assert_eq!(results[0].outcomes.len(), 3);
        assert!(results[0].outcomes[0].tolerated);
        assert!(results[0].is_success());
    }

    #[tokio::test]
    async fn test_results_in_input_order() {
        let mut chain = Chain::new("main");
        chain.add_execute(["true"], "noop");
        let phase = Arc::new(Phase::new("test").with_chain(chain));
        let input = nodes(6);

        let results = MultiRunner::new(Arc::new(LocalExecutorFactory), 2, Duration::from_secs(10))
            .run(phase, input.clone(), RunSettings::default())
            .await
            .unwrap();

        let hosts: Vec<_> = results.iter().map(|r| r.host.clone()).collect();
        let expected: Vec<_> = input.iter().map(Node::key).collect();
        assert_eq!(hosts, expected);
    }

    #[tokio::test]
    async fn test_state_file_has_top_level_fields() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::for_phase(dir.path(), "test");
        let mut chain = Chain::new("main");
        chain.add_execute(["echo", "hi"], "greet");
        let phase = Arc::new(Phase::new("test").with_chain(chain));

        let mut extra = Map::new();
        extra.insert("total_masters".to_string(), Value::from(1));
        extra.insert("total_agents".to_string(), Value::from(2));
        let settings = RunSettings {
            state_file: Some(file.clone()),
            resume: false,
            extra_fields: extra,
        };

        local_runner().run(phase, nodes(2), settings).await.unwrap();

        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(raw["total_masters"], 1);
        assert_eq!(raw["total_agents"], 2);
        assert_eq!(raw["total_hosts"], 2);
        assert_eq!(raw["chain_name"], "test");
        assert_eq!(raw["hosts"]["127.0.0.1:2200"]["host_status"], "success");
        assert_eq!(
            raw["hosts"]["127.0.0.1:2201"]["commands"][0]["stdout"].as_str().unwrap().trim(),
            "hi"
        );
        assert!(file.read().is_finished());
    }

    #[tokio::test]
    async fn test_resume_keeps_foreign_records_and_final_state() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::for_phase(dir.path(), "test");
        let foreign = serde_json::json!({
            "host_status": "success",
            "commands": [{"cmd": ["sudo", "true"], "returncode": 0}]
        });
        std::fs::write(
            file.path(),
            serde_json::json!({"hosts": {"10.0.0.9:22": foreign.clone()}, "total_hosts": 5})
                .to_string(),
        )
        .unwrap();

        let mut chain = Chain::new("main");
        chain
            .add_execute(["true"], "one")
            .add_execute(["true"], "two")
            .add_execute(["true"], "three");
        let phase = Arc::new(Phase::new("test").with_chain(chain));
        let settings = RunSettings {
            state_file: Some(file.clone()),
            resume: true,
            extra_fields: Map::new(),
        };

        local_runner().run(phase, nodes(4), settings).await.unwrap();

        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(raw["hosts"]["10.0.0.9:22"], foreign);
        let state = file.read();
        assert_eq!(state.count(HostStatus::Success), 5);
        for node in nodes(4) {
            assert_eq!(state.host_status(&node.key()), Some(HostStatus::Success));
            assert_eq!(raw["hosts"][node.key()]["commands"].as_array().unwrap().len(), 3);
        }
    }

    #[tokio::test]
    async fn test_copy_stage_through_local_transport() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("payload");
        std::fs::write(&source, "data").unwrap();
        let target = dir.path().join("out/payload");

        let mut chain = Chain::new("main");
        chain.add_copy(&source, target.to_str().unwrap(), "Copying payload");
        let phase = Arc::new(Phase::new("test").with_chain(chain));

        let results = local_runner()
            .run(phase, nodes(1), RunSettings::default())
            .await
            .unwrap();

        assert!(results[0].is_success());
        assert_eq!(results[0].outcomes[0].command[0], "copy");
        assert!(Path::new(&target).is_file());
    }

    #[tokio::test]
    async fn test_events_published() {
        let runner = local_runner();
        let mut events = runner.subscribe();
        let mut chain = Chain::new("main");
        chain.add_execute(["true"], "noop");
        let phase = Arc::new(Phase::new("evented").with_chain(chain));

        runner.run(phase, nodes(1), RunSettings::default()).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(RunEvent::PhaseStarted { hosts: 1, .. })));
        assert!(matches!(
            seen.last(),
            Some(RunEvent::PhaseFinished {
                succeeded: 1,
                failed: 0,
                ..
            })
        ));
    }
}
