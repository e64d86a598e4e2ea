use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use clusterup_api::{HostStatus, NodeResult};
use clusterup_core::scripts::health_poll;
use clusterup_core::*;
use clusterup_exec::{CommandResult, ExecError, RemoteExecutor};

// Mock transport: records every command per host, fails commands matching a
// (host, needle) pair, and tracks how many commands run at once.
#[derive(Default)]
struct Calls {
    log: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Calls {
    fn for_host(&self, host: &str) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<_> = self.log.lock().unwrap().iter().map(|(h, _)| h.clone()).collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }
}

struct MockExecutor {
    host: String,
    calls: Arc<Calls>,
    failures: Arc<Vec<(String, String)>>,
    delay: Duration,
}

impl MockExecutor {
    async fn respond(&self, command: String) -> CommandResult {
        let now = self.calls.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.calls.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failed = self
            .failures
            .iter()
            .any(|(host, needle)| *host == self.host && command.contains(needle.as_str()));
        self.calls.log.lock().unwrap().push((self.host.clone(), command));

        CommandResult {
            status: i32::from(failed),
            stdout: String::new(),
            stderr: if failed { "boom".to_string() } else { String::new() },
            duration: self.delay,
        }
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn run_with_timeout(
        &self,
        cmd: &str,
        _timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        Ok(self.respond(cmd.to_string()).await)
    }

    async fn copy(
        &self,
        _local_path: &Path,
        remote_path: &str,
        _timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        Ok(self.respond(format!("copy {remote_path}")).await)
    }

    fn executor_type(&self) -> &'static str {
        "mock"
    }
}

struct MockFactory {
    calls: Arc<Calls>,
    failures: Arc<Vec<(String, String)>>,
    delay: Duration,
}

impl MockFactory {
    fn new(failures: &[(&str, &str)]) -> Self {
        Self {
            calls: Arc::new(Calls::default()),
            failures: Arc::new(
                failures
                    .iter()
                    .map(|(h, n)| ((*h).to_string(), (*n).to_string()))
                    .collect(),
            ),
            delay: Duration::from_millis(5),
        }
    }
}

impl ExecutorFactory for MockFactory {
    fn executor_for(&self, node: &Node) -> Result<Arc<dyn RemoteExecutor>, ExecError> {
        Ok(Arc::new(MockExecutor {
            host: node.key(),
            calls: self.calls.clone(),
            failures: self.failures.clone(),
            delay: self.delay,
        }))
    }
}

fn config(masters: &[&str], agents: &[&str], public_agents: &[&str], parallelism: usize) -> ResolvedConfig {
    let list = |hosts: &[&str]| Some(hosts.iter().map(ToString::to_string).collect());
    ClusterConfig {
        master_list: list(masters),
        agent_list: list(agents),
        public_agent_list: list(public_agents),
        ssh_user: Some("centos".to_string()),
        ssh_parallelism: Some(parallelism),
        ..ClusterConfig::default()
    }
    .resolve()
    .unwrap()
}

/// Serve directory with an install script, one package and a bootstrap tarball
fn artifacts(root: &Path) -> ArtifactLayout {
    let serve_dir = root.join("serve");
    let bootstrap_dir = serve_dir.join("bootstrap");
    std::fs::create_dir_all(&bootstrap_dir).unwrap();
    std::fs::write(serve_dir.join("dcos_install.sh"), "#!/bin/sh\n").unwrap();
    std::fs::write(bootstrap_dir.join("abc123.bootstrap.tar.xz"), "tarball").unwrap();
    std::fs::create_dir_all(serve_dir.join("packages/mesos")).unwrap();
    std::fs::write(serve_dir.join("packages/mesos/mesos--1.tar.xz"), "pkg").unwrap();

    let manifest = root.join("cluster_packages.json");
    std::fs::write(
        &manifest,
        json!({"mesos--1": {"filename": "packages/mesos/mesos--1.tar.xz"}}).to_string(),
    )
    .unwrap();

    ArtifactLayout {
        serve_dir,
        bootstrap_dir,
        cluster_packages_path: manifest,
        bootstrap_id: Some("abc123".to_string()),
    }
}

fn actions_with(
    config: ResolvedConfig,
    layout: ArtifactLayout,
    factory: MockFactory,
) -> (ClusterActions, Arc<Calls>) {
    let calls = factory.calls.clone();
    let driver = MultiRunner::from_settings(&config.ssh, Arc::new(factory));
    (ClusterActions::new(config, layout, Arc::new(driver)), calls)
}

fn by_host<'a>(results: &'a [NodeResult], host: &str) -> &'a NodeResult {
    results.iter().find(|r| r.host == host).unwrap()
}

async fn completed(outcome: Result<RunOutcome, CoreError>) -> Vec<NodeResult> {
    match outcome.unwrap() {
        RunOutcome::Completed(results) => results,
        RunOutcome::Detached(_) => panic!("expected a blocking run"),
    }
}

#[tokio::test]
async fn test_install_failure_isolated_and_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    let (actions, calls) = actions_with(
        config(&["10.0.0.1"], &["10.0.0.2"], &["10.0.0.3"], 20),
        artifacts(dir.path()),
        MockFactory::new(&[("10.0.0.2:22", "dcos_install.sh slave")]),
    );

    let results = completed(
        actions
            .install(&InstallOptions::default(), &RunRequest::blocking())
            .await,
    )
    .await;

    assert_eq!(results.len(), 3);
    assert_eq!(by_host(&results, "10.0.0.1:22").status, HostStatus::Success);
    assert_eq!(by_host(&results, "10.0.0.3:22").status, HostStatus::Success);

    let failed = by_host(&results, "10.0.0.2:22");
    assert_eq!(failed.status, HostStatus::Failed);
    assert_eq!(failed.failed_stage().unwrap().stage, "Installing DC/OS");

    // cleanup still ran on the failed node
    let commands = calls.for_host("10.0.0.2:22");
    assert_eq!(
        commands.last().unwrap(),
        "sudo rm -rf /opt/dcos_install_tmp"
    );
}

#[tokio::test]
async fn test_install_passes_role_parameter() {
    let dir = tempfile::tempdir().unwrap();
    let (actions, calls) = actions_with(
        config(&["10.0.0.1"], &["10.0.0.2"], &["10.0.0.3"], 20),
        artifacts(dir.path()),
        MockFactory::new(&[]),
    );

    completed(
        actions
            .install(&InstallOptions::default(), &RunRequest::blocking())
            .await,
    )
    .await;

    for (host, param) in [
        ("10.0.0.1:22", "master"),
        ("10.0.0.2:22", "slave"),
        ("10.0.0.3:22", "slave_public"),
    ] {
        let expected = format!("sudo bash /opt/dcos_install_tmp/dcos_install.sh {param}");
        assert!(calls.for_host(host).contains(&expected), "{host} missing {expected}");
    }
}

#[tokio::test]
async fn test_parallelism_bound_respected() {
    let dir = tempfile::tempdir().unwrap();
    let agents = ["10.0.1.1", "10.0.1.2", "10.0.1.3", "10.0.1.4", "10.0.1.5"];
    let (actions, calls) = actions_with(
        config(&["10.0.0.1"], &agents, &[], 2),
        artifacts(dir.path()),
        MockFactory::new(&[]),
    );

    let results = completed(actions.uninstall(&RunRequest::blocking()).await).await;

    assert_eq!(results.len(), 6);
    assert!(results.iter().all(NodeResult::is_success));
    assert!(calls.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_state_file_carries_role_counts() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    std::fs::create_dir_all(&state_dir).unwrap();
    let (actions, _calls) = actions_with(
        config(&["10.0.0.1"], &["10.0.0.2"], &["10.0.0.3"], 20),
        artifacts(dir.path()),
        MockFactory::new(&[]),
    );

    completed(
        actions
            .install(
                &InstallOptions::default(),
                &RunRequest::blocking().with_state_dir(&state_dir),
            )
            .await,
    )
    .await;

    let raw: Value =
        serde_json::from_str(&std::fs::read_to_string(state_dir.join("deploy.json")).unwrap())
            .unwrap();
    assert_eq!(raw["total_masters"], 1);
    assert_eq!(raw["total_agents"], 2);
    assert_eq!(raw["total_hosts"], 3);
    assert_eq!(raw["chain_name"], "deploy");
    assert_eq!(raw["hosts"]["10.0.0.3:22"]["tags"]["dcos_install_param"], "slave_public");
    assert_eq!(raw["hosts"]["10.0.0.3:22"]["host_status"], "success");
}

#[tokio::test]
async fn test_install_retry_resumes_state() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    std::fs::create_dir_all(&state_dir).unwrap();
    let request = RunRequest::blocking().with_state_dir(&state_dir);

    // first run: one agent fails
    let (actions, _calls) = actions_with(
        config(&["10.0.0.1"], &["10.0.0.2", "10.0.0.3"], &[], 20),
        artifacts(dir.path()),
        MockFactory::new(&[("10.0.0.3:22", "dcos_install.sh slave")]),
    );
    completed(actions.install(&InstallOptions::default(), &request).await).await;
    let state = StateFile::for_phase(&state_dir, "deploy").read();
    assert_eq!(state.count(HostStatus::Failed), 1);

    // retry only the failed agent
    let (actions, calls) = actions_with(
        config(&["10.0.0.1"], &["10.0.0.2", "10.0.0.3"], &[], 20),
        artifacts(dir.path()),
        MockFactory::new(&[]),
    );
    let options = InstallOptions {
        hosts: vec!["10.0.0.3".to_string()],
        retry: true,
        remove_stale: false,
    };
    let results = completed(actions.install(&options, &request).await).await;

    assert_eq!(results.len(), 1);
    assert!(results[0].is_success());
    assert_eq!(calls.hosts(), vec!["10.0.0.3:22".to_string()]);

    let state = StateFile::for_phase(&state_dir, "deploy").read();
    assert_eq!(state.total_hosts, Some(3));
    assert_eq!(state.hosts.len(), 3);
    assert_eq!(state.count(HostStatus::Success), 3);
    assert!(state.is_finished());
}

/// Captures the state file as the driver first sees it
#[derive(Default)]
struct SnapshotDriver {
    seen: Mutex<Option<(Value, bool, serde_json::Map<String, Value>)>>,
}

#[async_trait]
impl ChainDriver for SnapshotDriver {
    async fn run(
        &self,
        _phase: Arc<Phase>,
        _nodes: Vec<Node>,
        settings: RunSettings,
    ) -> Result<Vec<NodeResult>, CoreError> {
        let doc = settings
            .state_file
            .map(|file| serde_json::from_slice(&std::fs::read(file.path()).unwrap()).unwrap())
            .unwrap_or(Value::Null);
        *self.seen.lock().unwrap() = Some((doc, settings.resume, settings.extra_fields));
        Ok(Vec::new())
    }
}

fn seeded_deploy_state(state_dir: &Path) -> Value {
    std::fs::create_dir_all(state_dir).unwrap();
    let doc = json!({
        "hosts": {
            "10.0.0.1:22": {"host_status": "success", "ip": "10.0.0.1"},
            "10.0.0.2:22": {"host_status": "success"},
            "10.0.0.3:22": {"host_status": "failed", "commands": [{"cmd": ["true"], "returncode": 1}]}
        },
        "total_hosts": 5
    });
    std::fs::write(state_dir.join("deploy.json"), doc.to_string()).unwrap();
    doc
}

#[tokio::test]
async fn test_retry_without_hosts_keeps_every_record() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let seeded = seeded_deploy_state(&state_dir);
    let driver = Arc::new(SnapshotDriver::default());
    let actions = ClusterActions::new(
        config(&["10.0.0.1"], &["10.0.0.2", "10.0.0.3"], &[], 20),
        artifacts(dir.path()),
        driver.clone(),
    );
    let options = InstallOptions {
        hosts: Vec::new(),
        retry: true,
        remove_stale: false,
    };

    completed(
        actions
            .install(&options, &RunRequest::blocking().with_state_dir(&state_dir))
            .await,
    )
    .await;

    let (doc, resume, extra) = driver.seen.lock().unwrap().take().unwrap();
    assert_eq!(doc, seeded);
    assert!(resume);
    assert!(!extra.contains_key("total_hosts"));
}

#[tokio::test]
async fn test_retry_drops_only_named_hosts() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    seeded_deploy_state(&state_dir);
    let driver = Arc::new(SnapshotDriver::default());
    let actions = ClusterActions::new(
        config(&["10.0.0.1"], &["10.0.0.2", "10.0.0.3"], &[], 20),
        artifacts(dir.path()),
        driver.clone(),
    );
    let options = InstallOptions {
        hosts: vec!["10.0.0.3".to_string()],
        retry: true,
        remove_stale: false,
    };

    completed(
        actions
            .install(&options, &RunRequest::blocking().with_state_dir(&state_dir))
            .await,
    )
    .await;

    let (doc, resume, extra) = driver.seen.lock().unwrap().take().unwrap();
    assert!(resume);
    assert_eq!(extra["total_hosts"], 5);
    assert_eq!(
        doc["hosts"],
        json!({
            "10.0.0.1:22": {"host_status": "success", "ip": "10.0.0.1"},
            "10.0.0.2:22": {"host_status": "success"}
        })
    );
}

#[tokio::test]
async fn test_retry_unknown_host_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (actions, calls) = actions_with(
        config(&["10.0.0.1"], &[], &[], 20),
        artifacts(dir.path()),
        MockFactory::new(&[]),
    );
    let options = InstallOptions {
        hosts: vec!["10.0.0.99".to_string()],
        retry: true,
        remove_stale: false,
    };

    let err = actions
        .install(&options, &RunRequest::blocking())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ConfigError(_)));
    assert!(calls.hosts().is_empty());
}

#[tokio::test]
async fn test_install_missing_bootstrap_contacts_no_node() {
    let dir = tempfile::tempdir().unwrap();
    let mut layout = artifacts(dir.path());
    layout.bootstrap_id = Some("other".to_string());
    let (actions, calls) = actions_with(
        config(&["10.0.0.1"], &[], &[], 20),
        layout,
        MockFactory::new(&[]),
    );

    let err = actions
        .install(&InstallOptions::default(), &RunRequest::blocking())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::MissingBootstrap { .. }));
    assert!(calls.hosts().is_empty());
}

#[tokio::test]
async fn test_postflight_cluster_check_on_first_node_only() {
    let dir = tempfile::tempdir().unwrap();
    let (actions, calls) = actions_with(
        config(&["10.0.0.1", "10.0.0.4"], &["10.0.0.2"], &[], 20),
        artifacts(dir.path()),
        MockFactory::new(&[]),
    );

    let results = completed(actions.postflight(&RunRequest::blocking()).await).await;

    // three node runs plus one cluster run
    assert_eq!(results.len(), 4);
    let cluster_checks: Vec<_> = calls
        .log
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, cmd)| cmd.contains("dcos-diagnostics check cluster"))
        .map(|(host, _)| host.clone())
        .collect();
    assert_eq!(cluster_checks, vec!["10.0.0.1:22".to_string()]);
    assert!(calls
        .for_host("10.0.0.2:22")
        .contains(&"sudo rm -f /opt/dcos-prereqs.installed".to_string()));
}

#[tokio::test]
async fn test_postflight_detached_returns_two_handles() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    std::fs::create_dir_all(&state_dir).unwrap();
    let (actions, _calls) = actions_with(
        config(&["10.0.0.1"], &["10.0.0.2"], &[], 20),
        artifacts(dir.path()),
        MockFactory::new(&[]),
    );

    let outcome = actions
        .postflight(&RunRequest::default().with_state_dir(&state_dir))
        .await
        .unwrap();
    let RunOutcome::Detached(handles) = outcome else {
        panic!("expected detached runs");
    };
    let phases: Vec<_> = handles.iter().map(|h| h.phase().to_string()).collect();
    assert_eq!(phases, vec!["postflight", "cluster_postflight"]);

    let mut total = 0;
    for handle in handles {
        total += handle.wait().await.unwrap().len();
    }
    assert_eq!(total, 3);
    assert!(StateFile::for_phase(&state_dir, "postflight").read().is_finished());
    assert!(StateFile::for_phase(&state_dir, "cluster_postflight").read().is_finished());
}

#[tokio::test]
async fn test_preflight_offline_skips_prereqs() {
    let dir = tempfile::tempdir().unwrap();
    let layout = artifacts(dir.path());
    let (actions, calls) = actions_with(
        config(&["10.0.0.1"], &[], &[], 20),
        layout,
        MockFactory::new(&[]),
    );

    let options = PreflightOptions {
        offline: true,
        skip_prereqs: false,
    };
    let results = completed(actions.preflight(None, options, &RunRequest::blocking()).await).await;

    assert!(results[0].is_success());
    let commands = calls.for_host("10.0.0.1:22");
    assert!(!commands.iter().any(|c| c.contains("INSTALL PREREQUISITES")));
    assert!(commands.contains(
        &"sudo bash /opt/dcos_install_tmp/dcos_install.sh --preflight-only master".to_string()
    ));
}

fn poll_phase(check: &str, attempts: u32) -> Phase {
    let mut chain = Chain::new("poll");
    chain.add_execute([health_poll(check, attempts, 0)], "Polling");
    Phase::new("poll").with_chain(chain)
}

#[tokio::test]
async fn test_health_poll_succeeds_after_failures() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("attempts");
    let counter = counter.display();
    let check = format!(
        "n=$(cat {counter} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {counter}; echo attempt $n; [ $n -ge 6 ]"
    );

    let driver = MultiRunner::new(Arc::new(LocalExecutorFactory), 1, Duration::from_secs(30));
    let results = driver
        .run(
            Arc::new(poll_phase(&check, 900)),
            vec![Node::new("127.0.0.1", 22)],
            RunSettings::default(),
        )
        .await
        .unwrap();

    assert!(results[0].is_success());
    assert_eq!(results[0].outcomes[0].stdout.trim(), "attempt 6");
}

#[tokio::test]
async fn test_health_poll_reports_last_failure() {
    let driver = MultiRunner::new(Arc::new(LocalExecutorFactory), 1, Duration::from_secs(30));
    let results = driver
        .run(
            Arc::new(poll_phase("echo down; exit 7", 3)),
            vec![Node::new("127.0.0.1", 22)],
            RunSettings::default(),
        )
        .await
        .unwrap();

    let outcome = &results[0].outcomes[0];
    assert_eq!(results[0].status, HostStatus::Failed);
    assert_eq!(outcome.exit_code, 7);
    assert_eq!(outcome.stdout.trim(), "down");
}
