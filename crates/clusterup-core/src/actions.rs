//! One entry point per phase
//!
//! Each action resolves its targets, builds the phase, and hands both to the
//! [`PhaseRunner`]. Local preconditions (missing artifacts, unknown hosts) are
//! reported before any node is contacted.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::artifacts::ArtifactLayout;
use crate::builder::{
    DEPLOY, PreflightOptions, install_phase, postflight_phases, preflight_phase, prereqs_phase,
    uninstall_phase,
};
use crate::config::ResolvedConfig;
use crate::driver::ChainDriver;
use crate::error::CoreError;
use crate::node::{Node, count_by_role, install_targets, resolve_nodes};
use crate::runner::{PhaseRunner, RunOutcome, RunRequest};
use crate::state::StateFile;

/// Options for the install phase
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Restrict the run to these hosts; all install targets when empty
    pub hosts: Vec<String>,
    /// Rerun `hosts` against the previous run's state file
    pub retry: bool,
    /// Remove any existing installation first
    pub remove_stale: bool,
}

/// Cluster operations over one resolved configuration
pub struct ClusterActions {
    config: ResolvedConfig,
    layout: ArtifactLayout,
    runner: PhaseRunner,
}

impl ClusterActions {
    pub fn new(config: ResolvedConfig, layout: ArtifactLayout, driver: Arc<dyn ChainDriver>) -> Self {
        Self {
            config,
            layout,
            runner: PhaseRunner::new(driver),
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Every configured node, role-tagged
    ///
    /// # Errors
    /// Returns `CoreError::ConfigError` for a malformed host string
    pub fn nodes(&self) -> Result<Vec<Node>, CoreError> {
        resolve_nodes(&self.config)
    }

    fn role_fields(&self) -> Map<String, Value> {
        count_by_role(&self.config).to_fields()
    }

    /// Run the install script in preflight-only mode on every node
    ///
    /// `script` defaults to the layout's install script.
    ///
    /// # Errors
    /// `MissingArtifact` if the script is absent; driver errors when blocking
    pub async fn preflight(
        &self,
        script: Option<&Path>,
        options: PreflightOptions,
        request: &RunRequest,
    ) -> Result<RunOutcome, CoreError> {
        let default_script = self.layout.install_script();
        let script = script.unwrap_or(&default_script);
        let phase = preflight_phase(script, &self.config.ssh.user, options)?;
        let nodes = self.nodes()?;
        self.runner
            .run(phase, nodes, request, self.role_fields())
            .await
    }

    /// Install on every node, or on `options.hosts`
    ///
    /// With `retry` and a state directory the run resumes the previous
    /// `deploy` state file. Hosts named in `options.hosts` are dropped from it
    /// first and its recorded `total_hosts` is kept; other records are left
    /// alone.
    ///
    /// # Errors
    /// Artifact errors from the builder; `ConfigError` for a host not in the
    /// configuration; driver errors when blocking
    pub async fn install(
        &self,
        options: &InstallOptions,
        request: &RunRequest,
    ) -> Result<RunOutcome, CoreError> {
        let phase = install_phase(&self.layout, &self.config.ssh.user, options.remove_stale)?;
        let targets = self.select(install_targets(&self.config)?, &options.hosts)?;

        let mut extra = self.role_fields();
        let mut request = request.clone();
        if options.retry {
            match &request.state_dir {
                Some(dir) => {
                    let state_file = StateFile::for_phase(dir, DEPLOY);
                    if options.hosts.is_empty() {
                        info!(path = %state_file.path().display(), "retrying install on every host");
                    } else {
                        let keys: Vec<String> = targets.iter().map(Node::key).collect();
                        if let Some(total) = state_file.prepare_retry(&keys) {
                            extra.insert("total_hosts".to_string(), Value::from(total));
                        }
                        info!(hosts = ?keys, path = %state_file.path().display(), "retrying install");
                    }
                    request.resume = true;
                }
                None => warn!("retry requested without a state directory, nothing to resume"),
            }
        }

        self.runner.run(phase, targets, &request, extra).await
    }

    /// Node health checks on every node, then the cluster check on the first
    ///
    /// When blocking the cluster check starts after the node checks finish;
    /// otherwise both are detached and two handles are returned.
    ///
    /// # Errors
    /// `ConfigError` if there are no nodes; driver errors when blocking
    pub async fn postflight(&self, request: &RunRequest) -> Result<RunOutcome, CoreError> {
        let phases = postflight_phases();
        let nodes = self.nodes()?;
        let first = nodes
            .first()
            .cloned()
            .ok_or_else(|| CoreError::ConfigError("no nodes to run postflight on".to_string()))?;

        let node_run = self
            .runner
            .run(phases.node, nodes, request, self.role_fields())
            .await?;
        let cluster_run = self
            .runner
            .run(phases.cluster, vec![first], request, Map::new())
            .await?;
        Ok(node_run.chain(cluster_run))
    }

    /// Remove the installation from every node
    ///
    /// # Errors
    /// Driver errors when blocking
    pub async fn uninstall(&self, request: &RunRequest) -> Result<RunOutcome, CoreError> {
        let nodes = self.nodes()?;
        self.runner
            .run(uninstall_phase(), nodes, request, Map::new())
            .await
    }

    /// Install host prerequisites on every node
    ///
    /// # Errors
    /// Driver errors when blocking
    pub async fn install_prereqs(&self, request: &RunRequest) -> Result<RunOutcome, CoreError> {
        let nodes = self.nodes()?;
        self.runner
            .run(prereqs_phase(), nodes, request, Map::new())
            .await
    }

    /// Keep the nodes named in `hosts`, in configuration order
    fn select(&self, nodes: Vec<Node>, hosts: &[String]) -> Result<Vec<Node>, CoreError> {
        if hosts.is_empty() {
            return Ok(nodes);
        }

        let mut wanted = HashSet::new();
        for host in hosts {
            let key = Node::parse(host, self.config.ssh.port)?.key();
            if !nodes.iter().any(|node| node.key() == key) {
                return Err(CoreError::ConfigError(format!(
                    "host {host} is not part of the configured cluster"
                )));
            }
            wanted.insert(key);
        }

        Ok(nodes
            .into_iter()
            .filter(|node| wanted.contains(&node.key()))
            .collect())
    }
}
