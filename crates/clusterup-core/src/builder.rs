//! Chain construction for every cluster phase
//!
//! Builders only read local files to check preconditions. They never contact
//! a host; everything remote is described as [`Chain`]s.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, error};

use crate::artifacts::{ArtifactLayout, INSTALL_SCRIPT_NAME};
use crate::chain::{Chain, Phase};
use crate::error::CoreError;
use crate::node::Node;
use crate::scripts::{
    INSTALL_PREREQS_SCRIPT, POLL_ATTEMPTS, POLL_INTERVAL_SECS, PREREQS_MARKER, check_command,
    health_poll, poll_budget,
};

/// Scratch directory created on every host for the duration of a phase
pub const REMOTE_TEMP_DIR: &str = "/opt/dcos_install_tmp";

/// Directories a cluster installation leaves behind
pub const INSTALL_DIRS: [&str; 2] = ["/opt/mesosphere", "/etc/mesosphere"];

const PKGPANDA: &str = "/opt/mesosphere/bin/pkgpanda";

/// Extra time granted to a poll stage on top of its sleep budget, covering
/// the check invocations themselves
const POLL_TIMEOUT_SLACK: Duration = Duration::from_secs(300);

pub const PREFLIGHT: &str = "preflight";
pub const DEPLOY: &str = "deploy";
pub const POSTFLIGHT: &str = "postflight";
pub const CLUSTER_POSTFLIGHT: &str = "cluster_postflight";
pub const UNINSTALL: &str = "uninstall";
pub const INSTALL_PREREQS: &str = "install_prereqs";

/// Create the temp dir and hand it to the SSH user
pub fn add_pre_action(chain: &mut Chain, ssh_user: &str) {
    chain
        .add_execute(["sudo", "mkdir", "-p", REMOTE_TEMP_DIR], "Creating temp directory")
        .add_execute(
            ["sudo", "chown", ssh_user, REMOTE_TEMP_DIR],
            format!("Ensuring {ssh_user} owns temporary directory"),
        );
}

pub fn add_post_action(chain: &mut Chain) {
    chain.add_execute(
        ["sudo", "rm", "-rf", REMOTE_TEMP_DIR],
        "Cleaning up temporary directory",
    );
}

fn cleanup_chain(name: &str) -> Chain {
    let mut chain = Chain::new(name);
    add_post_action(&mut chain);
    chain
}

/// Append the prerequisite installation stages
pub fn add_prereqs(chain: &mut Chain) {
    chain
        .add_execute(["echo", "INSTALL", "PREREQUISITES"], "Installing prerequisites")
        .add_execute([INSTALL_PREREQS_SCRIPT], "Installing preflight prerequisites");
}

/// How preflight treats host prerequisites
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreflightOptions {
    /// Hosts cannot reach package repositories
    pub offline: bool,
    /// Prerequisites were already handled by the caller
    pub skip_prereqs: bool,
}

impl PreflightOptions {
    #[must_use]
    pub fn installs_prereqs(self) -> bool {
        !self.offline && !self.skip_prereqs
    }
}

/// Preflight: optional prerequisites, then run the install script in
/// preflight-only mode
///
/// # Errors
/// `MissingArtifact` if `script` does not exist locally
pub fn preflight_phase(
    script: &Path,
    ssh_user: &str,
    options: PreflightOptions,
) -> Result<Phase, CoreError> {
    if !script.is_file() {
        error!(
            path = %script.display(),
            "preflight script does not exist, run genconf before executing preflight"
        );
        return Err(CoreError::MissingArtifact(script.to_path_buf()));
    }

    let mut chain = Chain::new(PREFLIGHT);
    if options.installs_prereqs() {
        add_prereqs(&mut chain);
    } else {
        debug!(?options, "skipping prerequisite installation");
    }

    let file_name = script
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| INSTALL_SCRIPT_NAME.to_string());
    let remote_script = format!("{REMOTE_TEMP_DIR}/{file_name}");

    add_pre_action(&mut chain, ssh_user);
    chain
        .add_copy(script, remote_script.as_str(), "Copying preflight script")
        .add_execute(
            ["sudo", "bash", remote_script.as_str(), "--preflight-only", "master"],
            "Executing preflight check",
        );

    Ok(Phase::new(PREFLIGHT)
        .with_chain(chain)
        .with_cleanup(cleanup_chain("preflight_cleanup")))
}

fn install_argv(node: &Node) -> Vec<String> {
    let param = node
        .install_param()
        .or_else(|| node.role().map(|r| r.install_param()))
        .unwrap_or_default();
    vec![
        "sudo".to_string(),
        "bash".to_string(),
        format!("{REMOTE_TEMP_DIR}/{INSTALL_SCRIPT_NAME}"),
        param.to_string(),
    ]
}

fn install_label(_node: &Node) -> String {
    "Installing DC/OS".to_string()
}

/// Best-effort removal of a previous installation
fn remove_stale_chain() -> Chain {
    let mut chain = Chain::best_effort("remove_stale_dcos");
    chain
        .add_execute(["sudo", "-i", PKGPANDA, "uninstall"], "Trying pkgpanda uninstall")
        .add_execute(
            ["sudo", "rm", "-rf", INSTALL_DIRS[0], INSTALL_DIRS[1]],
            "Removing DC/OS files",
        );
    chain
}

/// Install: ship the install script, packages and bootstrap bundle, then run
/// the installer with each node's role parameter
///
/// # Errors
/// `MissingEnv`/`MissingBootstrap` for the bootstrap bundle, `MissingArtifact`
/// for the install script or package manifest, `PackageCopyError` for a
/// package file listed in the manifest but absent locally
pub fn install_phase(
    layout: &ArtifactLayout,
    ssh_user: &str,
    remove_stale: bool,
) -> Result<Phase, CoreError> {
    let bootstrap = layout.locate_bootstrap()?;

    let install_script = layout.install_script();
    if !install_script.is_file() {
        error!(path = %install_script.display(), "install script not found");
        return Err(CoreError::MissingArtifact(install_script));
    }

    let mut phase = Phase::new(DEPLOY);
    if remove_stale {
        phase = phase.with_chain(remove_stale_chain());
    }

    let mut chain = Chain::new(DEPLOY);
    add_pre_action(&mut chain, ssh_user);
    chain.add_copy(
        &install_script,
        format!("{REMOTE_TEMP_DIR}/{INSTALL_SCRIPT_NAME}"),
        format!("Copying {INSTALL_SCRIPT_NAME}"),
    );

    for artifact in layout.locate_packages()? {
        if !artifact.local_path.is_file() {
            error!(
                package = %artifact.package,
                path = %artifact.local_path.display(),
                "package file not found"
            );
            return Err(CoreError::PackageCopyError {
                package: artifact.package,
                path: artifact.local_path,
            });
        }

        let remote_dir = format!("{REMOTE_TEMP_DIR}/packages/{}", artifact.package);
        let file_name = artifact
            .local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| artifact.package.clone());
        chain
            .add_execute(["mkdir", "-p", remote_dir.as_str()], "Creating package directory")
            .add_copy(
                &artifact.local_path,
                format!("{remote_dir}/{file_name}"),
                "Copying packages",
            );
    }

    let remote_bootstrap_dir = format!("{REMOTE_TEMP_DIR}/bootstrap");
    let bootstrap_name = bootstrap
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    chain
        .add_execute(["mkdir", "-p", remote_bootstrap_dir.as_str()], "Creating directory")
        .add_copy(
            &bootstrap,
            format!("{remote_bootstrap_dir}/{bootstrap_name}"),
            "Copying bootstrap",
        )
        .add_execute_per_node(install_argv, install_label);

    Ok(phase
        .with_chain(chain)
        .with_cleanup(cleanup_chain("deploy_cleanup")))
}

fn poll_chain(name: &str, check_type: &str, label: &str) -> Chain {
    let mut chain = Chain::new(name);
    chain.add_execute_with_timeout(
        [health_poll(&check_command(check_type), POLL_ATTEMPTS, POLL_INTERVAL_SECS)],
        label,
        poll_budget(POLL_ATTEMPTS, POLL_INTERVAL_SECS) + POLL_TIMEOUT_SLACK,
    );
    chain
}

/// The two postflight runs: per-node checks on every node, and the
/// cluster-wide check on a single node
#[derive(Debug, Clone)]
pub struct Postflight {
    pub node: Phase,
    pub cluster: Phase,
}

#[must_use]
pub fn postflight_phases() -> Postflight {
    let mut marker = Chain::new("postflight_cleanup");
    marker.add_execute(["sudo", "rm", "-f", PREREQS_MARKER], "Removing prerequisites flag");

    Postflight {
        node: Phase::new(POSTFLIGHT)
            .with_chain(poll_chain(
                POSTFLIGHT,
                "node-poststart",
                "Executing node postflight checks",
            ))
            .with_chain(marker),
        cluster: Phase::new(CLUSTER_POSTFLIGHT).with_chain(poll_chain(
            CLUSTER_POSTFLIGHT,
            "cluster",
            "Executing cluster postflight checks",
        )),
    }
}

#[must_use]
pub fn uninstall_phase() -> Phase {
    let mut chain = Chain::new(UNINSTALL);
    chain.add_execute(
        [
            "sudo",
            "-i",
            PKGPANDA,
            "uninstall",
            "&&",
            "sudo",
            "rm",
            "-rf",
            "/opt/mesosphere/",
        ],
        "Uninstalling DC/OS",
    );
    Phase::new(UNINSTALL).with_chain(chain)
}

#[must_use]
pub fn prereqs_phase() -> Phase {
    let mut chain = Chain::new(INSTALL_PREREQS);
    add_prereqs(&mut chain);
    Phase::new(INSTALL_PREREQS).with_chain(chain)
}
