//! clusterup-core: phase building and multi-host execution
//!
//! Resolves cluster nodes from configuration, builds the command chains of
//! each installer phase, and drives them across nodes in parallel while
//! persisting per-host progress for retry.

pub mod actions;
pub mod artifacts;
pub mod builder;
pub mod chain;
pub mod config;
pub mod driver;
pub mod error;
pub mod node;
pub mod runner;
pub mod scripts;
pub mod state;

pub use actions::{ClusterActions, InstallOptions};
pub use artifacts::{ArtifactLayout, PackageArtifact};
pub use builder::{PreflightOptions, Postflight};
pub use chain::{Chain, NodeValue, Phase, Stage};
pub use config::{ClusterConfig, ResolvedConfig, SshSettings};
pub use driver::{
    ChainDriver, ExecutorFactory, LocalExecutorFactory, MultiRunner, RunSettings,
    SshExecutorFactory,
};
pub use error::CoreError;
pub use node::{Node, Role, RoleCounts, count_by_role, install_targets, resolve_nodes};
pub use runner::{PhaseRunner, RunHandle, RunOutcome, RunRequest};
pub use state::StateFile;
