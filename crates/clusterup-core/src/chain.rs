//! Chains: ordered, network-free descriptions of remote work
//!
//! A [`Chain`] is a named list of [`Stage`]s. A [`Phase`] groups the chains
//! run together plus a cleanup chain the driver runs on every node no matter
//! how the main chains ended.

use std::path::PathBuf;
use std::time::Duration;

use crate::node::Node;

/// A value fixed for the whole chain, or computed from the executing node
#[derive(Debug, Clone)]
pub enum NodeValue<T> {
    Fixed(T),
    PerNode(fn(&Node) -> T),
}

impl<T: Clone> NodeValue<T> {
    pub fn resolve(&self, node: &Node) -> T {
        match self {
            NodeValue::Fixed(value) => value.clone(),
            NodeValue::PerNode(f) => f(node),
        }
    }
}

/// One remote operation
#[derive(Debug, Clone)]
pub enum Stage {
    Execute {
        argv: NodeValue<Vec<String>>,
        label: NodeValue<String>,
        /// Overrides the run's process timeout
        timeout: Option<Duration>,
    },
    Copy {
        local_path: PathBuf,
        remote_path: String,
        label: String,
    },
}

impl Stage {
    /// Display label as seen for `node`
    pub fn label_for(&self, node: &Node) -> String {
        match self {
            Stage::Execute { label, .. } => label.resolve(node),
            Stage::Copy { label, .. } => label.clone(),
        }
    }
}

/// Named, ordered sequence of stages
#[derive(Debug, Clone)]
pub struct Chain {
    name: String,
    stages: Vec<Stage>,
    best_effort: bool,
}

fn to_argv<I, S>(argv: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    argv.into_iter().map(Into::into).collect()
}

impl Chain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            best_effort: false,
        }
    }

    /// A chain whose failures are recorded but neither stop the node nor fail it
    pub fn best_effort(name: impl Into<String>) -> Self {
        Self {
            best_effort: true,
            ..Self::new(name)
        }
    }

    pub fn add_execute<I, S>(&mut self, argv: I, label: impl Into<String>) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stages.push(Stage::Execute {
            argv: NodeValue::Fixed(to_argv(argv)),
            label: NodeValue::Fixed(label.into()),
            timeout: None,
        });
        self
    }

    pub fn add_execute_with_timeout<I, S>(
        &mut self,
        argv: I,
        label: impl Into<String>,
        timeout: Duration,
    ) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stages.push(Stage::Execute {
            argv: NodeValue::Fixed(to_argv(argv)),
            label: NodeValue::Fixed(label.into()),
            timeout: Some(timeout),
        });
        self
    }

    /// Execute stage whose command and label depend on the node running it
    pub fn add_execute_per_node(
        &mut self,
        argv: fn(&Node) -> Vec<String>,
        label: fn(&Node) -> String,
    ) -> &mut Self {
        self.stages.push(Stage::Execute {
            argv: NodeValue::PerNode(argv),
            label: NodeValue::PerNode(label),
            timeout: None,
        });
        self
    }

    pub fn add_copy(
        &mut self,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        label: impl Into<String>,
    ) -> &mut Self {
        self.stages.push(Stage::Copy {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            label: label.into(),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn is_best_effort(&self) -> bool {
        self.best_effort
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Chains run together against one node set
#[derive(Debug, Clone)]
pub struct Phase {
    name: String,
    chains: Vec<Chain>,
    cleanup: Option<Chain>,
}

impl Phase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chains: Vec::new(),
            cleanup: None,
        }
    }

    #[must_use]
    pub fn with_chain(mut self, chain: Chain) -> Self {
        self.chains.push(chain);
        self
    }

    /// Chain run on every node after the main chains, even after a failure
    #[must_use]
    pub fn with_cleanup(mut self, chain: Chain) -> Self {
        self.cleanup = Some(chain);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    pub fn cleanup(&self) -> Option<&Chain> {
        self.cleanup.as_ref()
    }

    /// Main chains followed by the cleanup chain
    pub fn all_chains(&self) -> impl Iterator<Item = &Chain> {
        self.chains.iter().chain(self.cleanup.iter())
    }

    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.all_chains().find(|c| c.name() == name)
    }
}
