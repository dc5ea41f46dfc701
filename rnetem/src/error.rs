//! Error types for the daemon core.

use std::io;

use crate::docker;

/// Errors surfaced by request-path operations.
///
/// Dependency failures are wrapped in [`Error::Context`] so every message
/// reads `unable to <verb> <subject> <name>: <cause>`. Teardown never
/// produces these: `Close` logs and keeps going.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Aggregated topology-document errors, rendered as an indented list.
    #[error("topology is not valid:{}", format_error_list(.0))]
    Validation(Vec<String>),

    /// Aggregated node-creation errors from a partial `Load`.
    #[error("unable to load the topology:{}", format_error_list(.0))]
    LoadErrors(Vec<String>),

    /// A dependency failure, annotated with the entity it concerns.
    #[error("unable to {verb} {subject} {name}: {source}")]
    Context {
        verb: &'static str,
        subject: &'static str,
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("node {0} not found in the topology")]
    NodeNotFound(String),

    #[error("no topology is loaded")]
    NotLoaded,

    #[error("node {0} is not running")]
    NodeNotRunning(String),

    #[error("interface {if_index} of node {node} is already attached")]
    InterfaceInUse { node: String, if_index: usize },

    #[error("host interface {0} not found in the root namespace")]
    HostInterfaceNotFound(String),

    #[error("interface {0} not found")]
    InterfaceNotFound(String),

    #[error("copying between containers is not supported")]
    CopyBetweenContainers,

    #[error("a container must be specified on one side of the copy")]
    CopyWithoutContainer,

    #[error("node {0} does not support copy")]
    CopyUnsupported(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("netlink error: {0}")]
    RtNetlink(#[from] rtnetlink::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("docker error: {0}")]
    Docker(#[from] docker::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("namespace worker dropped its result channel")]
    NamespaceWorkerGone,
}

impl Error {
    /// Wrap a dependency failure with the verb/subject/name of the operation
    /// that hit it.
    pub fn context<E>(verb: &'static str, subject: &'static str, name: impl Into<String>) -> impl FnOnce(E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let name = name.into();
        move |source| Self::Context { verb, subject, name, source: Box::new(source) }
    }
}

fn format_error_list(errors: &[String]) -> String {
    let mut out = String::new();
    for error in errors {
        out.push_str("\n\t");
        out.push_str(error);
    }
    out
}

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_render_indented() {
        let err = Error::Validation(vec!["first".into(), "second".into()]);
        assert_eq!(err.to_string(), "topology is not valid:\n\tfirst\n\tsecond");
    }

    #[test]
    fn context_wraps_with_entity() {
        let io = io::Error::new(io::ErrorKind::Other, "boom");
        let err = Error::context("start", "node", "r1")(io);
        assert_eq!(err.to_string(), "unable to start node r1: boom");
    }
}
