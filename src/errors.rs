//! Typed error hierarchy for the Foreman orchestrator.
//!
//! Five top-level enums cover the five seams of the system:
//! - `InvocationError` — agent invocation layer failures
//! - `PlanningError` — fatal planning-pipeline failures
//! - `WorkspaceError` — git worktree and merge failures
//! - `CheckpointError` — artifact store write failures
//! - `ConfigError` — rejected or malformed configuration
//!
//! Orchestration loops above these seams use `anyhow::Result`; every path
//! that reaches the caller converges into a `BuildResult`, never a panic.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the agent invocation layer.
///
/// Non-success never raises out of the layer as a panic; the scheduler
/// always sees one of these variants and decides the response itself.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("transport failure reaching agent backend: {0}")]
    Transport(String),

    #[error("agent invocation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("agent reported terminal status '{status}': {message}")]
    Status { status: String, message: String },

    #[error("agent payload did not match the {role} response schema: {details}")]
    SchemaMismatch { role: String, details: String },

    #[error("agent invocation was cancelled")]
    Cancelled,
}

impl InvocationError {
    /// Whether this failure looks transient (worth a scheduler-level retry).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { .. })
    }
}

/// Fatal errors from the planning pipeline.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("dependency cycle detected among issues: {members:?}")]
    Cycle { members: Vec<String> },

    #[error("issue '{issue}' depends on unknown issue '{dependency}'")]
    UnknownDependency { issue: String, dependency: String },

    #[error("duplicate issue name in sprint plan: '{name}'")]
    DuplicateIssue { name: String },

    #[error("{stage} output was unusable after the review budget: {details}")]
    Unparseable { stage: String, details: String },

    #[error(transparent)]
    Agent(#[from] InvocationError),
}

/// Errors from the git workspace manager.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),

    #[error("branch '{branch}' not found")]
    MissingBranch { branch: String },

    #[error("repository has no commits; cannot branch from {path}")]
    UnbornRepository { path: PathBuf },

    #[error("worktree path {path} could not be prepared: {source}")]
    WorktreePath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from checkpoint and artifact persistence.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to write artifact at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors from configuration parsing.
///
/// Unknown options are rejected rather than ignored so a typoed knob never
/// silently reverts to its default.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unrecognized config option: {0}")]
    UnknownOption(String),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_error_transient_classification() {
        assert!(InvocationError::Transport("503".into()).is_transient());
        assert!(InvocationError::Timeout { seconds: 10 }.is_transient());
        assert!(
            !InvocationError::SchemaMismatch {
                role: "coder".into(),
                details: "missing field".into(),
            }
            .is_transient()
        );
        assert!(!InvocationError::Cancelled.is_transient());
    }

    #[test]
    fn planning_error_cycle_names_members() {
        let err = PlanningError::Cycle {
            members: vec!["a".into(), "b".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("a"));
        assert!(msg.contains("b"));
        assert!(msg.to_lowercase().contains("cycle"));
    }

    #[test]
    fn planning_error_converts_from_invocation_error() {
        let inner = InvocationError::Transport("connection refused".into());
        let planning: PlanningError = inner.into();
        match &planning {
            PlanningError::Agent(InvocationError::Transport(msg)) => {
                assert_eq!(msg, "connection refused");
            }
            _ => panic!("expected PlanningError::Agent(Transport)"),
        }
    }

    #[test]
    fn config_error_names_the_option() {
        let err = ConfigError::UnknownOption("max_typo_count".into());
        assert!(err.to_string().contains("max_typo_count"));
    }

    #[test]
    fn all_error_types_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&InvocationError::Cancelled);
        assert_std_error(&PlanningError::DuplicateIssue { name: "x".into() });
        assert_std_error(&ConfigError::Invalid("bad".into()));
    }
}
