//! Top-level error taxonomy and process exit codes.
//!
//! Each component reports its own error enum; [`BuildError`] unifies them so
//! callers can map a failure to its class without parsing message text.

use thiserror::Error;

use crate::config::ConfigError;
use crate::graph::GraphError;
use crate::matrix::MatrixError;
use crate::scheduler::TaskError;
use crate::template::TemplateError;
use crate::tools::ToolError;

/// Exit code for a fully successful run.
pub const EXIT_OK: i32 = 0;
/// Usage, manifest, or template errors.
pub const EXIT_CONFIG: i32 = 2;
/// Unknown tasks and dependency cycles.
pub const EXIT_GRAPH: i32 = 10;
/// Tool fetch, layout, and host prerequisite failures.
pub const EXIT_PROVISION: i32 = 20;
/// A task exited non-zero or could not be started.
pub const EXIT_TASK: i32 = 30;
/// A task exceeded its timeout.
pub const EXIT_TIMEOUT: i32 = 31;
/// Build matrix expansion failures.
pub const EXIT_MATRIX: i32 = 40;

/// Any failure that ends an invocation.
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

impl BuildError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::Config(_) | BuildError::Template(_) => EXIT_CONFIG,
            BuildError::Graph(_) => EXIT_GRAPH,
            BuildError::Tool(_) => EXIT_PROVISION,
            BuildError::Task(TaskError::Timeout { .. }) => EXIT_TIMEOUT,
            BuildError::Task(_) => EXIT_TASK,
            BuildError::Matrix(_) => EXIT_MATRIX,
        }
    }

    /// Short name of the failure class, used in run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::Config(_) => "configuration error",
            BuildError::Template(_) => "template error",
            BuildError::Graph(GraphError::Cycle { .. }) => "dependency cycle",
            BuildError::Graph(_) => "task graph error",
            BuildError::Tool(ToolError::Fetch { .. }) => "tool fetch error",
            BuildError::Tool(ToolError::Layout { .. }) => "tool layout error",
            BuildError::Tool(_) => "tool provisioning error",
            BuildError::Task(TaskError::Timeout { .. }) => "task timeout",
            BuildError::Task(_) => "task execution error",
            BuildError::Matrix(MatrixError::DuplicateArtifact { .. }) => "duplicate artifact",
            BuildError::Matrix(_) => "build matrix error",
        }
    }

    /// Captured diagnostic output attached to the failure, if any.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            BuildError::Task(err) => Some(err.output()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn exit_codes_distinguish_failure_classes() {
        let cycle: BuildError = GraphError::Cycle {
            chain: vec!["a".into(), "b".into(), "a".into()],
        }
        .into();
        let fetch: BuildError = ToolError::Fetch {
            tool: "protoc".into(),
            version: "25.1".into(),
            reason: "404".into(),
        }
        .into();
        let failed: BuildError = TaskError::Failed {
            task: "lint".into(),
            status: Some(1),
            output: "boom".into(),
        }
        .into();
        let timeout: BuildError = TaskError::Timeout {
            task: "test".into(),
            timeout: Duration::from_secs(5),
            output: String::new(),
        }
        .into();

        assert_eq!(cycle.exit_code(), EXIT_GRAPH);
        assert_eq!(fetch.exit_code(), EXIT_PROVISION);
        assert_eq!(failed.exit_code(), EXIT_TASK);
        assert_eq!(timeout.exit_code(), EXIT_TIMEOUT);
        assert_eq!(failed.captured_output(), Some("boom"));
        assert_eq!(cycle.captured_output(), None);
    }
}
