//! Pinned external tools: what they are and how they get onto disk.
//!
//! [`ToolRegistry`] holds the pinned identities, [`ToolProvisioner`] turns an
//! identity into an executable inside the tool cache.

mod archive;
pub mod provisioner;
pub mod registry;

use std::path::PathBuf;

use thiserror::Error;

pub use provisioner::{EnsureOutcome, HostBackend, InstallReceipt, ToolBackend, ToolProvisioner};
pub use registry::{env_key, InstallMethod, ToolRegistry, ToolSpec};

/// Tool provisioning failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    /// Download, module build, or checksum verification failed.
    #[error("failed to fetch tool {tool}@{version}: {reason}")]
    Fetch {
        tool: String,
        version: String,
        reason: String,
    },

    /// The install finished but the expected binary is not where it should be.
    #[error("tool {tool}@{version} installed without the expected binary: {detail}")]
    Layout {
        tool: String,
        version: String,
        detail: String,
    },

    #[error("unknown tool '{name}'{}", required_by_suffix(.required_by))]
    UnknownTool {
        name: String,
        required_by: Option<String>,
    },

    #[error("tool '{0}' is declared more than once")]
    Duplicate(String),

    #[error("invalid tool definition '{tool}': {reason}")]
    InvalidSpec { tool: String, reason: String },

    #[error("tool cache error at {}: {reason}", .path.display())]
    Cache { path: PathBuf, reason: String },

    /// A host program the install needs (curl, go, tar, ...) is missing.
    #[error("missing host prerequisites:\n{0}")]
    HostTool(String),
}

fn required_by_suffix(task: &Option<String>) -> String {
    task.as_ref()
        .map(|t| format!(" (required by task '{t}')"))
        .unwrap_or_default()
}
