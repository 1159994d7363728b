//! Host prerequisite checks.
//!
//! Runs before anything is installed or spawned, so a missing `go` or `curl`
//! is reported up front instead of as a failed download halfway through a
//! build.

use std::path::PathBuf;

use crate::tools::ToolError;

/// Locate `cmd` on `PATH`.
pub fn find_command(cmd: &str) -> Option<PathBuf> {
    which::which(cmd).ok()
}

pub fn command_exists(cmd: &str) -> bool {
    find_command(cmd).is_some()
}

/// Check that every program in `tools` is available.
///
/// Each entry is `(command, why)`; `why` names what needs it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<(), ToolError> {
    let mut missing: Vec<(&str, &str)> = Vec::new();
    for (tool, why) in tools {
        if !command_exists(tool) && !missing.iter().any(|(t, _)| t == tool) {
            missing.push((*tool, *why));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, why)| format!("  {t} (needed for {why})"))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(ToolError::HostTool(msg));
    }
    Ok(())
}
