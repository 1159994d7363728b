//! Expansion of declared task inputs and outputs.
//!
//! Patterns are relative to the project root and use `/` separators. `*` and
//! `?` stay within one path segment, `**` spans any depth.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use tracing::trace;
use walkdir::WalkDir;

const OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

pub(crate) fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Expand one declared path or glob into the files it names.
///
/// A plain file yields itself, a directory yields every file beneath it, and
/// a missing path or a glob without matches yields nothing.
pub(crate) fn expand(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let pattern = pattern.trim_start_matches("./");
    if !is_glob(pattern) {
        let path = root.join(pattern);
        if path.is_dir() {
            return Ok(files_under(&path));
        }
        if path.exists() {
            return Ok(vec![path]);
        }
        return Ok(Vec::new());
    }

    let root_str = root
        .to_str()
        .with_context(|| format!("project root '{}' is not valid UTF-8", root.display()))?;
    let full = format!("{}/{pattern}", Pattern::escape(root_str.trim_end_matches('/')));
    let entries = glob::glob_with(&full, OPTIONS)
        .with_context(|| format!("invalid glob pattern '{pattern}'"))?;

    let mut out = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.is_dir() => out.extend(files_under(&path)),
            Ok(path) if path.is_file() => out.push(path),
            Ok(_) => {}
            Err(e) => trace!(pattern, error = %e, "skipping unreadable glob entry"),
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect();
    out.sort();
    out
}
