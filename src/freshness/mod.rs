//! Freshness tracking: decide whether a task's outputs are up to date.
//!
//! The check is conservative. Anything that cannot be read or compared makes
//! the task stale, so work may be repeated but is never skipped wrongly.

mod patterns;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::fsutil::{safe_segment, sha256_hex};
use crate::graph::Task;

/// How inputs are compared against outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessMode {
    /// Newest input modification time against oldest output time.
    #[default]
    Timestamp,
    /// Timestamp check plus a stored content fingerprint of the inputs.
    Fingerprint,
}

/// Decides staleness and records fingerprints after successful runs.
#[derive(Debug, Clone)]
pub struct FreshnessTracker {
    root: PathBuf,
    state_dir: PathBuf,
    mode: FreshnessMode,
}

impl FreshnessTracker {
    pub fn new(root: impl Into<PathBuf>, state_dir: impl Into<PathBuf>, mode: FreshnessMode) -> Self {
        Self {
            root: root.into(),
            state_dir: state_dir.into(),
            mode,
        }
    }

    pub fn mode(&self) -> FreshnessMode {
        self.mode
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// True when the task's work must be (re)done.
    pub fn is_stale(&self, task: &Task) -> bool {
        if task.is_phony() {
            return true;
        }
        match self.check(task) {
            Ok(Some(reason)) => {
                debug!(task = %task.name, %reason, "stale");
                true
            }
            Ok(None) => false,
            Err(err) => {
                debug!(task = %task.name, error = %err, "freshness check failed; treating as stale");
                true
            }
        }
    }

    /// Persist the input fingerprint after a successful run.
    ///
    /// No-op in timestamp mode and for phony tasks.
    pub fn record(&self, task: &Task) -> Result<()> {
        if self.mode != FreshnessMode::Fingerprint || task.is_phony() {
            return Ok(());
        }
        let fingerprint = self.input_fingerprint(task)?;
        let path = self.fingerprint_path(task);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating freshness state dir '{}'", parent.display()))?;
        }
        fs::write(&path, fingerprint)
            .with_context(|| format!("writing fingerprint '{}'", path.display()))?;
        Ok(())
    }

    /// Drop the stored fingerprint so the next check reports stale.
    pub fn forget(&self, task: &Task) -> Result<()> {
        let path = self.fingerprint_path(task);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("removing fingerprint '{}'", path.display()))?;
        }
        Ok(())
    }

    /// `Some(reason)` when stale, `None` when up to date.
    fn check(&self, task: &Task) -> Result<Option<String>> {
        let mut oldest_output: Option<SystemTime> = None;
        for pattern in &task.outputs {
            let paths = self.declared_output(pattern)?;
            if paths.is_empty() {
                return Ok(Some(format!("output '{pattern}' is missing")));
            }
            for path in paths {
                let modified = modified(&path)?;
                oldest_output = Some(oldest_output.map_or(modified, |t| t.min(modified)));
            }
        }

        let mut newest_input: Option<SystemTime> = None;
        for pattern in &task.inputs {
            for path in patterns::expand(&self.root, pattern)? {
                let modified = modified(&path)?;
                newest_input = Some(newest_input.map_or(modified, |t| t.max(modified)));
            }
        }

        if let (Some(input), Some(output)) = (newest_input, oldest_output) {
            if output < input {
                return Ok(Some("an input is newer than the outputs".to_string()));
            }
        }

        if self.mode == FreshnessMode::Fingerprint {
            let current = self.input_fingerprint(task)?;
            let path = self.fingerprint_path(task);
            let stored = fs::read_to_string(&path).ok();
            match stored {
                Some(stored) if stored.trim() == current => {}
                Some(_) => return Ok(Some("input fingerprint changed".to_string())),
                None => return Ok(Some("no recorded fingerprint".to_string())),
            }
        }

        Ok(None)
    }

    /// Output paths are checked as declared: a directory counts as one
    /// artifact, a glob must match at least one file.
    fn declared_output(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        if patterns::is_glob(pattern) {
            return patterns::expand(&self.root, pattern);
        }
        let path = self.root.join(pattern.trim_start_matches("./"));
        Ok(if path.exists() { vec![path] } else { Vec::new() })
    }

    /// SHA-256 over the command template and the sorted (path, content hash)
    /// pairs of every input file.
    fn input_fingerprint(&self, task: &Task) -> Result<String> {
        let mut files = Vec::new();
        for pattern in &task.inputs {
            files.extend(patterns::expand(&self.root, pattern)?);
        }
        files.sort();
        files.dedup();

        let mut hasher = Sha256::new();
        hasher.update(task.command.as_deref().unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        for file in files {
            let rel = file.strip_prefix(&self.root).unwrap_or(&file);
            let bytes =
                fs::read(&file).with_context(|| format!("reading input '{}'", file.display()))?;
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(sha256_hex(&bytes).as_bytes());
            hasher.update([b'\n']);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn fingerprint_path(&self, task: &Task) -> PathBuf {
        let digest = sha256_hex(task.name.as_bytes());
        self.state_dir.join(format!(
            "{}-{}.inputs.hash",
            safe_segment(&task.name),
            &digest[..8]
        ))
    }
}

fn modified(path: &Path) -> Result<SystemTime> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("reading modification time of '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    fn touch(path: &Path, age_secs: u64) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        if !path.exists() {
            fs::write(path, path.display().to_string()).unwrap();
        }
        let when = SystemTime::now() - Duration::from_secs(age_secs);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(when)
            .unwrap();
    }

    fn gen_task() -> Task {
        Task::new("gen")
            .command("protoc --go_out=gen api/*.proto")
            .inputs(["api/*.proto"])
            .outputs(["gen/api.pb.go"])
    }

    fn tracker(tmp: &TempDir, mode: FreshnessMode) -> FreshnessTracker {
        FreshnessTracker::new(tmp.path(), tmp.path().join(".state"), mode)
    }

    #[test]
    fn phony_and_outputless_tasks_are_always_stale() {
        let tmp = TempDir::new().unwrap();
        let t = tracker(&tmp, FreshnessMode::Timestamp);
        assert!(t.is_stale(&Task::new("lint").command("golangci-lint run")));
        touch(&tmp.path().join("out"), 0);
        assert!(t.is_stale(&Task::new("x").outputs(["out"]).phony(true)));
    }

    #[test]
    fn missing_output_is_stale() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp.path().join("api/user.proto"), 100);
        assert!(tracker(&tmp, FreshnessMode::Timestamp).is_stale(&gen_task()));
    }

    #[test]
    fn outputs_newer_than_inputs_are_fresh() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp.path().join("api/user.proto"), 100);
        touch(&tmp.path().join("gen/api.pb.go"), 10);
        assert!(!tracker(&tmp, FreshnessMode::Timestamp).is_stale(&gen_task()));
    }

    #[test]
    fn touched_input_makes_task_stale() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp.path().join("api/user.proto"), 100);
        touch(&tmp.path().join("gen/api.pb.go"), 10);
        touch(&tmp.path().join("api/user.proto"), 0);
        assert!(tracker(&tmp, FreshnessMode::Timestamp).is_stale(&gen_task()));
    }

    #[test]
    fn oldest_output_is_compared() {
        let tmp = TempDir::new().unwrap();
        let task = gen_task().outputs(["gen/extra.go"]);
        touch(&tmp.path().join("api/user.proto"), 50);
        touch(&tmp.path().join("gen/api.pb.go"), 10);
        touch(&tmp.path().join("gen/extra.go"), 100);
        assert!(tracker(&tmp, FreshnessMode::Timestamp).is_stale(&task));
    }

    #[test]
    fn fingerprint_mode_requires_a_record() {
        let tmp = TempDir::new().unwrap();
        let t = tracker(&tmp, FreshnessMode::Fingerprint);
        let task = gen_task();
        touch(&tmp.path().join("api/user.proto"), 100);
        touch(&tmp.path().join("gen/api.pb.go"), 10);

        assert!(t.is_stale(&task));
        t.record(&task).unwrap();
        assert!(!t.is_stale(&task));

        // Content change with an older timestamp is still detected.
        fs::write(tmp.path().join("api/user.proto"), "syntax = \"proto3\";").unwrap();
        touch(&tmp.path().join("api/user.proto"), 200);
        assert!(t.is_stale(&task));

        t.record(&task).unwrap();
        assert!(!t.is_stale(&task));
        t.forget(&task).unwrap();
        assert!(t.is_stale(&task));
    }

    #[test]
    fn command_change_invalidates_fingerprint() {
        let tmp = TempDir::new().unwrap();
        let t = tracker(&tmp, FreshnessMode::Fingerprint);
        touch(&tmp.path().join("api/user.proto"), 100);
        touch(&tmp.path().join("gen/api.pb.go"), 10);
        t.record(&gen_task()).unwrap();

        let changed = Task {
            command: Some("protoc --go_out=paths=source_relative:gen api/*.proto".into()),
            ..gen_task()
        };
        assert!(t.is_stale(&changed));
    }

    #[test]
    fn timestamp_mode_record_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let t = tracker(&tmp, FreshnessMode::Timestamp);
        t.record(&gen_task()).unwrap();
        assert!(!t.state_dir().exists());
    }
}
