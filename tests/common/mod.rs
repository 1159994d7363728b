//! Scratch projects and a fake tool backend shared by the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Result};
use buildwright::config::BuildConfig;
use buildwright::error::BuildError;
use buildwright::tools::{ToolBackend, ToolRegistry};
use buildwright::{Engine, Task};
use tempfile::TempDir;

/// Tool backend that "installs" a shell script instead of fetching anything.
///
/// Every install bumps `installs`; every invocation of an installed script
/// appends a line to the invocation log, so tests can count both.
pub struct CountingBackend {
    installs: AtomicUsize,
    invocation_log: PathBuf,
    fail: bool,
}

impl CountingBackend {
    pub fn new(invocation_log: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            installs: AtomicUsize::new(0),
            invocation_log: invocation_log.into(),
            fail: false,
        })
    }

    pub fn failing(invocation_log: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            installs: AtomicUsize::new(0),
            invocation_log: invocation_log.into(),
            fail: true,
        })
    }

    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    fn script(&self) -> String {
        format!(
            "#!/bin/sh\necho \"$0 $*\" >> '{}'\necho \"generated $*\"\n",
            self.invocation_log.display()
        )
    }
}

impl ToolBackend for CountingBackend {
    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("HTTP 503 fetching {url}");
        }
        fs::write(dest, self.script())?;
        Ok(())
    }

    fn install_module(&self, module: &str, _version: &str, bin_dir: &Path) -> Result<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("go: {module}: unrecognized import path");
        }
        let name = module.rsplit('/').next().unwrap_or(module);
        fs::write(bin_dir.join(name), self.script())?;
        Ok(())
    }
}

/// A throwaway project directory.
pub struct Project {
    pub dir: TempDir,
}

impl Project {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    /// Write a file and backdate it, so anything produced later is newer.
    pub fn write_old(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.write(rel, contents);
        let past = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(past)
            .unwrap();
        path
    }

    pub fn service(&self, name: &str) {
        fs::create_dir_all(self.path(&format!("services/{name}"))).unwrap();
    }

    pub fn config(&self) -> BuildConfig {
        let mut config = BuildConfig::defaults(self.root()).unwrap();
        config.workers = 4;
        config
    }

    /// Lines written to the fake tools' invocation log.
    pub fn invocations(&self) -> usize {
        fs::read_to_string(self.invocation_log())
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    pub fn invocation_log(&self) -> PathBuf {
        self.path("invocations.log")
    }

    pub fn engine(
        &self,
        config: BuildConfig,
        registry: ToolRegistry,
        tasks: Vec<Task>,
        backend: Arc<CountingBackend>,
    ) -> Result<Engine, BuildError> {
        Engine::with_backend(config, registry, tasks, backend)
    }
}
