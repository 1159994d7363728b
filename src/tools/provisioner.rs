//! Versioned tool cache.
//!
//! Every (name, version) resolves to exactly one path:
//! `<cache>/<name>/<version>/<binary>`. An executable file at that path means
//! the tool is installed; nothing else is consulted. Installs are staged in
//! `<cache>/.tmp/` and renamed into place, so a failed or interrupted install
//! never leaves a binary at the final path.
//!
//! Concurrent requests for the same tool are serialized twice: an in-process
//! mutex keyed by tool name, and an exclusive `fs2` lock on
//! `<cache>/.locks/<name>.lock` for other processes sharing the cache.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use super::archive::{self, ArchiveKind};
use super::registry::{InstallMethod, ToolSpec};
use super::ToolError;
use crate::fsutil::{atomic_rename, is_executable, make_executable, now_unix, sha256_file, tmp_name};
use crate::matrix::Platform;
use crate::process::Cmd;
use crate::template::{self, TemplateVars};

const RECEIPT: &str = ".install.json";

/// Network and compiler access used by the provisioner.
pub trait ToolBackend: Send + Sync {
    /// Download `url` to the file `dest`.
    fn download(&self, url: &str, dest: &Path) -> Result<()>;

    /// Build `module@version` and place its binary in `bin_dir`.
    fn install_module(&self, module: &str, version: &str, bin_dir: &Path) -> Result<()>;

    /// Host programs this backend needs for `method`.
    fn requirements(&self, _method: &InstallMethod) -> Vec<&'static str> {
        Vec::new()
    }
}

/// Backend that shells out to `curl` and `go`.
#[derive(Debug, Clone)]
pub struct HostBackend {
    timeout: Duration,
}

impl HostBackend {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl ToolBackend for HostBackend {
    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let curl = which::which("curl").context("curl not found in PATH")?;
        Cmd::new(curl.to_string_lossy())
            .args(["-fsSL", "--retry", "3", "-o"])
            .arg(dest.to_string_lossy())
            .arg(url)
            .timeout(self.timeout)
            .error_msg(format!("Download of {url} failed"))
            .run()?;
        Ok(())
    }

    fn install_module(&self, module: &str, version: &str, bin_dir: &Path) -> Result<()> {
        let go = which::which("go").context("go not found in PATH")?;
        Cmd::new(go.to_string_lossy())
            .arg("install")
            .arg(format!("{module}@{version}"))
            .env("GOBIN", bin_dir.to_string_lossy())
            .timeout(self.timeout)
            .error_msg(format!("go install {module}@{version} failed"))
            .run()?;
        Ok(())
    }

    fn requirements(&self, method: &InstallMethod) -> Vec<&'static str> {
        match method {
            InstallMethod::Module { .. } => vec!["go"],
            InstallMethod::Archive { url, .. } => {
                let mut req = vec!["curl"];
                req.extend_from_slice(ArchiveKind::from_url(url).host_requirements());
                req
            }
        }
    }
}

/// Whether [`ToolProvisioner::ensure_with_outcome`] had to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Cached,
    Installed,
}

/// Written next to every installed binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    pub method: String,
    pub source: String,
    pub binary: String,
    pub sha256: String,
    pub installed_at_unix: u64,
}

pub struct ToolProvisioner {
    cache_dir: PathBuf,
    backend: Arc<dyn ToolBackend>,
    platform: Platform,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for ToolProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolProvisioner")
            .field("cache_dir", &self.cache_dir)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

impl ToolProvisioner {
    /// Provisioner backed by the host `curl` and `go`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self::with_backend(cache_dir, Arc::new(HostBackend::default()))
    }

    pub fn with_backend(cache_dir: impl Into<PathBuf>, backend: Arc<dyn ToolBackend>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            backend,
            platform: Platform::host(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn backend(&self) -> &dyn ToolBackend {
        self.backend.as_ref()
    }

    pub fn install_dir(&self, spec: &ToolSpec) -> PathBuf {
        self.cache_dir.join(&spec.name).join(&spec.version)
    }

    pub fn binary_path(&self, spec: &ToolSpec) -> PathBuf {
        self.install_dir(spec).join(spec.binary_name())
    }

    pub fn is_installed(&self, spec: &ToolSpec) -> bool {
        is_executable(&self.binary_path(spec))
    }

    /// Path to an executable for `spec`, installing it first if needed.
    pub fn ensure(&self, spec: &ToolSpec) -> Result<PathBuf, ToolError> {
        self.ensure_with_outcome(spec).map(|(path, _)| path)
    }

    pub fn ensure_with_outcome(&self, spec: &ToolSpec) -> Result<(PathBuf, EnsureOutcome), ToolError> {
        spec.validate()?;
        let binary = self.binary_path(spec);
        if is_executable(&binary) {
            debug!(tool = %spec, path = %binary.display(), "tool cached");
            return Ok((binary, EnsureOutcome::Cached));
        }

        let name_lock = self.name_lock(&spec.name);
        let _guard = name_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _file_lock = self.acquire_file_lock(&spec.name)?;

        // Another thread or process may have finished the install meanwhile.
        if is_executable(&binary) {
            debug!(tool = %spec, "tool installed by a concurrent request");
            return Ok((binary, EnsureOutcome::Cached));
        }

        let span = info_span!("provision", tool = %spec);
        let _enter = span.enter();
        info!(method = spec.method.kind(), "installing tool");

        let staging = self.cache_dir.join(".tmp").join(tmp_name(&spec.name));
        let result = self.install(spec, &staging, &binary);
        if staging.exists() {
            if let Err(err) = fs::remove_dir_all(&staging) {
                warn!(path = %staging.display(), error = %err, "failed to remove staging dir");
            }
        }
        result?;

        info!(path = %binary.display(), "tool installed");
        Ok((binary, EnsureOutcome::Installed))
    }

    /// Receipts of every installed tool, sorted by name then version.
    pub fn installed(&self) -> Result<Vec<InstallReceipt>, ToolError> {
        let mut out = Vec::new();
        if !self.cache_dir.is_dir() {
            return Ok(out);
        }
        for name_dir in read_dirs(&self.cache_dir).map_err(|e| self.cache_error(&self.cache_dir, e))? {
            for version_dir in read_dirs(&name_dir).map_err(|e| self.cache_error(&name_dir, e))? {
                let receipt_path = version_dir.join(RECEIPT);
                let Ok(raw) = fs::read_to_string(&receipt_path) else {
                    continue;
                };
                match serde_json::from_str::<InstallReceipt>(&raw) {
                    Ok(receipt) if is_executable(&version_dir.join(&receipt.binary)) => {
                        out.push(receipt)
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(path = %receipt_path.display(), error = %err, "unreadable install receipt")
                    }
                }
            }
        }
        out.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        Ok(out)
    }

    /// Delete the whole cache directory.
    pub fn purge(&self) -> Result<(), ToolError> {
        if self.cache_dir.exists() {
            fs::remove_dir_all(&self.cache_dir)
                .with_context(|| format!("Failed to remove {}", self.cache_dir.display()))
                .map_err(|e| self.cache_error(&self.cache_dir, e))?;
            info!(path = %self.cache_dir.display(), "tool cache purged");
        }
        Ok(())
    }

    fn install(&self, spec: &ToolSpec, staging: &Path, binary: &Path) -> Result<(), ToolError> {
        let fetch = |err: anyhow::Error| ToolError::Fetch {
            tool: spec.name.clone(),
            version: spec.version.clone(),
            reason: format!("{err:#}"),
        };
        let layout = |detail: String| ToolError::Layout {
            tool: spec.name.clone(),
            version: spec.version.clone(),
            detail,
        };

        fs::create_dir_all(staging)
            .with_context(|| format!("Failed to create {}", staging.display()))
            .map_err(|e| self.cache_error(staging, e))?;

        let binary_name = spec.binary_name();
        let staged = match &spec.method {
            InstallMethod::Module { module } => {
                let bin_dir = staging.join("bin");
                fs::create_dir_all(&bin_dir).map_err(|e| self.cache_error(&bin_dir, e.into()))?;
                self.backend
                    .install_module(module, &spec.version, &bin_dir)
                    .map_err(fetch)?;
                let staged = bin_dir.join(&binary_name);
                if !staged.is_file() {
                    return Err(layout(format!(
                        "module {module} did not produce '{binary_name}'"
                    )));
                }
                staged
            }
            InstallMethod::Archive { url, path, sha256 } => {
                let url = self.render_url(spec, url)?;
                let kind = ArchiveKind::from_url(&url);
                let download = staging.join("download");
                self.backend.download(&url, &download).map_err(fetch)?;
                if !download.is_file() {
                    return Err(fetch(anyhow::anyhow!("download produced no file")));
                }

                if let Some(expected) = sha256 {
                    let (actual, _) = sha256_file(&download).map_err(fetch)?;
                    if !actual.eq_ignore_ascii_case(expected) {
                        return Err(fetch(anyhow::anyhow!(
                            "checksum mismatch\n  expected: {expected}\n  actual:   {actual}"
                        )));
                    }
                }

                if kind == ArchiveKind::Raw {
                    download
                } else {
                    let unpacked = staging.join("unpacked");
                    archive::extract(kind, &download, &unpacked).map_err(fetch)?;
                    match path {
                        Some(rel) => {
                            let p = unpacked.join(rel);
                            if !p.is_file() {
                                return Err(layout(format!("'{rel}' not found in archive")));
                            }
                            p
                        }
                        None => archive::find_file(&unpacked, &binary_name).ok_or_else(|| {
                            layout(format!("no file named '{binary_name}' in archive"))
                        })?,
                    }
                }
            }
        };

        self.place(spec, &staged, binary)
    }

    /// Move a staged binary into its final cache slot with its receipt.
    fn place(&self, spec: &ToolSpec, staged: &Path, binary: &Path) -> Result<(), ToolError> {
        let place = || -> Result<()> {
            make_executable(staged)?;
            let (sha256, _) = sha256_file(staged)?;
            let receipt = InstallReceipt {
                name: spec.name.clone(),
                version: spec.version.clone(),
                method: spec.method.kind().to_string(),
                source: spec.method.source().to_string(),
                binary: spec.binary_name(),
                sha256,
                installed_at_unix: now_unix(),
            };
            let dir = self.install_dir(spec);
            fs::create_dir_all(&dir)?;
            let receipt_tmp = dir.join(tmp_name(RECEIPT));
            fs::write(&receipt_tmp, serde_json::to_vec_pretty(&receipt)?)?;
            atomic_rename(&receipt_tmp, &dir.join(RECEIPT))?;
            // The binary goes last: its presence marks the install complete.
            atomic_rename(staged, binary)?;
            Ok(())
        };
        place().map_err(|e| self.cache_error(binary, e))?;
        if !is_executable(binary) {
            return Err(ToolError::Layout {
                tool: spec.name.clone(),
                version: spec.version.clone(),
                detail: format!("{} is not executable after install", binary.display()),
            });
        }
        Ok(())
    }

    fn render_url(&self, spec: &ToolSpec, url: &str) -> Result<String, ToolError> {
        let uname_arch = match self.platform.arch.as_str() {
            "amd64" => "x86_64",
            "arm64" => "aarch64",
            other => other,
        };
        let vars = TemplateVars::new()
            .with("name", spec.name.as_str())
            .with("version", spec.version.as_str())
            .with("os", self.platform.os.as_str())
            .with("arch", self.platform.arch.as_str())
            .with("uname_arch", uname_arch);
        template::render(url, &vars).map_err(|e| ToolError::InvalidSpec {
            tool: spec.name.clone(),
            reason: e.to_string(),
        })
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }

    /// Blocks until no other process is installing `name`. The lock file is
    /// never unlinked; removing a held lock file would let a second process
    /// lock a fresh inode at the same path.
    fn acquire_file_lock(&self, name: &str) -> Result<fs::File, ToolError> {
        let lock_path = self.cache_dir.join(".locks").join(format!("{name}.lock"));
        let open = || -> Result<fs::File> {
            if let Some(parent) = lock_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)
                .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
            file.lock_exclusive()
                .with_context(|| format!("Failed to lock {}", lock_path.display()))?;
            Ok(file)
        };
        open().map_err(|e| self.cache_error(&lock_path, e))
    }

    fn cache_error(&self, path: &Path, err: anyhow::Error) -> ToolError {
        ToolError::Cache {
            path: path.to_path_buf(),
            reason: format!("{err:#}"),
        }
    }
}

/// Non-hidden subdirectories of `dir`, sorted.
fn read_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        out.push(entry.path());
    }
    out.sort();
    Ok(out)
}
