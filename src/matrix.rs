//! Service x platform build matrix.
//!
//! Services are discovered by listing the services directory; platforms come
//! from a fixed supported set. Every target produced by one expansion shares
//! the same [`BuildMetadata`], computed once per invocation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use time::OffsetDateTime;

/// (OS, architecture) pairs the matrix can target.
pub const SUPPORTED_PLATFORMS: &[(&str, &str)] = &[
    ("linux", "amd64"),
    ("linux", "arm64"),
    ("darwin", "amd64"),
    ("darwin", "arm64"),
    ("windows", "amd64"),
];

/// Matrix expansion failures. All are detected before any task runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatrixError {
    #[error("targets '{first}' and '{second}' both resolve to artifact '{}'", .path.display())]
    DuplicateArtifact {
        path: PathBuf,
        first: String,
        second: String,
    },

    #[error("unknown service '{name}'; known services: {}", .known.join(", "))]
    UnknownService { name: String, known: Vec<String> },

    #[error("unsupported platform '{0}'; expected os/arch from: {list}", list = supported_list())]
    UnsupportedPlatform(String),

    #[error("no services found under '{}'", .0.display())]
    NoServices(PathBuf),

    #[error("reading services directory '{}': {reason}", .path.display())]
    ServicesDir { path: PathBuf, reason: String },
}

fn supported_list() -> String {
    SUPPORTED_PLATFORMS
        .iter()
        .map(|(os, arch)| format!("{os}/{arch}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A target operating system and architecture.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// The platform this process runs on, in Go-style naming.
    pub fn host() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self::new(os, arch)
    }

    /// `os-arch`, used in artifact and task names.
    pub fn slug(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_PLATFORMS
            .iter()
            .any(|(os, arch)| *os == self.os && *arch == self.arch)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// `all`/`*`, or an explicit comma-separated list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selector {
    #[default]
    All,
    Only(Vec<String>),
}

impl Selector {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || value == "all" || value == "*" {
            return Selector::All;
        }
        let items: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if items.iter().any(|s| s == "all" || s == "*") {
            return Selector::All;
        }
        Selector::Only(items)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::All => write!(f, "all"),
            Selector::Only(items) => write!(f, "{}", items.join(",")),
        }
    }
}

/// Provenance stamped on every artifact of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildMetadata {
    pub version: String,
    pub commit: String,
    /// UTC build time, `YYYY-MM-DDTHH:MM:SSZ`.
    pub built_at: String,
}

impl BuildMetadata {
    /// Build metadata from an injected source-control key-value map.
    ///
    /// Recognized keys: `version` (or `tag`), `commit`. Missing values fall
    /// back to `dev` and `unknown`. The timestamp is taken now.
    pub fn from_source(source: &BTreeMap<String, String>) -> Self {
        let version = source
            .get("version")
            .or_else(|| source.get("tag"))
            .cloned()
            .unwrap_or_else(|| "dev".to_string());
        let commit = source
            .get("commit")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            version,
            commit,
            built_at: utc_timestamp(OffsetDateTime::now_utc()),
        }
    }
}

fn utc_timestamp(now: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// One (service, platform) combination to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTarget {
    pub service: String,
    pub platform: Platform,
    /// Artifact file name, e.g. `api-linux-amd64`.
    pub binary_name: String,
    /// Artifact path inside the output directory.
    pub output_path: PathBuf,
    pub metadata: BuildMetadata,
}

impl BuildTarget {
    /// `service:os-arch`, used to name expanded tasks.
    pub fn label(&self) -> String {
        format!("{}:{}", self.service, self.platform.slug())
    }
}

/// Produces build targets for service and platform selectors.
#[derive(Debug, Clone)]
pub struct MatrixExpander {
    services: Vec<String>,
    platforms: Vec<Platform>,
    output_dir: PathBuf,
    metadata: BuildMetadata,
}

impl MatrixExpander {
    pub fn new(services: Vec<String>, output_dir: PathBuf, metadata: BuildMetadata) -> Self {
        Self {
            services,
            platforms: SUPPORTED_PLATFORMS
                .iter()
                .map(|(os, arch)| Platform::new(*os, *arch))
                .collect(),
            output_dir,
            metadata,
        }
    }

    /// Discover services as the non-hidden subdirectories of `services_dir`.
    pub fn discover(
        services_dir: &Path,
        output_dir: PathBuf,
        metadata: BuildMetadata,
    ) -> Result<Self, MatrixError> {
        Ok(Self::new(discover_services(services_dir)?, output_dir, metadata))
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    pub fn metadata(&self) -> &BuildMetadata {
        &self.metadata
    }

    /// One target per selected (service, platform), with a collision check on
    /// artifact paths.
    pub fn expand(
        &self,
        services: &Selector,
        platforms: &Selector,
    ) -> Result<Vec<BuildTarget>, MatrixError> {
        let services = self.select_services(services)?;
        let platforms = self.select_platforms(platforms)?;

        let mut seen: HashMap<PathBuf, String> = HashMap::new();
        let mut targets = Vec::with_capacity(services.len() * platforms.len());
        for service in &services {
            for platform in &platforms {
                let binary_name = artifact_name(service, platform);
                let output_path = self.output_dir.join(&binary_name);
                let label = format!("{}:{}", service, platform.slug());
                if let Some(first) = seen.insert(output_path.clone(), label.clone()) {
                    return Err(MatrixError::DuplicateArtifact {
                        path: output_path,
                        first,
                        second: label,
                    });
                }
                targets.push(BuildTarget {
                    service: service.clone(),
                    platform: platform.clone(),
                    binary_name,
                    output_path,
                    metadata: self.metadata.clone(),
                });
            }
        }
        Ok(targets)
    }

    fn select_services(&self, selector: &Selector) -> Result<Vec<String>, MatrixError> {
        match selector {
            Selector::All => Ok(self.services.clone()),
            Selector::Only(names) => {
                let mut out: Vec<String> = Vec::new();
                for name in names {
                    if !self.services.contains(name) {
                        return Err(MatrixError::UnknownService {
                            name: name.clone(),
                            known: self.services.clone(),
                        });
                    }
                    if !out.contains(name) {
                        out.push(name.clone());
                    }
                }
                Ok(out)
            }
        }
    }

    fn select_platforms(&self, selector: &Selector) -> Result<Vec<Platform>, MatrixError> {
        let entries = match selector {
            Selector::All => return Ok(self.platforms.clone()),
            Selector::Only(entries) => entries,
        };

        let mut out: Vec<Platform> = Vec::new();
        for entry in entries {
            let (os, arch) = entry
                .split_once('/')
                .ok_or_else(|| MatrixError::UnsupportedPlatform(entry.clone()))?;
            let matched: Vec<&Platform> = self
                .platforms
                .iter()
                .filter(|p| (os == "*" || p.os == os) && (arch == "*" || p.arch == arch))
                .collect();
            if matched.is_empty() {
                return Err(MatrixError::UnsupportedPlatform(entry.clone()));
            }
            for platform in matched {
                if !out.contains(platform) {
                    out.push(platform.clone());
                }
            }
        }
        Ok(out)
    }
}

/// List service names under `services_dir`, sorted.
pub fn discover_services(services_dir: &Path) -> Result<Vec<String>, MatrixError> {
    let entries = fs::read_dir(services_dir).map_err(|e| MatrixError::ServicesDir {
        path: services_dir.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut services = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| MatrixError::ServicesDir {
            path: services_dir.to_path_buf(),
            reason: e.to_string(),
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        services.push(name.to_string());
    }

    if services.is_empty() {
        return Err(MatrixError::NoServices(services_dir.to_path_buf()));
    }
    services.sort();
    Ok(services)
}

/// Deterministic artifact file name for a service on a platform.
///
/// Names are lowercased and reduced to `[a-z0-9._-]`, so services whose names
/// differ only in case or punctuation collide and are rejected by expansion.
pub fn artifact_name(service: &str, platform: &Platform) -> String {
    let clean: String = service
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let mut name = format!("{}-{}", clean, platform.slug());
    if platform.os == "windows" {
        name.push_str(".exe");
    }
    name
}
