//! Invocation configuration.
//!
//! Values are layered: built-in defaults, then the manifest `[settings]`
//! table, then `BUILDWRIGHT_*` environment variables, then command-line
//! flags. The result is one immutable [`BuildConfig`] that every component
//! receives.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::freshness::FreshnessMode;
use crate::fsutil::safe_segment;
use crate::matrix::{Platform, Selector};

const ENV_PREFIX: &str = "BUILDWRIGHT_";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to read '{}': {reason}", .path.display())]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse '{}': {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("no buildwright.toml found in {} or any parent directory", .0.display())]
    ManifestNotFound(PathBuf),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("invalid task '{task}': {reason}")]
    Task { task: String, reason: String },
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// `[settings]` table of the manifest. Paths are relative to the project root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub environment: Option<String>,
    pub services_dir: Option<String>,
    pub output_dir: Option<String>,
    pub state_dir: Option<String>,
    pub config_dir: Option<String>,
    /// `project` (default), `user`, or a path.
    pub tool_cache: Option<String>,
    pub jobs: Option<usize>,
    /// Default per-task timeout, e.g. `"10m"`. `"0"` disables it.
    pub timeout: Option<String>,
    pub freshness: Option<FreshnessMode>,
    /// Default service selector.
    pub services: Option<String>,
    /// Default platform selector; the host platform when unset.
    pub platforms: Option<String>,
}

/// Values supplied by the environment or the command line. `None` means
/// "not given"; later layers only replace what they set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub environment: Option<String>,
    pub services: Option<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub platforms: Option<String>,
    pub workers: Option<usize>,
    pub timeout: Option<Duration>,
    pub tool_cache: Option<PathBuf>,
    /// Keyed by tool name or its upper-case env form.
    pub tool_versions: BTreeMap<String, String>,
    /// Injected source-control metadata (`version`, `commit`, ...).
    pub metadata: BTreeMap<String, String>,
    pub dry_run: Option<bool>,
}

impl ConfigOverrides {
    /// Read `BUILDWRIGHT_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_vars(std::env::vars())
    }

    pub fn from_env_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut out = Self::default();
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            match name {
                "SERVICE" => out.services = Some(value),
                "ENV" => out.environment = Some(value),
                "OS" => out.os = Some(value),
                "ARCH" => out.arch = Some(value),
                "PLATFORMS" => out.platforms = Some(value),
                "JOBS" => out.workers = Some(parse_workers(&key, &value)?),
                "TIMEOUT" => out.timeout = Some(parse_duration(&value).map_err(|r| invalid(&key, r))?),
                "TOOL_CACHE" => out.tool_cache = Some(PathBuf::from(value)),
                "VERSION" => {
                    out.metadata.insert("version".into(), value);
                }
                "COMMIT" => {
                    out.metadata.insert("commit".into(), value);
                }
                other => {
                    if let Some(tool) = other
                        .strip_prefix("TOOL_")
                        .and_then(|t| t.strip_suffix("_VERSION"))
                        .filter(|t| !t.is_empty())
                    {
                        out.tool_versions.insert(tool.to_string(), value);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Layer `higher` on top of `self`.
    pub fn merge(mut self, higher: ConfigOverrides) -> Self {
        fn pick<T>(low: &mut Option<T>, high: Option<T>) {
            if high.is_some() {
                *low = high;
            }
        }
        pick(&mut self.environment, higher.environment);
        pick(&mut self.services, higher.services);
        pick(&mut self.os, higher.os);
        pick(&mut self.arch, higher.arch);
        pick(&mut self.platforms, higher.platforms);
        pick(&mut self.workers, higher.workers);
        pick(&mut self.timeout, higher.timeout);
        pick(&mut self.tool_cache, higher.tool_cache);
        pick(&mut self.dry_run, higher.dry_run);
        self.tool_versions.extend(higher.tool_versions);
        self.metadata.extend(higher.metadata);
        self
    }
}

/// Fully resolved configuration for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    pub root: PathBuf,
    /// Environment profile name (`dev`, `staging`, ...).
    pub environment: String,
    pub services_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Freshness fingerprints and other safe-to-delete state.
    pub state_dir: PathBuf,
    pub config_dir: PathBuf,
    pub tool_cache_dir: PathBuf,
    pub workers: usize,
    pub task_timeout: Option<Duration>,
    pub freshness: FreshnessMode,
    pub services: Selector,
    pub platforms: Selector,
    pub tool_versions: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    pub dry_run: bool,
}

impl BuildConfig {
    /// Defaults for `root` with no manifest settings and no overrides.
    pub fn defaults(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::resolve(root, &Settings::default(), ConfigOverrides::default())
    }

    pub fn resolve(
        root: impl Into<PathBuf>,
        settings: &Settings,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let root = root.into();
        let rel = |value: Option<&String>, default: &str| -> PathBuf {
            root.join(value.map(String::as_str).unwrap_or(default))
        };

        let environment = overrides
            .environment
            .or_else(|| settings.environment.clone())
            .unwrap_or_else(|| "dev".to_string());
        if environment.is_empty() || safe_segment(&environment) != environment {
            return Err(invalid("environment", format!("'{environment}' is not a plain name")));
        }

        let state_dir = rel(settings.state_dir.as_ref(), ".buildwright");
        let tool_cache_dir = match overrides.tool_cache {
            Some(path) => root.join(path),
            None => tool_cache_location(&root, &state_dir, settings.tool_cache.as_deref()),
        };

        let workers = match overrides.workers.or(settings.jobs) {
            Some(0) => return Err(invalid("jobs", "must be at least 1")),
            Some(n) => n,
            None => default_workers(),
        };

        let task_timeout = match overrides.timeout {
            Some(t) => Some(t),
            None => match &settings.timeout {
                Some(raw) => Some(parse_duration(raw).map_err(|r| invalid("settings.timeout", r))?),
                None => None,
            },
        }
        .filter(|t| !t.is_zero());

        let services = Selector::parse(
            overrides
                .services
                .as_deref()
                .or(settings.services.as_deref())
                .unwrap_or("all"),
        );

        let platforms = match (overrides.platforms, overrides.os, overrides.arch) {
            (Some(p), _, _) => Selector::parse(&p),
            (None, None, None) => match &settings.platforms {
                Some(p) => Selector::parse(p),
                None => Selector::Only(vec![Platform::host().to_string()]),
            },
            (None, os, arch) => {
                let host = Platform::host();
                Selector::Only(vec![Platform::new(
                    os.unwrap_or(host.os),
                    arch.unwrap_or(host.arch),
                )
                .to_string()])
            }
        };

        Ok(Self {
            services_dir: rel(settings.services_dir.as_ref(), "services"),
            output_dir: rel(settings.output_dir.as_ref(), "bin"),
            config_dir: rel(settings.config_dir.as_ref(), "config"),
            state_dir,
            tool_cache_dir,
            environment,
            workers,
            task_timeout,
            freshness: settings.freshness.unwrap_or_default(),
            services,
            platforms,
            tool_versions: overrides.tool_versions,
            metadata: overrides.metadata,
            dry_run: overrides.dry_run.unwrap_or(false),
            root,
        })
    }

    /// Per-environment configuration file, handed to commands unopened.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(format!("{}.yaml", self.environment))
    }
}

fn tool_cache_location(root: &Path, state_dir: &Path, setting: Option<&str>) -> PathBuf {
    match setting {
        None | Some("project") => state_dir.join("tools"),
        Some("user") => match dirs::cache_dir() {
            Some(dir) => dir.join("buildwright").join("tools"),
            None => {
                warn!("no user cache directory on this host; using the project tool cache");
                state_dir.join("tools")
            }
        },
        Some(path) => root.join(path),
    }
}

fn default_workers() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => n.get(),
        Err(e) => {
            warn!(error = %e, "could not detect CPU count, using 4 workers");
            4
        }
    }
}

fn parse_workers(key: &str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(0) => Err(invalid(key, "must be at least 1")),
        Ok(n) => Ok(n),
        Err(_) => Err(invalid(key, format!("'{value}' is not a number"))),
    }
}

/// Parse `250ms`, `90s`, `10m`, `1h`, or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("'{raw}' is not a duration"))?;
    match unit.trim() {
        "" | "s" => Ok(Duration::from_secs(n)),
        "ms" => Ok(Duration::from_millis(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        other => Err(format!("unknown duration unit '{other}' in '{raw}'")),
    }
}

/// Parse a `key=value` command-line assignment.
pub fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}
