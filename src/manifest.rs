//! `buildwright.toml`: settings, pinned tools, and task declarations.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::config::{parse_duration, ConfigError, Settings};
use crate::graph::Task;
use crate::tools::{InstallMethod, ToolRegistry, ToolSpec};

pub const MANIFEST_FILE: &str = "buildwright.toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestToml {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    tools: BTreeMap<String, ToolToml>,
    #[serde(default, rename = "task")]
    tasks: Vec<TaskToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ToolToml {
    version: String,
    module: Option<String>,
    url: Option<String>,
    /// Binary location inside the archive.
    path: Option<String>,
    sha256: Option<String>,
    binary: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskToml {
    name: String,
    #[serde(default)]
    deps: Vec<String>,
    command: Option<String>,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    phony: bool,
    #[serde(default)]
    best_effort: bool,
    #[serde(default)]
    tools: Vec<String>,
    timeout: Option<String>,
    workdir: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    matrix: bool,
}

/// A parsed and validated manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub path: PathBuf,
    pub settings: Settings,
    pub tools: ToolRegistry,
    /// Tasks in declaration order.
    pub tasks: Vec<Task>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&text, path)
    }

    /// Parse manifest text; `path` is used in error messages.
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let raw: ManifestToml = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut tools = ToolRegistry::new();
        for (name, tool) in raw.tools {
            let spec = tool_spec(&name, tool)?;
            tools.register(spec).map_err(|e| ConfigError::Invalid {
                key: format!("tools.{name}"),
                reason: e.to_string(),
            })?;
        }

        let tasks = raw
            .tasks
            .into_iter()
            .map(task)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            path: path.to_path_buf(),
            settings: raw.settings,
            tools,
            tasks,
        })
    }

    /// Directory containing the manifest.
    pub fn root(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("."))
    }
}

/// Walk up from `start` to the nearest directory holding a manifest.
pub fn find(start: &Path) -> Result<PathBuf, ConfigError> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        let candidate = current.join(MANIFEST_FILE);
        if candidate.is_file() {
            return Ok(candidate);
        }
        dir = current.parent();
    }
    Err(ConfigError::ManifestNotFound(start.to_path_buf()))
}

fn tool_spec(name: &str, raw: ToolToml) -> Result<ToolSpec, ConfigError> {
    let bad = |reason: &str| ConfigError::Invalid {
        key: format!("tools.{name}"),
        reason: reason.to_string(),
    };
    let method = match (raw.module, raw.url) {
        (Some(module), None) => {
            if raw.path.is_some() || raw.sha256.is_some() {
                return Err(bad("'path' and 'sha256' only apply to url installs"));
            }
            InstallMethod::Module { module }
        }
        (None, Some(url)) => InstallMethod::Archive {
            url,
            path: raw.path,
            sha256: raw.sha256.map(|s| s.to_ascii_lowercase()),
        },
        (Some(_), Some(_)) => return Err(bad("set either 'module' or 'url', not both")),
        (None, None) => return Err(bad("one of 'module' or 'url' is required")),
    };
    Ok(ToolSpec {
        name: name.to_string(),
        version: raw.version,
        method,
        binary: raw.binary,
    })
}

fn task(raw: TaskToml) -> Result<Task, ConfigError> {
    let bad = |reason: String| ConfigError::Task {
        task: raw.name.clone(),
        reason,
    };
    if raw.name.is_empty() || raw.name.contains(|c: char| c.is_whitespace() || c == ':') {
        return Err(bad("task names must be non-empty without spaces or ':'".into()));
    }
    if raw.matrix && raw.command.is_none() {
        return Err(bad("matrix tasks need a command".into()));
    }
    let timeout = raw
        .timeout
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(|r| bad(format!("timeout: {r}")))?;
    let workdir = match &raw.workdir {
        Some(dir) => {
            let path = PathBuf::from(dir);
            let escapes = path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
            if escapes {
                return Err(bad(format!("workdir '{dir}' must stay inside the project")));
            }
            Some(path)
        }
        None => None,
    };

    Ok(Task {
        name: raw.name,
        deps: raw.deps,
        command: raw.command,
        inputs: raw.inputs,
        outputs: raw.outputs,
        phony: raw.phony,
        best_effort: raw.best_effort,
        tools: raw.tools,
        timeout,
        workdir,
        env: raw.env,
        matrix: raw.matrix,
        target: None,
    })
}
