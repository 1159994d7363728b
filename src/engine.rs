//! Ties the components together for one invocation.
//!
//! Everything that can be checked without running anything is checked in
//! [`Engine::new`]: tool version overrides, matrix expansion (including
//! artifact collisions), graph validity, and every command template. A
//! constructed engine can only fail at run time because of the outside
//! world: a fetch, a child process, or the filesystem.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{BuildConfig, ConfigError, ConfigOverrides};
use crate::error::BuildError;
use crate::freshness::FreshnessTracker;
use crate::graph::{Task, TaskGraph};
use crate::manifest::Manifest;
use crate::matrix::{BuildMetadata, BuildTarget, MatrixExpander};
use crate::preflight;
use crate::scheduler::{RunReport, Scheduler, SchedulerOptions};
use crate::template::{self, TemplateError, TemplateVars};
use crate::tools::{EnsureOutcome, HostBackend, ToolBackend, ToolProvisioner, ToolRegistry, ToolSpec};

const TOOL_PREFIX: &str = "tool.";

/// Placeholders only bound for matrix-expanded tasks.
const TARGET_VARS: &[&str] = &["service", "os", "arch", "output", "binary"];

pub struct Engine {
    config: BuildConfig,
    graph: TaskGraph,
    registry: ToolRegistry,
    provisioner: ToolProvisioner,
    freshness: FreshnessTracker,
    metadata: BuildMetadata,
    targets: Vec<BuildTarget>,
}

impl Engine {
    pub fn new(config: BuildConfig, registry: ToolRegistry, tasks: Vec<Task>) -> Result<Self, BuildError> {
        Self::with_backend(config, registry, tasks, Arc::new(HostBackend::default()))
    }

    /// Load configuration from a manifest plus environment/CLI overrides.
    pub fn from_manifest(manifest: Manifest, overrides: ConfigOverrides) -> Result<Self, BuildError> {
        let config = BuildConfig::resolve(manifest.root(), &manifest.settings, overrides)?;
        Self::new(config, manifest.tools, manifest.tasks)
    }

    pub fn with_backend(
        config: BuildConfig,
        mut registry: ToolRegistry,
        tasks: Vec<Task>,
        backend: Arc<dyn ToolBackend>,
    ) -> Result<Self, BuildError> {
        registry.apply_version_overrides(&config.tool_versions)?;
        let metadata = BuildMetadata::from_source(&config.metadata);

        let targets = if tasks.iter().any(|t| t.matrix) {
            let expander = MatrixExpander::discover(
                &config.services_dir,
                config.output_dir.clone(),
                metadata.clone(),
            )?;
            let targets = expander.expand(&config.services, &config.platforms)?;
            info!(
                targets = targets.len(),
                services = %config.services,
                platforms = %config.platforms,
                "expanded build matrix"
            );
            targets
        } else {
            Vec::new()
        };

        let mut tasks = expand_matrix(tasks, &targets)?;
        for task in &mut tasks {
            infer_tools(task, &registry)?;
        }

        let graph = TaskGraph::from_tasks(tasks)?;
        graph.validate()?;

        let provisioner = ToolProvisioner::with_backend(config.tool_cache_dir.clone(), backend);
        let freshness = FreshnessTracker::new(
            config.root.clone(),
            config.state_dir.join("freshness"),
            config.freshness,
        );

        let engine = Self {
            config,
            graph,
            registry,
            provisioner,
            freshness,
            metadata,
            targets,
        };
        engine.check_templates()?;
        debug!(tasks = engine.graph.len(), tools = engine.registry.len(), "engine ready");
        Ok(engine)
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn provisioner(&self) -> &ToolProvisioner {
        &self.provisioner
    }

    pub fn metadata(&self) -> &BuildMetadata {
        &self.metadata
    }

    /// Build targets of this invocation; empty when no task is a matrix task.
    pub fn targets(&self) -> &[BuildTarget] {
        &self.targets
    }

    /// Resolved execution order for `targets`, without running anything.
    pub fn plan<S: AsRef<str>>(&self, targets: &[S]) -> Result<Vec<Task>, BuildError> {
        Ok(self.graph.resolve_all(targets)?)
    }

    /// Resolve `targets` and run them.
    ///
    /// `Err` means nothing was started (graph or prerequisite problems).
    /// Failures during the run are reported in [`RunReport::fatal`].
    pub fn run<S: AsRef<str>>(&self, targets: &[S]) -> Result<RunReport, BuildError> {
        let order = self.plan(targets)?;
        info!(
            targets = %targets.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(","),
            tasks = order.len(),
            env = %self.config.environment,
            "resolved execution order"
        );

        if !self.config.dry_run {
            self.preflight(&order)?;
            fs::create_dir_all(&self.config.output_dir).map_err(|e| ConfigError::Invalid {
                key: "output_dir".into(),
                reason: format!("cannot create '{}': {e}", self.config.output_dir.display()),
            })?;
        }

        let scheduler = Scheduler::new(
            &self.config.root,
            &self.registry,
            &self.provisioner,
            &self.freshness,
            SchedulerOptions {
                workers: self.config.workers,
                default_timeout: self.config.task_timeout,
                dry_run: self.config.dry_run,
            },
        )
        .with_vars(self.template_vars())
        .with_env(self.exported_env());

        Ok(scheduler.run(&order))
    }

    /// Install the named tools (all registered tools when `names` is empty).
    pub fn ensure_tools<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<Vec<(ToolSpec, PathBuf, EnsureOutcome)>, BuildError> {
        let specs: Vec<&ToolSpec> = if names.is_empty() {
            self.registry.iter().collect()
        } else {
            names
                .iter()
                .map(|n| self.registry.resolve(n.as_ref()))
                .collect::<Result<_, _>>()?
        };

        let needs: Vec<(&'static str, String)> = specs
            .iter()
            .filter(|spec| !self.provisioner.is_installed(spec))
            .flat_map(|spec| {
                self.provisioner
                    .backend()
                    .requirements(&spec.method)
                    .into_iter()
                    .map(move |req| (req, spec.to_string()))
            })
            .collect();
        let needs: Vec<(&str, &str)> = needs.iter().map(|(t, why)| (*t, why.as_str())).collect();
        preflight::check_required_tools(&needs)?;

        let mut out = Vec::with_capacity(specs.len());
        for spec in specs {
            let (path, outcome) = self.provisioner.ensure_with_outcome(spec)?;
            out.push((spec.clone(), path, outcome));
        }
        Ok(out)
    }

    /// Delete generated state: the output directory and the freshness state,
    /// plus the tool cache when `include_tools` is set. Returns the paths
    /// removed (or, in dry-run mode, the paths that would be removed).
    pub fn clean(&self, include_tools: bool) -> Result<Vec<PathBuf>, BuildError> {
        let cache = &self.config.tool_cache_dir;
        let mut doomed: Vec<PathBuf> = Vec::new();

        doomed.push(self.config.output_dir.clone());
        if cache.starts_with(&self.config.state_dir) && !include_tools {
            // Keep the cache, drop everything else in the state directory.
            if let Ok(entries) = fs::read_dir(&self.config.state_dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if !cache.starts_with(&path) {
                        doomed.push(path);
                    }
                }
            }
        } else {
            doomed.push(self.config.state_dir.clone());
        }
        if include_tools {
            doomed.push(cache.clone());
        }

        let mut removed = Vec::new();
        for path in doomed {
            if !path.exists() || removed.iter().any(|r: &PathBuf| path.starts_with(r)) {
                continue;
            }
            if self.config.root.starts_with(&path) {
                warn!(path = %path.display(), "refusing to remove the project root or its parent");
                continue;
            }
            if !self.config.dry_run {
                let result = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                result.map_err(|e| ConfigError::Invalid {
                    key: "clean".into(),
                    reason: format!("cannot remove '{}': {e}", path.display()),
                })?;
            }
            info!(path = %path.display(), dry_run = self.config.dry_run, "removed");
            removed.push(path);
        }
        Ok(removed)
    }

    /// Values every command template can use.
    pub fn template_vars(&self) -> TemplateVars {
        TemplateVars::new()
            .with("env", self.config.environment.as_str())
            .with("config_file", self.config.config_file().display().to_string())
            .with("root", self.config.root.display().to_string())
            .with("output_dir", self.config.output_dir.display().to_string())
            .with("version", self.metadata.version.as_str())
            .with("commit", self.metadata.commit.as_str())
            .with("build_time", self.metadata.built_at.as_str())
    }

    /// `BUILDWRIGHT_*` variables exported to every command.
    pub fn exported_env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("BUILDWRIGHT_ENV".to_string(), self.config.environment.clone()),
            (
                "BUILDWRIGHT_CONFIG_FILE".to_string(),
                self.config.config_file().display().to_string(),
            ),
            ("BUILDWRIGHT_ROOT".to_string(), self.config.root.display().to_string()),
            (
                "BUILDWRIGHT_OUTPUT_DIR".to_string(),
                self.config.output_dir.display().to_string(),
            ),
            ("BUILDWRIGHT_VERSION".to_string(), self.metadata.version.clone()),
            ("BUILDWRIGHT_COMMIT".to_string(), self.metadata.commit.clone()),
            ("BUILDWRIGHT_BUILD_TIME".to_string(), self.metadata.built_at.clone()),
        ])
    }

    fn preflight(&self, order: &[Task]) -> Result<(), BuildError> {
        let mut needs: Vec<(&'static str, String)> = Vec::new();
        if order.iter().any(|t| t.command.is_some()) {
            needs.push(("sh", "task commands".to_string()));
        }
        let mut seen = HashSet::new();
        for task in order {
            for name in &task.tools {
                let Some(spec) = self.registry.get(name) else {
                    continue;
                };
                if !seen.insert(name.as_str()) || self.provisioner.is_installed(spec) {
                    continue;
                }
                for req in self.provisioner.backend().requirements(&spec.method) {
                    needs.push((req, spec.to_string()));
                }
            }
        }
        let needs: Vec<(&str, &str)> = needs.iter().map(|(t, why)| (*t, why.as_str())).collect();
        preflight::check_required_tools(&needs)?;
        Ok(())
    }

    fn check_templates(&self) -> Result<(), TemplateError> {
        let base = self.template_vars();
        let mut with_target = base.clone();
        for name in TARGET_VARS {
            with_target.set(*name, "");
        }
        for task in self.graph.tasks() {
            let vars = if task.target.is_some() { &with_target } else { &base };
            if let Some(command) = &task.command {
                template::check(command, vars, &[TOOL_PREFIX])?;
            }
            for value in task.env.values() {
                template::check(value, vars, &[TOOL_PREFIX])?;
            }
        }
        Ok(())
    }
}

/// Replace every matrix task with one task per target plus an aggregate
/// under the original name.
///
/// Dependencies between matrix tasks are wired per target, so
/// `package:api:linux-amd64` waits for `build:api:linux-amd64` only.
fn expand_matrix(tasks: Vec<Task>, targets: &[BuildTarget]) -> Result<Vec<Task>, BuildError> {
    let matrix_names: HashSet<String> = tasks
        .iter()
        .filter(|t| t.matrix)
        .map(|t| t.name.clone())
        .collect();
    if matrix_names.is_empty() {
        return Ok(tasks);
    }

    let mut out = Vec::with_capacity(tasks.len() + matrix_names.len() * targets.len());
    for task in tasks {
        if !task.matrix {
            out.push(task);
            continue;
        }

        let mut expanded = Vec::with_capacity(targets.len());
        for target in targets {
            let label = target.label();
            let vars = target_vars(target);
            let mut t = task.clone();
            t.name = format!("{}:{label}", task.name);
            t.matrix = false;
            t.deps = task
                .deps
                .iter()
                .map(|d| {
                    if matrix_names.contains(d) {
                        format!("{d}:{label}")
                    } else {
                        d.clone()
                    }
                })
                .collect();
            t.inputs = render_all(&task.inputs, &vars)?;
            t.outputs = render_all(&task.outputs, &vars)?;
            t.target = Some(target.clone());
            expanded.push(t.name.clone());
            out.push(t);
        }

        out.push(Task {
            name: task.name,
            deps: expanded,
            phony: true,
            best_effort: task.best_effort,
            ..Task::default()
        });
    }
    Ok(out)
}

fn target_vars(target: &BuildTarget) -> TemplateVars {
    TemplateVars::new()
        .with("service", target.service.as_str())
        .with("os", target.platform.os.as_str())
        .with("arch", target.platform.arch.as_str())
        .with("output", target.output_path.display().to_string())
        .with("binary", target.binary_name.as_str())
}

fn render_all(paths: &[String], vars: &TemplateVars) -> Result<Vec<String>, TemplateError> {
    paths.iter().map(|p| template::render(p, vars)).collect()
}

/// Add tools referenced as `{{tool.<name>}}` to the task's tool list.
fn infer_tools(task: &mut Task, registry: &ToolRegistry) -> Result<(), ConfigError> {
    let mut templates: Vec<&str> = task.env.values().map(String::as_str).collect();
    if let Some(command) = &task.command {
        templates.push(command);
    }

    let mut referenced = Vec::new();
    for t in templates {
        let names = template::placeholders(t).map_err(|e| ConfigError::Task {
            task: task.name.clone(),
            reason: e.to_string(),
        })?;
        referenced.extend(
            names
                .into_iter()
                .filter_map(|n| n.strip_prefix(TOOL_PREFIX).map(str::to_string)),
        );
    }
    for name in referenced {
        if !task.tools.contains(&name) {
            task.tools.push(name);
        }
    }
    for name in &task.tools {
        if !registry.contains(name) {
            return Err(ConfigError::Task {
                task: task.name.clone(),
                reason: format!("uses unknown tool '{name}'"),
            });
        }
    }
    Ok(())
}
