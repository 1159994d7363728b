//! Parallel execution of a resolved task list.
//!
//! The coordinator thread owns all bookkeeping. Workers are scoped threads
//! that run one task each and report back over a channel; a task is
//! dispatched once every dependency has finished, and at most `workers` run
//! at a time. After the first fatal failure nothing new is started and the
//! tasks already running are allowed to finish.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, info_span, warn};

use crate::error::BuildError;
use crate::freshness::FreshnessTracker;
use crate::graph::Task;
use crate::process::Cmd;
use crate::template::{self, TemplateVars};
use crate::tools::{ToolError, ToolProvisioner, ToolRegistry};

/// Lines of captured output kept in failure reports.
const OUTPUT_TAIL: usize = 40;

/// A task's command did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task '{task}' failed{}", exit_detail(.status))]
    Failed {
        task: String,
        status: Option<i32>,
        output: String,
    },

    #[error("task '{task}' timed out after {}s", .timeout.as_secs())]
    Timeout {
        task: String,
        timeout: Duration,
        output: String,
    },

    #[error("task '{task}' could not be started: {reason}")]
    Spawn { task: String, reason: String },
}

impl TaskError {
    pub fn task(&self) -> &str {
        match self {
            TaskError::Failed { task, .. }
            | TaskError::Timeout { task, .. }
            | TaskError::Spawn { task, .. } => task,
        }
    }

    /// Captured stdout and stderr (empty for spawn failures).
    pub fn output(&self) -> &str {
        match self {
            TaskError::Failed { output, .. } | TaskError::Timeout { output, .. } => output,
            TaskError::Spawn { .. } => "",
        }
    }
}

fn exit_detail(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!(" with exit code {code}"),
        None => " (killed by signal)".to_string(),
    }
}

/// What happened to one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The command ran and succeeded (or the task is a pure aggregate).
    Ran,
    /// Outputs were fresh; nothing ran.
    UpToDate,
    /// A best-effort task failed; downstream work continued.
    SoftFailed,
    Failed,
    /// Not started because an earlier task failed fatally.
    Cancelled,
    /// Dry run: the command was rendered but not spawned.
    DryRun,
}

impl Outcome {
    pub fn label(self) -> &'static str {
        match self {
            Outcome::Ran => "ok",
            Outcome::UpToDate => "up-to-date",
            Outcome::SoftFailed => "warning",
            Outcome::Failed => "FAILED",
            Outcome::Cancelled => "cancelled",
            Outcome::DryRun => "dry-run",
        }
    }

    /// Whether dependents may start after this outcome.
    fn unblocks(self) -> bool {
        !matches!(self, Outcome::Failed | Outcome::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub task: String,
    /// Exit code of the command, when one ran to completion.
    pub status: Option<i32>,
    pub output: String,
    pub duration: Duration,
    pub outcome: Outcome,
}

impl ExecutionResult {
    fn new(task: &Task, outcome: Outcome) -> Self {
        Self {
            task: task.name.clone(),
            status: None,
            output: String::new(),
            duration: Duration::ZERO,
            outcome,
        }
    }
}

/// Everything a run produced, in task order.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub results: Vec<ExecutionResult>,
    /// Best-effort failures, one line each.
    pub warnings: Vec<String>,
    /// The first fatal error; `None` means the run succeeded.
    pub fatal: Option<BuildError>,
    pub duration: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.fatal.is_none()
    }

    pub fn result(&self, task: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.task == task)
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    /// Human-readable summary for the end of a run.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for r in &self.results {
            let _ = writeln!(
                out,
                "  {:<10} {:<40} {:>7.1}s",
                r.outcome.label(),
                r.task,
                r.duration.as_secs_f64()
            );
        }
        if !self.warnings.is_empty() {
            let _ = writeln!(out, "\nWarnings:");
            for w in &self.warnings {
                let _ = writeln!(out, "  - {w}");
            }
        }
        let _ = writeln!(
            out,
            "\n{} ran, {} up to date, {} warnings, {} failed, {} cancelled in {:.1}s",
            self.count(Outcome::Ran) + self.count(Outcome::DryRun),
            self.count(Outcome::UpToDate),
            self.count(Outcome::SoftFailed),
            self.count(Outcome::Failed),
            self.count(Outcome::Cancelled),
            self.duration.as_secs_f64()
        );
        if let Some(err) = &self.fatal {
            let _ = writeln!(out, "\nError ({}): {err}", err.kind());
            if let Some(output) = err.captured_output().filter(|o| !o.trim().is_empty()) {
                let _ = writeln!(out, "\nOutput:\n{}", tail(output, OUTPUT_TAIL));
            }
        }
        out
    }
}

fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub workers: usize,
    /// Applies to tasks without their own timeout.
    pub default_timeout: Option<Duration>,
    pub dry_run: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            default_timeout: None,
            dry_run: false,
        }
    }
}

/// Runs tasks against one project root with shared tool and freshness state.
pub struct Scheduler<'a> {
    root: &'a Path,
    registry: &'a ToolRegistry,
    provisioner: &'a ToolProvisioner,
    freshness: &'a FreshnessTracker,
    vars: TemplateVars,
    env: BTreeMap<String, String>,
    options: SchedulerOptions,
}

/// Result of one task as seen by the coordinator.
struct Finished {
    index: usize,
    result: ExecutionResult,
    warning: Option<String>,
    fatal: Option<BuildError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Running,
    Done(Outcome),
}

impl<'a> Scheduler<'a> {
    pub fn new(
        root: &'a Path,
        registry: &'a ToolRegistry,
        provisioner: &'a ToolProvisioner,
        freshness: &'a FreshnessTracker,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            root,
            registry,
            provisioner,
            freshness,
            vars: TemplateVars::new(),
            env: BTreeMap::new(),
            options,
        }
    }

    /// Invocation-wide template values (`env`, `version`, `root`, ...).
    pub fn with_vars(mut self, vars: TemplateVars) -> Self {
        self.vars = vars;
        self
    }

    /// Environment variables exported to every command.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Run `tasks`, which must be in dependency order (as produced by
    /// [`crate::graph::TaskGraph::resolve`]).
    pub fn run(&self, tasks: &[Task]) -> RunReport {
        let start = Instant::now();
        let workers = self.options.workers.max(1);
        let index: HashMap<&str, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();
        // Dependencies outside the list were satisfied by an earlier run.
        let deps: Vec<Vec<usize>> = tasks
            .iter()
            .map(|t| {
                t.deps
                    .iter()
                    .filter_map(|d| index.get(d.as_str()).copied())
                    .collect()
            })
            .collect();

        let mut slots = vec![Slot::Pending; tasks.len()];
        let mut results: Vec<Option<ExecutionResult>> = vec![None; tasks.len()];
        let mut warnings = Vec::new();
        let mut fatal: Option<BuildError> = None;

        info!(tasks = tasks.len(), workers, dry_run = self.options.dry_run, "starting run");

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<Finished>();
            let mut running = 0usize;

            loop {
                if fatal.is_none() {
                    while running < workers {
                        let Some(next) = (0..tasks.len()).find(|&i| {
                            slots[i] == Slot::Pending
                                && deps[i].iter().all(|&d| matches!(slots[d], Slot::Done(o) if o.unblocks()))
                        }) else {
                            break;
                        };
                        slots[next] = Slot::Running;
                        running += 1;
                        let tx = tx.clone();
                        let task = &tasks[next];
                        scope.spawn(move || {
                            let finished = self.execute(next, task);
                            let _ = tx.send(finished);
                        });
                    }
                }

                if running == 0 {
                    break;
                }
                let Ok(finished) = rx.recv() else {
                    break;
                };
                running -= 1;
                slots[finished.index] = Slot::Done(finished.result.outcome);
                if let Some(w) = finished.warning {
                    warnings.push(w);
                }
                if let Some(err) = finished.fatal {
                    if fatal.is_none() {
                        warn!(task = %finished.result.task, error = %err, "fatal failure; cancelling pending tasks");
                        fatal = Some(err);
                    }
                }
                results[finished.index] = Some(finished.result);
            }
        });

        // Anything never started was either cancelled or blocked by a failure.
        for (i, task) in tasks.iter().enumerate() {
            if results[i].is_none() {
                results[i] = Some(ExecutionResult::new(task, Outcome::Cancelled));
            }
        }

        let report = RunReport {
            results: results.into_iter().flatten().collect(),
            warnings,
            fatal,
            duration: start.elapsed(),
        };
        info!(
            success = report.is_success(),
            ran = report.count(Outcome::Ran),
            up_to_date = report.count(Outcome::UpToDate),
            warnings = report.warnings.len(),
            duration_ms = report.duration.as_millis() as u64,
            "run finished"
        );
        report
    }

    fn execute(&self, index: usize, task: &Task) -> Finished {
        let span = info_span!("task", name = %task.name);
        let _enter = span.enter();
        let started = Instant::now();

        let (mut result, error) = self.execute_inner(task);
        result.duration = started.elapsed();

        let (warning, fatal) = match error {
            None => (None, None),
            // Missing tools are an environment problem, not a task failure.
            Some(err @ BuildError::Tool(_)) => {
                result.outcome = Outcome::Failed;
                (None, Some(err))
            }
            Some(err) if task.best_effort => {
                warn!(error = %err, "best-effort task failed; continuing");
                result.outcome = Outcome::SoftFailed;
                (Some(err.to_string()), None)
            }
            Some(err) => {
                result.outcome = Outcome::Failed;
                (None, Some(err))
            }
        };
        Finished {
            index,
            result,
            warning,
            fatal,
        }
    }

    fn execute_inner(&self, task: &Task) -> (ExecutionResult, Option<BuildError>) {
        let Some(command) = &task.command else {
            debug!("aggregate task");
            return (ExecutionResult::new(task, Outcome::Ran), None);
        };

        if !self.freshness.is_stale(task) {
            info!("up to date");
            return (ExecutionResult::new(task, Outcome::UpToDate), None);
        }

        let tool_paths = match self.tool_paths(task) {
            Ok(paths) => paths,
            Err(err) => return (ExecutionResult::new(task, Outcome::Failed), Some(err.into())),
        };

        let mut vars = self.vars.clone();
        for (name, path) in &tool_paths {
            vars.set(format!("tool.{name}"), path.display().to_string());
        }
        let mut env = self.env.clone();
        if let Some(target) = &task.target {
            let output = target.output_path.display().to_string();
            vars.set("service", target.service.as_str())
                .set("os", target.platform.os.as_str())
                .set("arch", target.platform.arch.as_str())
                .set("output", output.as_str())
                .set("binary", target.binary_name.as_str());
            env.insert("BUILDWRIGHT_TARGET_SERVICE".into(), target.service.clone());
            env.insert("BUILDWRIGHT_TARGET_OS".into(), target.platform.os.clone());
            env.insert("BUILDWRIGHT_TARGET_ARCH".into(), target.platform.arch.clone());
            env.insert("BUILDWRIGHT_OUTPUT".into(), output);
            env.insert("BUILDWRIGHT_BINARY".into(), target.binary_name.clone());
        }

        let rendered = match template::render(command, &vars) {
            Ok(cmd) => cmd,
            Err(err) => return (ExecutionResult::new(task, Outcome::Failed), Some(err.into())),
        };
        for (key, value) in &task.env {
            match template::render(value, &vars) {
                Ok(v) => {
                    env.insert(key.clone(), v);
                }
                Err(err) => return (ExecutionResult::new(task, Outcome::Failed), Some(err.into())),
            }
        }
        env.insert("PATH".into(), search_path(tool_paths.values().map(|p| p.as_path())));

        if self.options.dry_run {
            info!(command = %rendered, "dry run");
            let mut result = ExecutionResult::new(task, Outcome::DryRun);
            result.output = rendered;
            return (result, None);
        }

        let dir = match &task.workdir {
            Some(rel) => self.root.join(rel),
            None => self.root.to_path_buf(),
        };
        // A zero task timeout switches the deadline off, default included.
        let timeout = match task.timeout {
            Some(t) if t.is_zero() => None,
            Some(t) => Some(t),
            None => self.options.default_timeout,
        };
        info!(command = %rendered, "running");

        let output = match Cmd::shell(rendered)
            .current_dir(dir)
            .envs(env)
            .timeout_opt(timeout)
            .capture()
        {
            Ok(output) => output,
            Err(err) => {
                let err = TaskError::Spawn {
                    task: task.name.clone(),
                    reason: err.to_string(),
                };
                return (ExecutionResult::new(task, Outcome::Failed), Some(err.into()));
            }
        };

        let mut result = ExecutionResult {
            task: task.name.clone(),
            status: output.status,
            output: output.output.clone(),
            duration: output.duration,
            outcome: Outcome::Ran,
        };

        if output.timed_out {
            let err = TaskError::Timeout {
                task: task.name.clone(),
                timeout: timeout.unwrap_or_default(),
                output: output.output,
            };
            result.outcome = Outcome::Failed;
            return (result, Some(err.into()));
        }
        if output.status != Some(0) {
            let err = TaskError::Failed {
                task: task.name.clone(),
                status: output.status,
                output: output.output,
            };
            result.outcome = Outcome::Failed;
            return (result, Some(err.into()));
        }

        if let Err(err) = self.freshness.record(task) {
            warn!(error = %format!("{err:#}"), "could not record input fingerprint");
        }
        info!(elapsed_ms = output.duration.as_millis() as u64, "done");
        (result, None)
    }

    /// Provision (or, in dry-run mode, just locate) every tool the task uses.
    fn tool_paths(&self, task: &Task) -> Result<BTreeMap<String, std::path::PathBuf>, ToolError> {
        let mut paths = BTreeMap::new();
        for name in &task.tools {
            let spec = self.registry.get(name).ok_or_else(|| ToolError::UnknownTool {
                name: name.clone(),
                required_by: Some(task.name.clone()),
            })?;
            let path = if self.options.dry_run {
                self.provisioner.binary_path(spec)
            } else {
                self.provisioner.ensure(spec)?
            };
            paths.insert(name.clone(), path);
        }
        Ok(paths)
    }
}

/// `PATH` with each tool's directory in front of the inherited value.
fn search_path<'p>(tools: impl Iterator<Item = &'p Path>) -> String {
    let mut parts: Vec<std::path::PathBuf> = Vec::new();
    for tool in tools {
        if let Some(dir) = tool.parent() {
            if !parts.iter().any(|p| p == dir) {
                parts.push(dir.to_path_buf());
            }
        }
    }
    if let Some(inherited) = std::env::var_os("PATH") {
        parts.extend(std::env::split_paths(&inherited));
    }
    std::env::join_paths(parts)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}
