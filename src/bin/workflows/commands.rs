use anyhow::{bail, Context, Result};
use buildwright::error::EXIT_OK;
use buildwright::tools::EnsureOutcome;
use buildwright::RunReport;
use tracing::info;

use super::Session;

/// Tasks `all` runs, in order, when the manifest does not define its own.
const PIPELINE: &[&str] = &["generate", "lint", "test", "build", "package"];

pub(crate) fn run_stage(session: &Session, stage: &str) -> Result<i32> {
    run_tasks(session, &[stage.to_string()])
}

pub(crate) fn run_pipeline(session: &Session) -> Result<i32> {
    let graph = session.engine.graph();
    let targets: Vec<String> = if graph.contains("all") {
        vec!["all".to_string()]
    } else {
        PIPELINE
            .iter()
            .filter(|name| graph.contains(name))
            .map(|name| name.to_string())
            .collect()
    };
    if targets.is_empty() {
        bail!(
            "'{}' defines neither an 'all' task nor any of: {}",
            session.manifest_path.display(),
            PIPELINE.join(", ")
        );
    }
    run_tasks(session, &targets)
}

pub(crate) fn run_tasks(session: &Session, tasks: &[String]) -> Result<i32> {
    let report = session
        .engine
        .run(tasks)
        .with_context(|| format!("running {}", tasks.join(", ")))?;
    Ok(finish(&report))
}

pub(crate) fn print_plan(session: &Session, tasks: &[String]) -> Result<i32> {
    let order = session
        .engine
        .plan(tasks)
        .with_context(|| format!("planning {}", tasks.join(", ")))?;

    for (i, task) in order.iter().enumerate() {
        let mut notes = Vec::new();
        if !task.deps.is_empty() {
            notes.push(format!("after {}", task.deps.join(", ")));
        }
        if !task.tools.is_empty() {
            notes.push(format!("tools {}", task.tools.join(", ")));
        }
        if task.best_effort {
            notes.push("best-effort".to_string());
        }
        if task.command.is_none() {
            notes.push("aggregate".to_string());
        }
        if notes.is_empty() {
            println!("{:>3}. {}", i + 1, task.name);
        } else {
            println!("{:>3}. {}  ({})", i + 1, task.name, notes.join("; "));
        }
    }
    Ok(EXIT_OK)
}

/// Run the manifest's own `clean` task if it has one, then remove
/// buildwright's outputs and state.
pub(crate) fn clean(session: &Session, include_tools: bool) -> Result<i32> {
    let engine = &session.engine;
    if engine.graph().contains("clean") {
        let report = engine.run(&["clean"]).context("running clean task")?;
        let code = finish(&report);
        if code != EXIT_OK {
            return Ok(code);
        }
    }

    let removed = engine.clean(include_tools).context("removing build state")?;
    if removed.is_empty() {
        println!("Nothing to clean.");
    }
    for path in removed {
        if engine.config().dry_run {
            println!("would remove {}", path.display());
        } else {
            println!("removed {}", path.display());
        }
    }
    Ok(EXIT_OK)
}

pub(crate) fn list_tools(session: &Session) -> Result<i32> {
    let engine = &session.engine;
    let provisioner = engine.provisioner();
    println!("Tool cache: {}", provisioner.cache_dir().display());
    for spec in engine.registry().iter() {
        let state = if provisioner.is_installed(spec) {
            "installed"
        } else {
            "missing"
        };
        println!(
            "  {:<24} {:<9} {:<8} {}",
            spec.to_string(),
            state,
            spec.method.kind(),
            spec.method.source()
        );
    }

    let unpinned: Vec<_> = provisioner
        .installed()?
        .into_iter()
        .filter(|r| {
            engine
                .registry()
                .get(&r.name)
                .map_or(true, |spec| spec.version != r.version)
        })
        .collect();
    if !unpinned.is_empty() {
        println!("\nCached but not pinned:");
        for receipt in unpinned {
            println!("  {}@{}", receipt.name, receipt.version);
        }
    }
    Ok(EXIT_OK)
}

pub(crate) fn ensure_tools(session: &Session, names: &[String]) -> Result<i32> {
    let ensured = session
        .engine
        .ensure_tools(names)
        .context("provisioning tools")?;
    for (spec, path, outcome) in ensured {
        let verb = match outcome {
            EnsureOutcome::Cached => "cached",
            EnsureOutcome::Installed => "installed",
        };
        println!("  {:<24} {:<9} {}", spec.to_string(), verb, path.display());
    }
    Ok(EXIT_OK)
}

fn finish(report: &RunReport) -> i32 {
    print!("{}", report.summary());
    match &report.fatal {
        Some(err) => err.exit_code(),
        None => {
            info!(tasks = report.results.len(), "run complete");
            EXIT_OK
        }
    }
}
