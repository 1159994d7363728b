use std::time::{Duration, Instant};

use buildwright::error::{
    BuildError, EXIT_CONFIG, EXIT_GRAPH, EXIT_PROVISION, EXIT_TASK, EXIT_TIMEOUT,
};
use buildwright::graph::GraphError;
use buildwright::tools::{ToolRegistry, ToolSpec};
use buildwright::{Outcome, Task};
use pretty_assertions::assert_eq;

use crate::common::{CountingBackend, Project};

#[test]
fn best_effort_failure_warns_without_blocking_independent_task() {
    let project = Project::new();
    let marker = project.path("tested");
    let tasks = vec![
        Task::new("lint").command("echo 'style nit' >&2; exit 3").best_effort(true),
        Task::new("test").command(format!("touch '{}'", marker.display())),
        Task::new("check").deps(["lint", "test"]),
    ];
    let backend = CountingBackend::new(project.invocation_log());
    let engine = project
        .engine(project.config(), ToolRegistry::new(), tasks, backend)
        .unwrap();

    let report = engine.run(&["check"]).unwrap();

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report.result("lint").unwrap().outcome, Outcome::SoftFailed);
    assert_eq!(report.result("test").unwrap().outcome, Outcome::Ran);
    assert_eq!(report.result("check").unwrap().outcome, Outcome::Ran);
    assert!(marker.exists());
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("lint"));
    assert!(report.summary().contains("Warnings:"));
}

#[test]
fn failed_task_halts_dependents_and_carries_output() {
    let project = Project::new();
    let marker = project.path("packaged");
    let tasks = vec![
        Task::new("build").command("echo 'undefined: Foo' >&2; exit 2"),
        Task::new("package")
            .deps(["build"])
            .command(format!("touch '{}'", marker.display())),
    ];
    let backend = CountingBackend::new(project.invocation_log());
    let engine = project
        .engine(project.config(), ToolRegistry::new(), tasks, backend)
        .unwrap();

    let report = engine.run(&["package"]).unwrap();

    let fatal = report.fatal.as_ref().unwrap();
    assert_eq!(fatal.exit_code(), EXIT_TASK);
    assert!(fatal.captured_output().unwrap().contains("undefined: Foo"));
    assert_eq!(report.result("build").unwrap().outcome, Outcome::Failed);
    assert_eq!(report.result("build").unwrap().status, Some(2));
    assert_eq!(report.result("package").unwrap().outcome, Outcome::Cancelled);
    assert!(!marker.exists());
    assert!(report.summary().contains("undefined: Foo"));
}

#[test]
fn slow_task_times_out() {
    let project = Project::new();
    let tasks = vec![Task::new("hang")
        .command("sleep 30")
        .timeout(Duration::from_millis(300))];
    let backend = CountingBackend::new(project.invocation_log());
    let engine = project
        .engine(project.config(), ToolRegistry::new(), tasks, backend)
        .unwrap();

    let start = Instant::now();
    let report = engine.run(&["hang"]).unwrap();

    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(report.fatal.as_ref().unwrap().exit_code(), EXIT_TIMEOUT);
}

#[test]
fn cycle_is_rejected_before_anything_runs() {
    let project = Project::new();
    let marker = project.path("ran");
    let touch = format!("touch '{}'", marker.display());
    let tasks = vec![
        Task::new("a").deps(["b"]).command(touch.clone()),
        Task::new("b").deps(["a"]).command(touch),
    ];
    let backend = CountingBackend::new(project.invocation_log());
    let err = project
        .engine(project.config(), ToolRegistry::new(), tasks, backend)
        .err()
        .unwrap();

    assert_eq!(err.exit_code(), EXIT_GRAPH);
    match err {
        BuildError::Graph(GraphError::Cycle { chain }) => {
            assert!(chain.contains(&"a".to_string()));
            assert!(chain.contains(&"b".to_string()));
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert!(!marker.exists());
}

#[test]
fn unknown_target_is_a_graph_error() {
    let project = Project::new();
    let backend = CountingBackend::new(project.invocation_log());
    let engine = project
        .engine(
            project.config(),
            ToolRegistry::new(),
            vec![Task::new("build").command("true")],
            backend,
        )
        .unwrap();

    let err = engine.run(&["deploy"]).err().unwrap();
    assert!(matches!(
        err,
        BuildError::Graph(GraphError::UnknownTask { .. })
    ));
    assert_eq!(err.exit_code(), EXIT_GRAPH);
}

#[test]
fn reference_to_unregistered_tool_is_a_config_error() {
    let project = Project::new();
    let backend = CountingBackend::new(project.invocation_log());
    let err = project
        .engine(
            project.config(),
            ToolRegistry::new(),
            vec![Task::new("gen").command("{{tool.protoc}} --version")],
            backend,
        )
        .err()
        .unwrap();
    assert_eq!(err.exit_code(), EXIT_CONFIG);
}

#[test]
fn fetch_failure_fails_the_task_and_spares_the_cache() {
    let project = Project::new();
    let mut registry = ToolRegistry::new();
    registry
        .register(ToolSpec::module("codegen", "1.0", "example.com/tools/codegen"))
        .unwrap();
    let backend = CountingBackend::failing(project.invocation_log());
    let engine = project
        .engine(
            project.config(),
            registry.clone(),
            vec![Task::new("gen").command("{{tool.codegen}}").best_effort(true)],
            backend.clone(),
        )
        .unwrap();

    let report = engine.run(&["gen"]).unwrap();

    let fatal = report.fatal.as_ref().unwrap();
    assert_eq!(fatal.exit_code(), EXIT_PROVISION);
    assert_eq!(backend.installs(), 1);
    assert_eq!(project.invocations(), 0);
    let spec = registry.get("codegen").unwrap();
    assert!(!engine.provisioner().is_installed(spec));
}
