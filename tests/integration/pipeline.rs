use std::fs;

use buildwright::tools::{ToolRegistry, ToolSpec};
use buildwright::{Outcome, Task};
use pretty_assertions::assert_eq;

use crate::common::{CountingBackend, Project};

fn codegen_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register(ToolSpec::module("codegen", "1.0", "example.com/tools/codegen"))
        .unwrap();
    registry
}

fn gen_task() -> Task {
    Task::new("gen")
        .command("mkdir -p gen && {{tool.codegen}} api/service.proto > gen/api.txt")
        .inputs(["api/*.proto"])
        .outputs(["gen/api.txt"])
}

#[test]
fn second_request_installs_and_runs_nothing() {
    let project = Project::new();
    project.write_old("api/service.proto", "syntax = \"proto3\";\n");

    let first = CountingBackend::new(project.invocation_log());
    let engine = project
        .engine(project.config(), codegen_registry(), vec![gen_task()], first.clone())
        .unwrap();
    let report = engine.run(&["gen"]).unwrap();

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report.result("gen").unwrap().outcome, Outcome::Ran);
    assert_eq!(first.installs(), 1);
    assert_eq!(project.invocations(), 1);
    let generated = fs::read_to_string(project.path("gen/api.txt")).unwrap();
    assert!(generated.contains("api/service.proto"));

    // A fresh invocation sharing the same cache and outputs.
    let second = CountingBackend::new(project.invocation_log());
    let engine = project
        .engine(project.config(), codegen_registry(), vec![gen_task()], second.clone())
        .unwrap();
    let report = engine.run(&["gen"]).unwrap();

    assert!(report.is_success());
    assert_eq!(report.result("gen").unwrap().outcome, Outcome::UpToDate);
    assert_eq!(second.installs(), 0);
    assert_eq!(project.invocations(), 1);
}

#[test]
fn touched_input_reruns_without_reinstalling() {
    let project = Project::new();
    project.write_old("api/service.proto", "syntax = \"proto3\";\n");
    let backend = CountingBackend::new(project.invocation_log());

    let engine = project
        .engine(project.config(), codegen_registry(), vec![gen_task()], backend.clone())
        .unwrap();
    engine.run(&["gen"]).unwrap();

    // Backdate the output so the (now newer) input makes it stale.
    project.write_old("gen/api.txt", "old\n");
    project.write("api/service.proto", "syntax = \"proto3\";\npackage x;\n");

    let report = engine.run(&["gen"]).unwrap();
    assert_eq!(report.result("gen").unwrap().outcome, Outcome::Ran);
    assert_eq!(backend.installs(), 1);
    assert_eq!(project.invocations(), 2);
}

#[test]
fn pipeline_runs_in_dependency_order() {
    let project = Project::new();
    let log = project.path("order.log");
    let step = |name: &str| format!("echo {name} >> '{}'", log.display());
    let tasks = vec![
        Task::new("all").deps(["package"]),
        Task::new("package").deps(["build", "test"]).command(step("package")),
        Task::new("build").deps(["generate"]).command(step("build")),
        Task::new("test").deps(["generate"]).command(step("test")),
        Task::new("generate").command(step("generate")),
    ];
    let backend = CountingBackend::new(project.invocation_log());
    let engine = project
        .engine(project.config(), ToolRegistry::new(), tasks, backend)
        .unwrap();

    let report = engine.run(&["all"]).unwrap();
    assert!(report.is_success(), "{}", report.summary());

    let order = fs::read_to_string(&log).unwrap();
    let order: Vec<&str> = order.lines().collect();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], "generate");
    assert_eq!(order[3], "package");
}

#[test]
fn dry_run_spawns_and_installs_nothing() {
    let project = Project::new();
    project.write_old("api/service.proto", "syntax = \"proto3\";\n");
    let mut config = project.config();
    config.dry_run = true;
    let backend = CountingBackend::new(project.invocation_log());

    let engine = project
        .engine(config, codegen_registry(), vec![gen_task()], backend.clone())
        .unwrap();
    let report = engine.run(&["gen"]).unwrap();

    assert_eq!(report.result("gen").unwrap().outcome, Outcome::DryRun);
    assert_eq!(backend.installs(), 0);
    assert!(!project.path("gen").exists());
}

#[test]
fn exported_metadata_reaches_commands() {
    let project = Project::new();
    let mut config = project.config();
    config.environment = "staging".into();
    config.metadata.insert("version".into(), "1.4.0".into());
    let out = project.path("meta.txt");
    let task = Task::new("meta").command(format!(
        "echo \"$BUILDWRIGHT_ENV {{{{version}}}} $BUILDWRIGHT_CONFIG_FILE\" > '{}'",
        out.display()
    ));
    let backend = CountingBackend::new(project.invocation_log());
    let engine = project
        .engine(config, ToolRegistry::new(), vec![task], backend)
        .unwrap();

    let report = engine.run(&["meta"]).unwrap();
    assert!(report.is_success(), "{}", report.summary());
    let text = fs::read_to_string(out).unwrap();
    assert!(text.starts_with("staging 1.4.0 "));
    assert!(text.trim_end().ends_with("config/staging.yaml"));
}
