use std::collections::HashSet;
use std::fs;

use buildwright::error::{BuildError, EXIT_MATRIX};
use buildwright::matrix::{MatrixError, Selector};
use buildwright::tools::ToolRegistry;
use buildwright::{Outcome, Task};
use pretty_assertions::assert_eq;

use crate::common::{CountingBackend, Project};

fn build_task() -> Task {
    Task::new("build")
        .command("echo \"{{service}} {{os}}/{{arch}} {{version}}\" > {{output}}")
        .matrix(true)
}

#[test]
fn two_services_on_two_platforms_build_four_artifacts() {
    let project = Project::new();
    project.service("api");
    project.service("worker");
    let mut config = project.config();
    config.services = Selector::All;
    config.platforms = Selector::parse("linux/amd64,darwin/arm64");
    config.metadata.insert("version".into(), "2.0.0".into());

    let backend = CountingBackend::new(project.invocation_log());
    let engine = project
        .engine(config, ToolRegistry::new(), vec![build_task()], backend)
        .unwrap();

    let targets = engine.targets();
    assert_eq!(targets.len(), 4);
    let paths: HashSet<_> = targets.iter().map(|t| t.output_path.clone()).collect();
    assert_eq!(paths.len(), 4);
    assert!(targets.iter().all(|t| t.metadata == *engine.metadata()));

    let report = engine.run(&["build"]).unwrap();
    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report.count(Outcome::Ran), 5);

    for target in targets {
        let text = fs::read_to_string(&target.output_path).unwrap();
        assert_eq!(
            text.trim_end(),
            format!("{} {} 2.0.0", target.service, target.platform)
        );
    }
    assert!(report.result("build:api:darwin-arm64").is_some());
}

#[test]
fn one_service_selection_shares_metadata() {
    let project = Project::new();
    project.service("api");
    project.service("worker");
    let mut config = project.config();
    config.services = Selector::parse("worker");
    config.platforms = Selector::parse("linux/amd64");

    let backend = CountingBackend::new(project.invocation_log());
    let engine = project
        .engine(config, ToolRegistry::new(), vec![build_task()], backend)
        .unwrap();

    let labels: Vec<String> = engine.targets().iter().map(|t| t.label()).collect();
    assert_eq!(labels, vec!["worker:linux-amd64"]);
    let plan: Vec<String> = engine
        .plan(&["build"])
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(plan, vec!["build:worker:linux-amd64", "build"]);
}

#[test]
fn colliding_artifacts_fail_before_anything_runs() {
    let project = Project::new();
    project.service("api");
    project.service("API");
    let marker = project.path("ran");
    let task = Task::new("build")
        .command(format!("touch '{}' {{{{output}}}}", marker.display()))
        .matrix(true);
    let mut config = project.config();
    config.services = Selector::All;
    config.platforms = Selector::parse("linux/amd64");

    let backend = CountingBackend::new(project.invocation_log());
    let err = project
        .engine(config, ToolRegistry::new(), vec![task], backend)
        .err()
        .unwrap();

    assert!(matches!(
        err,
        BuildError::Matrix(MatrixError::DuplicateArtifact { .. })
    ));
    assert_eq!(err.exit_code(), EXIT_MATRIX);
    assert!(!marker.exists());
}

#[test]
fn unsupported_platform_is_rejected() {
    let project = Project::new();
    project.service("api");
    let mut config = project.config();
    config.platforms = Selector::parse("plan9/mips");

    let backend = CountingBackend::new(project.invocation_log());
    let err = project
        .engine(config, ToolRegistry::new(), vec![build_task()], backend)
        .err()
        .unwrap();
    assert_eq!(err.exit_code(), EXIT_MATRIX);
}

#[test]
fn matrix_task_without_declared_outputs_runs_every_time() {
    let project = Project::new();
    project.service("api");
    let log = project.path("builds.log");
    let task = Task::new("build")
        .command(format!(
            "echo {{{{service}}}} >> '{}' && touch {{{{output}}}}",
            log.display()
        ))
        .matrix(true);
    let mut config = project.config();
    config.platforms = Selector::parse("linux/amd64");

    let backend = CountingBackend::new(project.invocation_log());
    let engine = project
        .engine(config, ToolRegistry::new(), vec![task], backend)
        .unwrap();

    for _ in 0..2 {
        let report = engine.run(&["build"]).unwrap();
        assert!(report.is_success(), "{}", report.summary());
        assert_eq!(
            report.result("build:api:linux-amd64").unwrap().outcome,
            Outcome::Ran
        );
    }
    assert_eq!(fs::read_to_string(&log).unwrap(), "api\napi\n");
}
