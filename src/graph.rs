//! Task graph: declared tasks, dependency closure, and cycle detection.
//!
//! Tasks are kept in declaration order. Resolution is a depth-first walk from
//! the requested task that visits dependencies in the order they were
//! declared, so the same graph always yields the same execution order.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::matrix::BuildTarget;

/// Errors raised while building or resolving the graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("unknown task '{name}'{}", required_by(.referenced_by))]
    UnknownTask {
        name: String,
        referenced_by: Option<String>,
    },

    #[error("dependency cycle detected: {}", .chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    #[error("task '{0}' is declared more than once")]
    DuplicateTask(String),
}

fn required_by(referenced_by: &Option<String>) -> String {
    referenced_by
        .as_ref()
        .map(|parent| format!(" (required by '{parent}')"))
        .unwrap_or_default()
}

/// A named unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Task {
    /// Unique task name.
    pub name: String,
    /// Dependency names, in declaration order.
    pub deps: Vec<String>,
    /// Shell command template. `None` for pure aggregate tasks.
    pub command: Option<String>,
    /// Input paths or globs, relative to the project root.
    pub inputs: Vec<String>,
    /// Output paths, relative to the project root.
    pub outputs: Vec<String>,
    /// Always re-run, regardless of freshness.
    pub phony: bool,
    /// Failure is reported as a warning and does not halt the run.
    pub best_effort: bool,
    /// Registry tools this task needs provisioned before it runs.
    pub tools: Vec<String>,
    /// Per-task timeout; falls back to the invocation default.
    pub timeout: Option<Duration>,
    /// Working directory relative to the project root.
    pub workdir: Option<PathBuf>,
    /// Extra environment variables (values are templates).
    pub env: BTreeMap<String, String>,
    /// Expand into one task per build target.
    pub matrix: bool,
    /// The build target this task was expanded for.
    pub target: Option<BuildTarget>,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    pub fn outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(outputs.into_iter().map(Into::into));
        self
    }

    pub fn tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn phony(mut self, phony: bool) -> Self {
        self.phony = phony;
        self
    }

    pub fn best_effort(mut self, best_effort: bool) -> Self {
        self.best_effort = best_effort;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn matrix(mut self, matrix: bool) -> Self {
        self.matrix = matrix;
        self
    }

    /// A task with no declared outputs is implicitly phony.
    pub fn is_phony(&self) -> bool {
        self.phony || self.outputs.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

/// Mapping from task name to definition, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from tasks in declaration order.
    pub fn from_tasks<I>(tasks: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = Task>,
    {
        let mut graph = Self::new();
        for task in tasks {
            graph.add(task)?;
        }
        Ok(graph)
    }

    /// Declare a task. Dependencies may refer to tasks declared later.
    pub fn add(&mut self, task: Task) -> Result<(), GraphError> {
        if self.index.contains_key(&task.name) {
            return Err(GraphError::DuplicateTask(task.name));
        }
        self.index.insert(task.name.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.index.get(name).map(|&i| &self.tasks[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.name.as_str())
    }

    /// Tasks that list `name` as a direct dependency.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.deps.iter().any(|d| d == name))
            .map(|t| t.name.as_str())
            .collect()
    }

    /// Dependency closure of `target` in topological order.
    ///
    /// Every task appears after all of its dependencies and exactly once.
    pub fn resolve(&self, target: &str) -> Result<Vec<Task>, GraphError> {
        self.resolve_all(&[target])
    }

    /// Dependency closure of several roots, merged into one order.
    pub fn resolve_all<S: AsRef<str>>(&self, targets: &[S]) -> Result<Vec<Task>, GraphError> {
        let mut marks = vec![Mark::Unvisited; self.tasks.len()];
        let mut order = Vec::new();
        for target in targets {
            let target = target.as_ref();
            let idx = self.lookup(target, None)?;
            let mut path = Vec::new();
            self.visit(idx, &mut marks, &mut path, &mut order)?;
        }
        Ok(order.into_iter().map(|i| self.tasks[i].clone()).collect())
    }

    /// Check the whole graph for unknown dependencies and cycles.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut marks = vec![Mark::Unvisited; self.tasks.len()];
        let mut order = Vec::with_capacity(self.tasks.len());
        for idx in 0..self.tasks.len() {
            let mut path = Vec::new();
            self.visit(idx, &mut marks, &mut path, &mut order)?;
        }
        Ok(())
    }

    fn lookup(&self, name: &str, referenced_by: Option<&str>) -> Result<usize, GraphError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownTask {
                name: name.to_string(),
                referenced_by: referenced_by.map(str::to_string),
            })
    }

    fn visit(
        &self,
        idx: usize,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<(), GraphError> {
        match marks[idx] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                let start = path.iter().position(|&i| i == idx).unwrap_or(0);
                let mut chain: Vec<String> = path[start..]
                    .iter()
                    .map(|&i| self.tasks[i].name.clone())
                    .collect();
                chain.push(self.tasks[idx].name.clone());
                return Err(GraphError::Cycle { chain });
            }
            Mark::Unvisited => {}
        }

        marks[idx] = Mark::Visiting;
        path.push(idx);
        let task = &self.tasks[idx];
        for dep in &task.deps {
            let dep_idx = self.lookup(dep, Some(&task.name))?;
            self.visit(dep_idx, marks, path, order)?;
        }
        path.pop();
        marks[idx] = Mark::Done;
        order.push(idx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.name.as_str()).collect()
    }

    fn graph(edges: &[(&str, &[&str])]) -> TaskGraph {
        TaskGraph::from_tasks(
            edges
                .iter()
                .map(|(name, deps)| Task::new(*name).deps(deps.iter().copied())),
        )
        .unwrap()
    }

    #[test]
    fn dependencies_come_first() {
        let g = graph(&[
            ("build", &["generate", "lint"]),
            ("generate", &[]),
            ("lint", &["generate"]),
            ("package", &["build"]),
        ]);
        let order = g.resolve("package").unwrap();
        assert_eq!(names(&order), vec!["generate", "lint", "build", "package"]);
    }

    #[test]
    fn diamond_collapses_to_single_execution() {
        let g = graph(&[
            ("gen", &[]),
            ("left", &["gen"]),
            ("right", &["gen"]),
            ("top", &["left", "right"]),
        ]);
        let order = g.resolve("top").unwrap();
        assert_eq!(names(&order), vec!["gen", "left", "right", "top"]);
    }

    #[test]
    fn declaration_order_breaks_ties() {
        let g = graph(&[("all", &["b", "a"]), ("a", &[]), ("b", &[])]);
        assert_eq!(names(&g.resolve("all").unwrap()), vec!["b", "a", "all"]);
    }

    #[test]
    fn resolve_only_includes_the_closure() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("unrelated", &[])]);
        assert_eq!(names(&g.resolve("b").unwrap()), vec!["a", "b"]);
    }

    #[test]
    fn two_task_cycle_names_both_from_any_entry() {
        let g = graph(&[("a", &["b"]), ("b", &["a"]), ("c", &["a"])]);
        for entry in ["a", "b", "c"] {
            match g.resolve(entry) {
                Err(GraphError::Cycle { chain }) => {
                    assert!(chain.contains(&"a".to_string()), "{entry}: {chain:?}");
                    assert!(chain.contains(&"b".to_string()), "{entry}: {chain:?}");
                    assert_eq!(chain.first(), chain.last());
                }
                other => panic!("expected cycle from {entry}, got {other:?}"),
            }
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let g = graph(&[("loop", &["loop"])]);
        assert_eq!(
            g.resolve("loop").unwrap_err(),
            GraphError::Cycle {
                chain: vec!["loop".into(), "loop".into()]
            }
        );
    }

    #[test]
    fn unknown_dependency_names_the_parent() {
        let g = graph(&[("build", &["generate"])]);
        assert_eq!(
            g.resolve("build").unwrap_err(),
            GraphError::UnknownTask {
                name: "generate".into(),
                referenced_by: Some("build".into()),
            }
        );
    }

    #[test]
    fn unknown_target_is_reported() {
        let g = graph(&[("a", &[])]);
        assert!(matches!(
            g.resolve("missing"),
            Err(GraphError::UnknownTask { referenced_by: None, .. })
        ));
    }

    #[test]
    fn validate_finds_cycles_outside_any_request() {
        let g = graph(&[("ok", &[]), ("x", &["y"]), ("y", &["x"])]);
        assert!(matches!(g.validate(), Err(GraphError::Cycle { .. })));
    }

    #[test]
    fn duplicate_declaration_is_rejected() {
        let err = TaskGraph::from_tasks([Task::new("a"), Task::new("a")]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateTask("a".into()));
    }

    #[test]
    fn resolve_all_merges_roots() {
        let g = graph(&[("gen", &[]), ("lint", &["gen"]), ("test", &["gen"])]);
        let order = g.resolve_all(&["lint", "test"]).unwrap();
        assert_eq!(names(&order), vec!["gen", "lint", "test"]);
    }

    #[test]
    fn every_task_follows_its_transitive_dependencies() {
        let g = graph(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["b", "a"]),
            ("d", &["c"]),
            ("e", &["b", "d"]),
            ("f", &["e", "a"]),
        ]);
        let order = g.resolve("f").unwrap();
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();
        assert_eq!(position.len(), order.len());
        for task in &order {
            for dep in &task.deps {
                assert!(position[dep.as_str()] < position[task.name.as_str()]);
            }
        }
    }

    #[test]
    fn tasks_without_outputs_are_phony() {
        assert!(Task::new("lint").is_phony());
        assert!(!Task::new("gen").outputs(["gen/api.pb.go"]).is_phony());
        assert!(Task::new("gen").outputs(["x"]).phony(true).is_phony());
    }

    #[test]
    fn dependents_are_listed() {
        let g = graph(&[("gen", &[]), ("lint", &["gen"]), ("test", &["gen"])]);
        assert_eq!(g.dependents_of("gen"), vec!["lint", "test"]);
    }
}
