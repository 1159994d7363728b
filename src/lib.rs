//! Build and toolchain orchestration.
//!
//! Given a declarative set of tasks (code generation, linting, testing,
//! compiling, packaging) and their dependencies, `buildwright` resolves an
//! execution order, provisions pinned external tools on demand, skips work
//! whose outputs are already fresh, and fans build tasks out over a
//! service x platform matrix with shared version metadata.
//!
//! # Architecture
//!
//! ```text
//! buildwright.toml ──> manifest ──> config::BuildConfig
//!                                        │
//!                         engine::Engine ┤
//!                                        ├── matrix    (service x platform targets)
//!                                        ├── graph     (resolve, cycle detection)
//!                                        ├── tools     (registry + cached provisioner)
//!                                        ├── freshness (timestamps / fingerprints)
//!                                        └── scheduler (bounded parallel execution)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use buildwright::{manifest::Manifest, config::ConfigOverrides, Engine};
//!
//! let manifest = Manifest::load("buildwright.toml".as_ref())?;
//! let engine = Engine::from_manifest(manifest, ConfigOverrides::from_env()?)?;
//! let report = engine.run(&["build"])?;
//! println!("{}", report.summary());
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod freshness;
pub mod fsutil;
pub mod graph;
pub mod manifest;
pub mod matrix;
pub mod preflight;
pub mod process;
pub mod scheduler;
pub mod template;
pub mod tools;

pub use config::{BuildConfig, ConfigOverrides};
pub use engine::Engine;
pub use error::BuildError;
pub use graph::{Task, TaskGraph};
pub use scheduler::{ExecutionResult, Outcome, RunReport};
