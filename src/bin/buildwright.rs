use std::path::PathBuf;
use std::time::Duration;

use buildwright::config::{parse_assignment, parse_duration, ConfigOverrides};
use buildwright::error::{BuildError, EXIT_CONFIG};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod workflows;

/// Build and toolchain orchestration for multi-service repositories.
#[derive(Parser)]
#[command(name = "buildwright")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to buildwright.toml (default: nearest one above the current directory)
    #[arg(long, global = true, value_name = "FILE")]
    manifest: Option<PathBuf>,

    /// Resolve and print what would run without executing anything
    #[arg(long, global = true)]
    dry_run: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Build metadata override, e.g. --meta version=1.4.0
    #[arg(long = "meta", global = true, value_name = "KEY=VALUE", value_parser = parse_assignment)]
    meta: Vec<(String, String)>,

    /// Pin a tool version for this run, e.g. --tool-version codegen=1.1
    #[arg(long = "tool-version", global = true, value_name = "NAME=VERSION", value_parser = parse_assignment)]
    tool_versions: Vec<(String, String)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run code generation
    Generate(RunArgs),
    /// Run linters
    Lint(RunArgs),
    /// Run tests
    Test(RunArgs),
    /// Build every selected service for every selected platform
    Build(RunArgs),
    /// Package built artifacts
    Package(RunArgs),
    /// Remove build outputs and freshness state
    Clean {
        /// Also remove the tool cache
        #[arg(long, alias = "all")]
        tools: bool,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run the full pipeline
    All(RunArgs),
    /// Run arbitrary tasks by name
    Run {
        #[arg(required = true, value_name = "TASK")]
        tasks: Vec<String>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Print the resolved execution order without running anything
    Plan {
        #[arg(required = true, value_name = "TASK")]
        tasks: Vec<String>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Inspect or install pinned tools
    #[command(subcommand)]
    Tools(ToolsCommand),
}

#[derive(Subcommand)]
enum ToolsCommand {
    /// List pinned tools and whether they are installed
    List,
    /// Install pinned tools (all when no name is given)
    Ensure {
        #[arg(value_name = "NAME")]
        names: Vec<String>,
    },
}

/// Per-run selection flags shared by the pipeline commands.
#[derive(Args, Default)]
struct RunArgs {
    /// Service to build, or "all"
    #[arg(long, value_name = "NAME")]
    service: Option<String>,

    /// Environment profile (dev, staging, prod, ...)
    #[arg(long = "env", value_name = "NAME")]
    environment: Option<String>,

    /// Target OS (defaults to the host)
    #[arg(long)]
    os: Option<String>,

    /// Target architecture (defaults to the host)
    #[arg(long)]
    arch: Option<String>,

    /// Comma-separated os/arch list, or "all"
    #[arg(long, value_name = "LIST")]
    platforms: Option<String>,

    /// Maximum concurrent tasks
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Per-task timeout (e.g. 90s, 5m; 0 disables)
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,
}

impl RunArgs {
    fn overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            environment: self.environment,
            services: self.service,
            os: self.os,
            arch: self.arch,
            platforms: self.platforms,
            workers: self.jobs,
            timeout: self.timeout,
            ..ConfigOverrides::default()
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code(&err)
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = if verbose > 0 {
        EnvFilter::new(default)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let cli_overrides = ConfigOverrides {
        dry_run: cli.dry_run.then_some(true),
        tool_versions: cli.tool_versions.into_iter().collect(),
        metadata: cli.meta.into_iter().collect(),
        ..ConfigOverrides::default()
    };
    let manifest = cli.manifest;
    let session = move |run: RunArgs| {
        let overrides = cli_overrides.merge(run.overrides());
        workflows::Session::open(manifest.as_deref(), overrides)
    };

    match cli.command {
        Command::Generate(run) => workflows::run_stage(&session(run)?, "generate"),
        Command::Lint(run) => workflows::run_stage(&session(run)?, "lint"),
        Command::Test(run) => workflows::run_stage(&session(run)?, "test"),
        Command::Build(run) => workflows::run_stage(&session(run)?, "build"),
        Command::Package(run) => workflows::run_stage(&session(run)?, "package"),
        Command::All(run) => workflows::run_pipeline(&session(run)?),
        Command::Run { tasks, run } => workflows::run_tasks(&session(run)?, &tasks),
        Command::Plan { tasks, run } => workflows::print_plan(&session(run)?, &tasks),
        Command::Clean { tools, run } => workflows::clean(&session(run)?, tools),
        Command::Tools(ToolsCommand::List) => {
            workflows::list_tools(&session(RunArgs::default())?)
        }
        Command::Tools(ToolsCommand::Ensure { names }) => {
            workflows::ensure_tools(&session(RunArgs::default())?, &names)
        }
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<BuildError>())
        .map(BuildError::exit_code)
        .unwrap_or(EXIT_CONFIG)
}
