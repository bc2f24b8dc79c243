//! UTF CLI - Main Entry Point
//!
//! Discovers `ut_*` files in a directory, runs the selected modules and
//! reports per-file results. Exit code 0 when everything passed, 1 when any
//! test or module failed, 2 when the harness itself could not run.

use clap::{ArgGroup, Parser};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use utf_harness::config::CONFIG_FILE;
use utf_harness::environment::registry;
use utf_harness::{
    Discoverer, HarnessConfig, LifecycleSettings, ModuleLifecycle, ProcessRunner, Scheduler,
};

mod output;

/// UTF - run ut_* test files and verify their output
#[derive(Parser, Debug)]
#[command(name = "utf")]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("selection").required(true).args(["all", "module", "file"])))]
struct Cli {
    /// Run every module in the test directory
    #[arg(short, long)]
    all: bool,

    /// Run one module (its setup, subprocess, tests and shutdown)
    #[arg(short, long)]
    module: Option<String>,

    /// Run one test file, wrapped in its module's lifecycle
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Directory containing the test files
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Modules run in parallel
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Per-test timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Show how long each test took
    #[arg(short = 't', long)]
    show_time: bool,

    /// Write machine-readable results to this file
    #[arg(long)]
    json: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            output::print_error(&format!("Failed to create tokio runtime: {}", e));
            std::process::exit(2);
        }
    };

    match rt.block_on(run(cli)) {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            output::print_error(&format!("Error: {:#}", e));
            std::process::exit(2);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = HarnessConfig::load(&cli.config)?;
    apply_overrides(&mut config, &cli);
    config.validate()?;
    debug!("Effective configuration: {:?}", config);

    let _registry = registry::install(config.interpreters())?;
    let runner = ProcessRunner::from_registry()?;

    let roster = Discoverer::with_extensions(config.extensions.clone()).scan(&config.test_dir)?;
    let roster = match (&cli.module, &cli.file) {
        (Some(module), _) => roster.select_module(module)?,
        (None, Some(file)) => roster.select_file(&file.to_string_lossy())?,
        (None, None) => roster,
    };

    let lifecycle = ModuleLifecycle::new(runner, LifecycleSettings::from(&config));
    let summary = Scheduler::new(lifecycle, config.jobs).run(roster).await;

    output::print_summary(&summary, cli.show_time);

    if let Some(path) = &cli.json {
        summary.write_json(path)?;
    }

    Ok(summary.success())
}

/// Command-line flags win over the config file
fn apply_overrides(config: &mut HarnessConfig, cli: &Cli) {
    if let Some(dir) = &cli.dir {
        config.test_dir = dir.clone();
    } else if let Some(parent) = cli.file.as_deref().and_then(file_dir) {
        config.test_dir = parent.to_path_buf();
    }
    if let Some(jobs) = cli.jobs {
        config.jobs = jobs;
    }
    if let Some(timeout) = cli.timeout {
        config.test_timeout_secs = timeout;
    }
}

/// Directory part of a `--file` argument, if it has one
fn file_dir(file: &Path) -> Option<&Path> {
    file.parent().filter(|p| !p.as_os_str().is_empty())
}
