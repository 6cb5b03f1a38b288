//! capsule CLI entry point.
//!
//! Loads a program from a local file, a directory of scripts, a registry
//! name, or a URL, then runs it, calls one of its functions, or runs its
//! `test_*` functions.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use regex::Regex;
use rhai::Dynamic;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capsule_common::RuntimeConfig;
use capsule_runtime::ScriptHost;

#[derive(Debug, Parser)]
#[command(name = "capsule", version, about)]
struct Cli {
    /// Registry access token or an alias from the tokens file.
    #[arg(short, long, env = "CAPSULE_TOKEN", global = true)]
    token: Option<String>,

    /// Show script debug output and test progress.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Ignore and do not populate the program cache.
    #[arg(long, global = true)]
    no_cache: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load a program, then optionally call a function or run a script file in it.
    Run {
        /// File, directory, registry name, or URL.
        program: String,
        /// Function name or `.rhai` file to run after loading.
        entry: Option<String>,
        /// Arguments passed to the function.
        args: Vec<String>,
    },
    /// Load a program and run its test functions.
    Test {
        /// File, directory, registry name, or URL.
        program: String,
        /// Only run tests whose name matches this pattern.
        #[arg(long = "run")]
        pattern: Option<String>,
    },
    /// Upload a program archive to the registry.
    Upload {
        /// Zip archive to upload.
        archive: PathBuf,
        /// Program name to publish under.
        #[arg(long)]
        name: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match execute(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info,capsule=debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    if cli.token.is_some() {
        config.registry.access_token = cli.token;
    }
    if cli.no_cache {
        config.cache.enabled = false;
    }
    config.verbose |= cli.verbose;

    let mut host = ScriptHost::new(&config).context("Failed to initialize script host")?;
    host.set_verbose(config.verbose);
    debug!(registry = %host.root().registry_url(), "Host ready");

    match cli.command {
        Command::Run {
            program,
            entry,
            args,
        } => {
            host.load(&program)
                .with_context(|| format!("Failed to load {program}"))?;
            if let Some(entry) = entry {
                run_entry(&host, &entry, &args)?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Test { program, pattern } => {
            let pattern = pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .context("Invalid test pattern")?;
            host.load(&program)
                .with_context(|| format!("Failed to load {program}"))?;

            let results = host.context().run_tests(pattern.as_ref());
            let failed = results.iter().filter(|r| !r.passed()).count();
            println!("{} tests passed, {failed} tests failed", results.len() - failed);

            Ok(if failed == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Upload { archive, name } => {
            let bytes = std::fs::read(&archive)
                .with_context(|| format!("Failed to read {}", archive.display()))?;
            host.upload(&name, &bytes)?;
            info!(name = %name, "Upload complete");
            println!("Uploaded {name}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Run a script file or call a function in a fresh copy of the root context.
fn run_entry(host: &ScriptHost, entry: &str, args: &[String]) -> anyhow::Result<()> {
    let mut ctx = host.context();
    let path = Path::new(entry);

    let result = if path.is_file() {
        ctx.run_file(path)?
    } else {
        ctx.call(entry, args.iter().map(|a| parse_arg(a)).collect())?
    };

    if !result.is_unit() {
        println!("{result}");
    }
    Ok(())
}

/// Command-line arguments become integers, floats, or booleans when they
/// parse as one, and strings otherwise.
fn parse_arg(arg: &str) -> Dynamic {
    if let Ok(n) = arg.parse::<i64>() {
        return Dynamic::from(n);
    }
    if let Ok(f) = arg.parse::<f64>() {
        return Dynamic::from(f);
    }
    match arg {
        "true" => Dynamic::TRUE,
        "false" => Dynamic::FALSE,
        _ => Dynamic::from(arg.to_string()),
    }
}
