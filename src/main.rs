//! rag-deploy entry point.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use log::{error, info};
use tokio::signal;

mod command;
mod config;
mod error;
mod health;
mod launcher;
mod network;
mod orchestrator;
mod prepare;
mod probe;
mod runtime;
mod types;
mod watchdog;

use config::Config;
use health::HttpHealthCheck;
use orchestrator::{DeployOptions, Orchestrator, EXIT_FATAL, EXIT_OK};
use prepare::SelinuxLabeler;
use runtime::PodmanRuntime;

const LABEL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Parser)]
#[command(name = "rag-deploy", version, about = "Deploy the RAG service container with Podman")]
struct Cli {
    /// Configuration file (defaults to ./rag-deploy.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the image and (re)start the service container
    Deploy(DeployArgs),
    /// Like deploy, but resets storage and permissions first
    Fix(DeployArgs),
    /// Show container state and service health
    Status,
    /// Create host directories and apply permissions only
    Prepare {
        /// Reset storage and use permissive modes
        #[arg(long)]
        fix: bool,
    },
}

#[derive(Debug, Args)]
struct DeployArgs {
    /// Reuse the existing image
    #[arg(long)]
    skip_build: bool,

    /// Exit non-zero when the service never becomes healthy
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let cfg = Config::load(cli.config.as_deref())?;
    log::debug!("Loaded config: {:?}", cfg);

    let runtime = PodmanRuntime::connect(
        cfg.socket.as_deref(),
        Duration::from_secs(cfg.build_timeout_secs),
    )?;
    let labeler = SelinuxLabeler::new(LABEL_TIMEOUT);
    let health = HttpHealthCheck::new(
        cfg.health_url(),
        Duration::from_secs(cfg.health.timeout_secs),
    )?;
    let orchestrator = Orchestrator::new(&cfg, &runtime, &labeler, &health);

    match cli.command {
        Command::Deploy(args) => deploy(&orchestrator, &cfg, args, false).await,
        Command::Fix(args) => deploy(&orchestrator, &cfg, args, true).await,
        Command::Status => {
            let status = orchestrator.status().await?;
            println!("{}", status);
            Ok(status.exit_code())
        }
        Command::Prepare { fix } => {
            let report = orchestrator.prepare(fix).await?;
            for dir in &report.prepared {
                println!("prepared  {}", dir.display());
            }
            for dir in &report.reset {
                println!("reset     {}", dir.display());
            }
            for dir in &report.unavailable {
                println!("skipped   {}", dir.display());
            }
            for warning in &report.warnings {
                println!("warning   {}", warning);
            }
            Ok(EXIT_OK)
        }
    }
}

async fn deploy(
    orchestrator: &Orchestrator<'_>,
    cfg: &Config,
    args: DeployArgs,
    fix: bool,
) -> anyhow::Result<i32> {
    let options = DeployOptions {
        fix,
        skip_build: args.skip_build,
    };
    let strict = args.strict || cfg.health.strict;

    // Dropping the deployment on Ctrl+C kills any running build.
    tokio::select! {
        result = orchestrator.deploy(options) => {
            let report = result?;
            println!("{}", report);
            Ok(report.exit_code(strict))
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, aborting deployment");
            Ok(EXIT_FATAL)
        }
    }
}
