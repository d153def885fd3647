//! localci CLI
//!
//! Watches the configured repositories and tests their trunk branch and open
//! change requests (`--daemon`), or tests the one change request configured
//! per repository and exits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use localci::config::{load_config, Config};
use localci::error::{Error, Result};
use localci::monitor::RepositoryMonitor;
use localci::toolchain::ToolchainCache;

#[derive(Parser)]
#[command(name = "localci")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Continuous integration for repositories on a code-hosting platform", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "LOCALCI_CONFIG")]
    config: PathBuf,

    /// Monitor repositories forever instead of testing one change request
    #[arg(short, long)]
    daemon: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log: Option<PathBuf>,
}

fn init_tracing(cli: &Cli) -> Result<()> {
    let level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    match &cli.log {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::Config(format!("failed to open log file {}: {}", path.display(), e)))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    Ok(())
}

/// Starts one monitor task per repository and never returns while any runs.
async fn daemon(config: Config, toolchains: Arc<ToolchainCache>) -> Result<()> {
    let mut handles = Vec::new();

    for repo in &config.repos {
        match RepositoryMonitor::from_config(repo, config.run_tests_in_parallel, &toolchains).await {
            Ok(monitor) => handles.push(tokio::spawn(monitor.run())),
            Err(e) => {
                tracing::error!(url = %repo.url, error = %e, "failed to set up repository, skipping it");
            }
        }
    }

    if handles.is_empty() {
        return Err(Error::Config("no repository could be monitored".to_string()));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "monitor task ended unexpectedly");
        }
    }

    Ok(())
}

/// Tests the configured change request of every repository, in order.
async fn single_shot(config: Config, toolchains: Arc<ToolchainCache>) -> Result<()> {
    for repo in &config.repos {
        let number = repo.change_request().ok_or_else(|| {
            Error::Config(format!("{}: missing pr number for a single test run", repo.url))
        })?;

        let monitor = RepositoryMonitor::from_config(repo, false, &toolchains).await?;
        monitor.test_single(number).await?;
        tracing::info!(url = %repo.url, number, "change request passed");
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    let toolchains = Arc::new(ToolchainCache::new(config.toolchain_dir.clone())?);

    if cli.daemon {
        daemon(config, toolchains).await
    } else {
        single_shot(config, toolchains).await
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli) {
        eprintln!("localci: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("localci: {}", e);
            ExitCode::FAILURE
        }
    }
}
