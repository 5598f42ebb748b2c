//! # telemetry-pipeline
//!
//! ```bash
//! # Check a configuration and print every problem found
//! telemetry-pipeline validate --config config/example.yaml
//!
//! # Run until SIGINT/SIGTERM, then drain within service.shutdown_timeout
//! telemetry-pipeline --log-level debug run --config config/example.yaml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use telemetry_pipeline::{Config, Registry, Service, ServiceError};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "telemetry-pipeline", version, about = "Receive, process and export telemetry")]
struct Cli {
    /// Log filter, e.g. `info` or `telemetry_pipeline=debug`. `RUST_LOG` is
    /// used when this is not given.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the service.
    Run {
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Validate a configuration without starting anything.
    Validate {
        #[arg(long, short)]
        config: PathBuf,
    },
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn validate(path: &PathBuf) -> Result<ExitCode> {
    let config = Config::load(path).with_context(|| format!("loading {}", path.display()))?;
    match Registry::build(&config) {
        Ok(registry) => {
            println!(
                "{}: ok ({} pipelines, {} receivers, {} processors, {} exporters)",
                path.display(),
                registry.pipelines.len(),
                registry.receivers.len(),
                registry.processors.len(),
                registry.exporters.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(errors) => {
            eprintln!("{}: {errors}", path.display());
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable; waiting for ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run(path: &PathBuf) -> Result<ExitCode> {
    let config = Config::load(path).with_context(|| format!("loading {}", path.display()))?;
    let mut service = match Service::new(&config) {
        Ok(service) => service,
        Err(ServiceError::Validation(errors)) => {
            eprintln!("{}: {errors}", path.display());
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e.into()),
    };

    let report = service.run_until(shutdown_signal()).await.context("starting service")?;
    if report.timed_out {
        tracing::warn!(
            abandoned_records = report.abandoned_records,
            "shutdown timed out; records abandoned"
        );
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let outcome = match &cli.command {
        Command::Validate { config } => validate(config),
        Command::Run { config } => run(config).await,
    };
    match outcome {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
