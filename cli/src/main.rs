//! CLI for stimlink
//!
//! Commands:
//! - run: connect and print instrument events as JSON lines
//! - update-firmware: push a firmware image to the instrument
//! - check-stim: run stimulator impedance checks

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stimlink_controller::ControllerConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "stimlink")]
#[command(about = "stimlink - stimulation instrument controller", long_about = None)]
#[command(version)]
struct Cli {
    /// Controller configuration file (TOML)
    #[arg(short, long, global = true, env = "STIMLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and stream instrument events; commands are read from stdin as JSON lines
    Run(commands::run::RunArgs),

    /// Update the instrument's main or channel firmware
    UpdateFirmware(commands::firmware::UpdateFirmwareArgs),

    /// Classify each well's stimulator circuit
    CheckStim(commands::check_stim::CheckStimArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let config = match &cli.config {
        Some(path) => ControllerConfig::from_toml_file(path)?,
        None => {
            let config = ControllerConfig::default();
            config.validate().context("Invalid configuration from environment")?;
            config
        }
    };

    match cli.command {
        Commands::Run(args) => commands::run::run(args, config).await,
        Commands::UpdateFirmware(args) => commands::firmware::run(args, config).await,
        Commands::CheckStim(args) => commands::check_stim::run(args, config).await,
    }
}

/// Logs go to stderr so stdout carries only command output.
fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
