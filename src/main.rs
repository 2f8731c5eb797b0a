//! CLI entry point for focusd.
//!
//! Loads the configuration, initializes logging, starts the telemetry
//! service and parks until interrupted. Supervision (restarts, watchdog)
//! belongs to the init system, not this binary.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use focusd::config::Settings;
use focusd::error::FocusdError;
use focusd::logging::{self, OutputFormat};
use focusd::service::FocusService;

#[derive(Parser)]
#[command(name = "focusd")]
#[command(about = "Autofocus telemetry daemon", long_about = None)]
struct Cli {
    /// Configuration file path (default: /etc/focusd/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    if let Some(level) = cli.log_level {
        settings.service.log_level = level;
    }
    settings
        .validate()
        .map_err(FocusdError::ConfigRejected)?;

    let format = OutputFormat::parse(&settings.service.log_format)
        .map_err(FocusdError::ConfigRejected)?;
    logging::init(&settings.service.log_level, format)
        .map_err(FocusdError::ConfigRejected)?;

    let service = FocusService::new(settings)?;
    service.start()?;
    info!("focusd running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    service.stop();
    Ok(())
}
