//! Gravaity CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments or configuration
//! - 3: Storage or upstream unavailable
//! - 4: Turn timed out

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, Commands};
use grav_core::CoreError;
use grav_service::ServiceError;

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const UNAVAILABLE: u8 = 3;
    pub const TIMEOUT: u8 = 4;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "grav=debug,warn"
    } else {
        "grav=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // Ignore a second init, logging is already set up then
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();

    let result = match cli.command {
        Commands::Serve(ref args) => commands::serve::execute(&cli, args).await,
        Commands::Ask(ref args) => commands::ask::execute(&cli, args).await,
        Commands::History(ref args) => commands::history::execute(&cli, args).await,
        Commands::DeleteThread(ref args) => commands::delete_thread::execute(&cli, args).await,
        Commands::Events(ref args) => commands::events::execute(&cli, args).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(categorize_error(&e))
        }
    }
}

/// Map an error to its exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    if let Some(err) = e.downcast_ref::<ServiceError>() {
        return match err {
            ServiceError::BadRequest(_) | ServiceError::NotFound(_) => ExitCodes::INVALID_ARGS,
            ServiceError::Timeout(_) => ExitCodes::TIMEOUT,
            ServiceError::Unavailable(_) => ExitCodes::UNAVAILABLE,
            ServiceError::Internal(_) => ExitCodes::GENERAL_ERROR,
        };
    }
    match e.downcast_ref::<CoreError>() {
        Some(CoreError::Config(_)) => ExitCodes::INVALID_ARGS,
        Some(CoreError::Timeout(_)) => ExitCodes::TIMEOUT,
        Some(CoreError::CheckpointUnavailable(_)) => ExitCodes::UNAVAILABLE,
        _ => ExitCodes::GENERAL_ERROR,
    }
}
