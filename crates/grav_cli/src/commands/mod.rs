//! CLI command definitions.
//!
//! Each subcommand maps to one chat service entry point.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;

use grav_core::Settings;
use grav_service::{AppContext, ChatService};

pub mod ask;
pub mod delete_thread;
pub mod events;
pub mod history;
pub mod serve;

const DEFAULT_CONFIG: &str = "grav.toml";

/// Gravaity - retrieval-augmented chat service
#[derive(Parser)]
#[command(name = "grav")]
#[command(version, about = "Gravaity - retrieval-augmented chat service")]
#[command(long_about = r#"
Gravaity answers questions by deciding whether to consult document search,
project search or the web, then generating an answer from what it found.
Progress streams to subscribers as events that can be replayed.

COMMANDS:
  serve          → Run the HTTP and WebSocket service
  ask            → Run one turn and print the answer as it streams
  history        → Show the visible messages of a thread
  delete-thread  → Remove a thread's checkpoint and events
  events         → Print the retained event log of a thread

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments or configuration
  3 - Storage or upstream unavailable
  4 - Turn timed out
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the TOML settings file (defaults to ./grav.toml when present)
    #[arg(short, long, global = true, env = "GRAV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP and WebSocket service
    Serve(serve::ServeArgs),

    /// Ask a question on a thread
    Ask(ask::AskArgs),

    /// Show the visible history of a thread
    History(history::HistoryArgs),

    /// Delete a thread's checkpoint and retained events
    #[command(name = "delete-thread")]
    DeleteThread(delete_thread::DeleteThreadArgs),

    /// Print the retained event log of a thread
    Events(events::EventsArgs),
}

impl Cli {
    /// Settings from `--config`, `./grav.toml` or defaults, with the
    /// environment applied on top.
    pub fn settings(&self) -> Result<Settings> {
        let settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None if Path::new(DEFAULT_CONFIG).exists() => Settings::load(Path::new(DEFAULT_CONFIG))?,
            None => Settings::from_env()?,
        };
        debug!("Data directory: {}", settings.storage.data_dir.display());
        Ok(settings)
    }

    /// Build the chat service over the production context.
    pub fn service(&self) -> Result<Arc<ChatService>> {
        let ctx = AppContext::init(self.settings()?)?;
        Ok(Arc::new(ChatService::new(Arc::new(ctx))))
    }
}
