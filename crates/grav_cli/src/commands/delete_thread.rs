//! Delete-thread command - Remove a thread's checkpoint and events.

use anyhow::Result;
use clap::Args;

use super::Cli;

#[derive(Args)]
pub struct DeleteThreadArgs {
    /// Thread to delete
    pub thread_id: String,
}

pub async fn execute(cli: &Cli, args: &DeleteThreadArgs) -> Result<()> {
    let service = cli.service()?;
    let outcome = service.delete_thread(&args.thread_id).await?;
    println!(
        "Deleted thread {}: {} checkpoint(s), {} event(s)",
        outcome.thread_id, outcome.deleted_checkpoints, outcome.deleted_events
    );
    Ok(())
}
