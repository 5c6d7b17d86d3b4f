//! Events command - Print the retained event log of a thread.

use anyhow::Result;
use clap::Args;

use super::Cli;

#[derive(Args)]
pub struct EventsArgs {
    /// Thread to read
    pub thread_id: String,

    /// Only events after this message id
    #[arg(long)]
    pub from: Option<u64>,
}

pub async fn execute(cli: &Cli, args: &EventsArgs) -> Result<()> {
    let service = cli.service()?;
    if !service.context().publisher.is_durable() {
        anyhow::bail!("Event log is disabled; nothing is retained");
    }

    // One JSON object per line
    for frame in service.events(&args.thread_id, args.from).await? {
        println!("{}", serde_json::to_string(&frame)?);
    }
    Ok(())
}
