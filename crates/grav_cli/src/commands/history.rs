//! History command - Show the visible messages of a thread.

use anyhow::Result;
use clap::Args;

use super::Cli;

#[derive(Args)]
pub struct HistoryArgs {
    /// Thread to show
    pub thread_id: String,

    /// Print the raw JSON instead
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(cli: &Cli, args: &HistoryArgs) -> Result<()> {
    let service = cli.service()?;
    let history = service.history(&args.thread_id).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    if history.messages.is_empty() {
        println!("No messages on thread {}", history.thread_id);
        return Ok(());
    }
    println!("Thread {} ({} messages)", history.thread_id, history.total_messages);
    for message in &history.messages {
        println!();
        println!("[{}]", message.role);
        println!("{}", message.content);
    }
    Ok(())
}
