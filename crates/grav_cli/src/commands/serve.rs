//! Serve command - Run the HTTP and WebSocket service.

use anyhow::Result;
use clap::Args;
use tracing::{info, warn};

use super::Cli;

#[derive(Args)]
pub struct ServeArgs {
    /// Address to bind, overriding `server.bind`
    #[arg(short, long)]
    bind: Option<String>,
}

pub async fn execute(cli: &Cli, args: &ServeArgs) -> Result<()> {
    let service = cli.service()?;
    let bind = args
        .bind
        .clone()
        .unwrap_or_else(|| service.context().settings.server.bind.clone());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    };

    grav_service::serve(service, &bind, shutdown).await?;
    Ok(())
}
