//! Ask command - Run one turn and print the answer as it streams.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use grav_core::{EventType, UploadedDocument, TOOLS_NODE};
use grav_service::StreamRequest;
use grav_stream::EventFrame;

use super::Cli;

/// How long to keep reading events after the turn task has finished
const DRAIN_WAIT: Duration = Duration::from_millis(250);

#[derive(Args)]
pub struct AskArgs {
    /// Conversation thread
    pub thread_id: String,

    /// The question
    pub message: String,

    /// Model to use instead of the configured default
    #[arg(short, long)]
    pub model: Option<String>,

    /// Allow web search for this turn
    #[arg(long)]
    pub web: bool,

    /// Attach a text document (repeatable)
    #[arg(long = "doc", value_name = "FILE")]
    pub docs: Vec<PathBuf>,

    /// Attribute the turn to a user
    #[arg(long)]
    pub user: Option<String>,
}

fn read_documents(paths: &[PathBuf]) -> Result<Vec<UploadedDocument>> {
    paths
        .iter()
        .map(|path| {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read document {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            Ok(UploadedDocument { name, content })
        })
        .collect()
}

/// Print one frame. Returns true when a token was written to stdout.
fn render(frame: &EventFrame) -> bool {
    let event = &frame.event;
    match event.message_type {
        EventType::Token => {
            if let Some(content) = event.payload["content"].as_str() {
                print!("{}", content);
                let _ = std::io::stdout().flush();
                return !content.is_empty();
            }
        }
        EventType::Custom if event.node_name == TOOLS_NODE => {
            eprintln!(
                "  🔧 {} ({:.0}ms)",
                event.payload["tool"].as_str().unwrap_or("tool"),
                event.payload["elapsed_ms"].as_f64().unwrap_or_default()
            );
        }
        _ => {}
    }
    false
}

pub async fn execute(cli: &Cli, args: &AskArgs) -> Result<()> {
    let service = cli.service()?;
    let documents = read_documents(&args.docs)?;

    // Start after what the log already holds so only this turn is shown
    let seen = service
        .events(&args.thread_id, None)
        .await?
        .last()
        .and_then(|frame| frame.message_id)
        .unwrap_or(0);
    let mut subscription = service.subscribe(&args.thread_id, Some(seen)).await?;

    info!("Asking on thread {}", args.thread_id);
    let request = StreamRequest {
        thread_id: args.thread_id.clone(),
        user_id: args.user.clone(),
        message: args.message.clone(),
        chat_model: args.model.clone(),
        documents,
        enable_websearch: args.web,
    };
    let (_, mut handle) = service.spawn_stream(request).await?;

    let mut streamed = false;
    let result = loop {
        tokio::select! {
            frame = subscription.recv() => match frame {
                Some(frame) => {
                    streamed |= render(&frame);
                    if frame.event.is_terminal() {
                        break (&mut handle).await;
                    }
                }
                None => break (&mut handle).await,
            },
            result = &mut handle => {
                // Events published before the task ended are still queued
                while let Ok(Some(frame)) = tokio::time::timeout(DRAIN_WAIT, subscription.recv()).await {
                    streamed |= render(&frame);
                    if frame.event.is_terminal() {
                        break;
                    }
                }
                break result;
            }
        }
    };

    let outcome = result.context("Turn task failed")??;
    if !streamed {
        print!("{}", outcome.answer);
    }
    println!();
    Ok(())
}
