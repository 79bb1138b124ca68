use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use convo_sync::{
    ChannelNotice, ConversationChannelManager, ConversationId, HttpTransport, Message, SendState,
    SyncConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "convo")]
#[command(about = "Live view of a chat conversation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a conversation and send each stdin line to it
    Tail(TailArgs),
}

#[derive(Parser)]
struct TailArgs {
    /// Conversation to follow
    conversation: String,

    /// User id the push channel is opened as (also the sender of stdin lines)
    #[arg(short, long)]
    user: String,

    /// Recipient attached to outgoing messages
    #[arg(short, long)]
    receiver: Option<String>,

    /// Config file (defaults to ./convo.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Tail(args) => tail(args).await,
    }
}

async fn tail(args: TailArgs) -> Result<()> {
    let default_directive = if args.debug {
        "convo_sync=debug,convo=debug,info"
    } else {
        "convo_sync=info,convo=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = SyncConfig::load(args.config.as_deref()).context("loading configuration")?;
    let http = HttpTransport::new(&config.server, config.channel.max_frame_bytes)
        .context("building HTTP client")?;
    let manager = ConversationChannelManager::with_http(http, config.channel);
    let conv = ConversationId::new(args.conversation);

    match manager.history(&conv).await {
        Ok(history) => {
            for msg in &history {
                print_message(msg, false);
            }
        }
        Err(e) => warn!(error = %e, "could not load history"),
    }

    manager
        .subscribe(&conv, |msg: &Message, replaced: bool| print_message(msg, replaced))
        .await;

    let mut notices = manager.notices();
    let notice_task = tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(ChannelNotice::StateChanged { state, .. }) => eprintln!("-- {state}"),
                Ok(ChannelNotice::Warning {
                    attempt, message, ..
                }) => eprintln!("-- connection lost (attempt {attempt}): {message}"),
                Err(RecvError::Lagged(n)) => eprintln!("-- {n} notices skipped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    manager.open(&conv, &args.user).await;
    info!(conversation = %conv, user = %args.user, "tailing conversation");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let outcome = manager
                    .send(&conv, &line, &args.user, args.receiver.as_deref())
                    .await;
                if let Some(e) = outcome.error {
                    eprintln!("-- send failed: {e}");
                }
            }
        }
    }

    manager.close(&conv).await;
    notice_task.abort();
    Ok(())
}

fn print_message(msg: &Message, replaced: bool) {
    let marker = match (msg.status, replaced) {
        (SendState::Failed, _) => "!",
        (SendState::Pending, _) => "…",
        (SendState::Confirmed, true) => "~",
        (SendState::Confirmed, false) => " ",
    };
    println!(
        "{marker} [{}] {}: {}",
        msg.created_at.format("%H:%M:%S"),
        msg.sender_id,
        msg.content
    );
}
