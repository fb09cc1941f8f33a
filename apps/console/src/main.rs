use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use shared::domain::{ChannelId, MessageId, UserId};
use sync_core::{load_settings, CredentialStore, Credentials, SyncEvent, SyncSession};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from sync.toml / APP__SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long)]
    token: String,
    /// Channels to join on startup; the first becomes active.
    #[arg(long = "channel")]
    channels: Vec<String>,
}

const HELP: &str = "commands: /join <id>  /leave <id>  /active <id>  /delete <id>  /history [n]  /online  /retry  /quit";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if args.token.trim().is_empty() {
        bail!("an access token is required");
    }

    let identity = Arc::new(CredentialStore::new(Credentials {
        user_id: UserId::new(args.user_id.clone()),
        display_name: args.display_name.unwrap_or_else(|| args.user_id.clone()),
        token: args.token,
    }));
    let session = SyncSession::with_defaults(settings, identity);
    let mut events = session.subscribe_events();

    for channel in &args.channels {
        session.join(ChannelId::new(channel.as_str())).await;
    }
    let mut active = args.channels.first().map(|id| ChannelId::new(id.as_str()));
    session.set_active_channel(active.clone()).await;
    session.connect().await;
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if !run_command(&session, &mut active, line).await {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "console: event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.disconnect().await;
    Ok(())
}

/// Returns false when the user asked to quit.
async fn run_command(
    session: &Arc<SyncSession>,
    active: &mut Option<ChannelId>,
    line: &str,
) -> bool {
    let (command, arg) = match line.split_once(' ') {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "/quit" => return false,
        "/join" if !arg.is_empty() => session.join(ChannelId::new(arg)).await,
        "/leave" if !arg.is_empty() => session.leave(ChannelId::new(arg)).await,
        "/active" if !arg.is_empty() => {
            let channel = ChannelId::new(arg);
            session.set_active_channel(Some(channel.clone())).await;
            *active = Some(channel);
        }
        "/retry" => session.reconnect_now().await,
        "/online" => {
            let mut online: Vec<_> = session
                .online_users()
                .await
                .into_iter()
                .map(|user| user.to_string())
                .collect();
            online.sort();
            println!("online: {}", online.join(", "));
        }
        "/history" => {
            let Some(channel) = active.clone() else {
                println!("no active channel");
                return true;
            };
            let limit = arg.parse().unwrap_or(50);
            match session.fetch_history(&channel, limit).await {
                Ok(merged) => println!("history: {merged} new message(s) in #{channel}"),
                Err(err) => println!("history failed: {err}"),
            }
        }
        "/delete" if !arg.is_empty() => {
            let Some(channel) = active.clone() else {
                println!("no active channel");
                return true;
            };
            if let Err(err) = session.delete_message(&channel, &MessageId::new(arg)).await {
                println!("delete failed: {err}");
            }
        }
        _ if line.starts_with('/') => println!("{HELP}"),
        _ => {
            let Some(channel) = active.clone() else {
                println!("no active channel; use /active <id>");
                return true;
            };
            if let Err(err) = session.submit(channel, line).await {
                println!("send failed: {err}");
            }
        }
    }
    true
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::StateChanged(state) => println!("* connection {}", state.label()),
        SyncEvent::Message(message) => {
            let marker = if message.is_pending() { " (sending)" } else { "" };
            println!(
                "#{} [{}] {}: {}{marker}",
                message.channel_id, message.id, message.author_display, message.body
            );
        }
        SyncEvent::MessageReplaced { message, .. } => {
            println!("#{} [{}] delivered", message.channel_id, message.id)
        }
        SyncEvent::MessageDeleted {
            channel_id,
            message_id,
        } => println!("#{channel_id} [{message_id}] removed"),
        SyncEvent::PresenceChanged(online) => println!("* {} user(s) online", online.len()),
        SyncEvent::UnreadChanged { channel_id, count } => {
            println!("* #{channel_id} unread: {count}")
        }
        SyncEvent::WriteFailed {
            channel_id,
            entity_id,
            error,
        } => println!("! #{channel_id} [{entity_id}] {error}"),
        SyncEvent::Error(error) => {
            println!("! {error}");
            if error.requires_reauth() {
                println!("! sign in again, then /retry");
            }
        }
    }
}
