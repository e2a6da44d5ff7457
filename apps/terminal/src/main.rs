mod commands;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_config, ChatClient, ClientError, ClientEvent, ConnectionState, NoticeKind,
    OutgoingAttachment,
};
use shared::domain::ChatMessage;
use storage::Storage;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::{self, error::RecvError},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::commands::{parse_line, Input, HELP};

#[derive(Parser, Debug)]
#[command(about = "Terminal chat client")]
struct Args {
    /// Chat server base url, e.g. http://localhost:3001
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    default_channel: Option<String>,
    /// Where the session is persisted, e.g. sqlite://./data/client.db
    #[arg(long)]
    database_url: Option<String>,
    /// 0 disables the automatic reconnect
    #[arg(long)]
    reconnect_delay_ms: Option<u64>,
    /// Log filter; falls back to RUST_LOG, then "info"
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log.as_deref());

    let mut config = load_config();
    if let Some(v) = args.server_url {
        config.server_url = v;
    }
    if let Some(v) = args.default_channel {
        config.default_channel = v;
    }
    if let Some(v) = args.database_url {
        config.database_url = v;
    }
    if let Some(v) = args.reconnect_delay_ms {
        config.reconnect_delay_ms = v;
    }
    let server_url = config.server_url()?;
    info!(server = %server_url, channel = %config.default_channel, "terminal: starting");

    let storage = Storage::new(&config.database_url)
        .await
        .with_context(|| format!("failed to open session storage at {}", config.database_url))?;
    storage.health_check().await?;
    let client = ChatClient::from_config(&config, Arc::new(storage))?;

    let printer = tokio::spawn(print_events(client.subscribe_events(), server_url));
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = match parse_line(&line) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(usage) => {
                println!("! {usage}");
                continue;
            }
        };
        if input == Input::Quit {
            break;
        }
        if let Err(err) = dispatch(&client, input).await {
            report(&err);
        }
    }

    client.shutdown().await;
    printer.abort();
    Ok(())
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(client: &ChatClient, input: Input) -> Result<(), ClientError> {
    match input {
        Input::SignIn { username, password } => {
            let session = client.sign_in(&username, &password).await?;
            println!("* signed in as {}", session.identity());
        }
        Input::SignUp { username, password } => client.sign_up(&username, &password).await?,
        Input::SignOut => client.sign_out().await?,
        Input::Join(channel) => client.select_channel(&channel).await?,
        Input::Channels => {
            let view = client.view();
            if view.channels.is_empty() {
                println!("* no channels loaded, try /reload");
            }
            for channel in &view.channels {
                let marker = if channel.name == view.active_channel { ">" } else { " " };
                println!("{marker} #{channel}");
            }
        }
        Input::Attach { path, text } => {
            let attachment = OutgoingAttachment::from_path(&path).await?;
            client.compose(text, Some(attachment)).await?;
        }
        Input::Reload => {
            let channels = client.reload_channels().await?;
            println!("* {} channels", channels.len());
        }
        Input::Reconnect => client.reconnect().await?,
        Input::Help => println!("{HELP}"),
        Input::Send(text) => client.compose(text, None).await?,
        Input::Quit => {}
    }
    Ok(())
}

fn report(err: &ClientError) {
    match err.notice_kind() {
        NoticeKind::Internal => warn!(error = %err, "terminal: command failed"),
        _ => println!("! {err}"),
    }
}

async fn print_events(mut events: broadcast::Receiver<ClientEvent>, server_url: Url) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "terminal: event printer fell behind");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        match event {
            ClientEvent::SessionChanged { identity: None } => println!("* signed out"),
            ClientEvent::SessionChanged { identity: Some(_) } => {}
            ClientEvent::ConnectionChanged(ConnectionState::Connected) => println!("* connected"),
            ClientEvent::ConnectionChanged(ConnectionState::Disconnected) => {
                println!("* disconnected")
            }
            ClientEvent::ConnectionChanged(ConnectionState::Connecting) => {}
            ClientEvent::ChannelsLoaded(channels) => {
                let names: Vec<_> = channels.iter().map(|channel| format!("#{channel}")).collect();
                println!("* channels: {}", names.join(" "));
            }
            ClientEvent::ActiveChannelChanged { channel } => println!("* joining #{channel}"),
            ClientEvent::HistoryLoaded { channel, messages } => {
                println!("--- #{channel} ---");
                for message in &messages {
                    println!("{}", render(message, &server_url));
                }
            }
            ClientEvent::MessageAppended(message) => println!("{}", render(&message, &server_url)),
            ClientEvent::ForcedLogout { reason } => println!("! {reason}"),
            ClientEvent::Notice(notice) => match notice.kind {
                NoticeKind::Info => println!("* {}", notice.message),
                _ => println!("! {}", notice.message),
            },
        }
    }
}

fn render(message: &ChatMessage, server_url: &Url) -> String {
    let mut line = format!("{}: {}", message.author(), message.body());
    if let Some(attachment) = message.attachment() {
        let kind = if attachment.is_image() { "image" } else { "file" };
        let location = attachment
            .resolve_url(server_url)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| attachment.url.clone());
        line.push_str(&format!(" [{kind}: {} {location}]", attachment.display_name));
    }
    line
}
