use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{ChatClient, ClientEvent, LastActivity, WsChannel};
use shared::domain::{MessageId, UserId};
use storage::SqliteActivityStore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

mod config;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    bearer_token: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(v) = args.server_url {
        settings.server_url = v;
    }
    if let Some(v) = args.bearer_token {
        settings.bearer_token = v;
    }
    if let Some(v) = args.user_id {
        settings.user_id = v;
    }
    if let Some(v) = args.database_url {
        settings.database_url = v;
    }
    if settings.user_id.is_empty() {
        anyhow::bail!("user_id is required (flag, chat.toml, or CHAT_USER_ID)");
    }

    let database_url = config::normalize_database_url(&settings.database_url);
    let store = Arc::new(SqliteActivityStore::new(&database_url).await?);
    store.health_check().await?;

    let local_user = UserId::from(settings.user_id.as_str());
    let channel = WsChannel::connect(&settings.server_url, local_user.clone())?;
    let client = ChatClient::new(
        &settings.server_url,
        &settings.bearer_token,
        local_user.clone(),
        channel,
        store,
    )
    .await?;
    client.start().await;
    info!(server_url = %settings.server_url, user_id = %local_user, "chat client started");

    tokio::spawn(print_events(client.clone()));

    client.load_friends().await?;
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };
        match command {
            "/friends" => {
                for friend in client.friends().await {
                    let unread = client.unread(&friend.user_id).await;
                    let last = match client.last_activity(&friend.user_id).await {
                        LastActivity::Unknown => "-".to_string(),
                        LastActivity::Empty => "no messages".to_string(),
                        LastActivity::At(at) => at.to_rfc3339(),
                    };
                    println!("{} {} unread={unread} last={last}", friend.user_id, friend.name);
                }
            }
            "/open" => {
                if rest.is_empty() {
                    println!("usage: /open <user-id>");
                    continue;
                }
                if let Err(err) = client.select_peer(&UserId::from(rest)).await {
                    println!("open failed: {err}");
                }
            }
            "/close" => client.deselect().await,
            "/send" => {
                if rest.is_empty() {
                    println!("usage: /send <text>");
                    continue;
                }
                if let Err(err) = client.send_message(rest).await {
                    println!("send failed: {err}");
                }
            }
            "/delete" => {
                if rest.is_empty() {
                    println!("usage: /delete <message-id>");
                    continue;
                }
                if let Err(err) = client.delete_message(&MessageId::from(rest)).await {
                    println!("delete failed: {err}");
                }
            }
            "/history" => {
                let Some(peer_id) = client.selected_peer().await else {
                    println!("no conversation is open");
                    continue;
                };
                for message in client.conversation_messages(&peer_id).await {
                    println!(
                        "[{}] {} {}: {}",
                        message.created_at.to_rfc3339(),
                        message.message_id,
                        message.sender,
                        message.text
                    );
                }
            }
            "/notifications" => {
                for notification in client.notifications().await {
                    println!("{}: {}", notification.peer.name, notification.text);
                }
            }
            "/quit" => break,
            _ => print_help(),
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn print_events(client: Arc<ChatClient>) {
    let mut rx = client.subscribe_events();
    while let Ok(event) = rx.recv().await {
        match event {
            ClientEvent::FriendsUpdated => println!("* friends list updated"),
            ClientEvent::SelectionChanged(Some(peer_id)) => {
                println!("* conversation with {peer_id} opened");
            }
            ClientEvent::SelectionChanged(None) => println!("* conversation closed"),
            ClientEvent::ConversationUpdated { peer_id } => {
                println!("* conversation with {peer_id} updated");
            }
            ClientEvent::ScrollToNewest { .. } => {}
            ClientEvent::UnreadChanged { peer_id, count } => {
                println!("* unread for {peer_id}: {count}");
            }
            ClientEvent::NotificationPushed(notification) => {
                println!("* {}: {}", notification.peer.name, notification.text);
            }
            ClientEvent::NotificationDismissed { .. } => {}
            ClientEvent::Error(message) => println!("* error: {message}"),
        }
    }
}

fn print_help() {
    println!("commands: /friends /open <id> /close /send <text> /delete <id> /history /notifications /quit");
}
