use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientCommand, ServerEvent},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events fanned out to channel subscribers, in delivery order.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Connection (re)established; the local user's room join has been sent.
    Connected,
    Server(ServerEvent),
}

/// Seam over the realtime transport. Implementations join the local user's
/// room themselves on every (re)connect and emit [`ChannelEvent::Connected`]
/// afterwards; `join_room` is for additional rooms (the selected peer's).
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn join_room(&self, user_id: &UserId) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
}

/// WebSocket-backed channel with automatic, silent reconnection. No replay
/// is attempted on reconnect; missed messages are reconciled by the next
/// history fetch.
pub struct WsChannel {
    outbound: mpsc::UnboundedSender<ClientCommand>,
    events: broadcast::Sender<ChannelEvent>,
    task: JoinHandle<()>,
}

impl WsChannel {
    /// Opens the persistent connection to `server_url` (an `http(s)://` base
    /// URL) and keeps it alive until [`WsChannel::shutdown`].
    pub fn connect(server_url: &str, local_user: UserId) -> Result<Arc<Self>> {
        let ws_url = ws_url_from_http(server_url)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(
            ws_url,
            local_user,
            events.clone(),
            outbound_rx,
        ));
        Ok(Arc::new(Self {
            outbound,
            events,
            task,
        }))
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl RealtimeChannel for WsChannel {
    async fn join_room(&self, user_id: &UserId) -> Result<()> {
        self.outbound
            .send(ClientCommand::JoinRoom {
                user_id: user_id.clone(),
            })
            .map_err(|_| anyhow!("realtime channel task has shut down"))
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

async fn send_command(writer: &mut WsSink, command: &ClientCommand) -> Result<()> {
    let text = serde_json::to_string(command)?;
    writer.send(Message::Text(text)).await?;
    Ok(())
}

async fn run_connection(
    ws_url: String,
    local_user: UserId,
    events: broadcast::Sender<ChannelEvent>,
    mut outbound: mpsc::UnboundedReceiver<ClientCommand>,
) {
    loop {
        let (ws_stream, _) = match connect_async(&ws_url).await {
            Ok(connected) => connected,
            Err(err) => {
                warn!(error = %err, url = %ws_url, "realtime connect failed, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        let (mut writer, mut reader) = ws_stream.split();

        // The server routes pushes by room membership, so the join must land
        // before any other traffic on every fresh connection.
        let join = ClientCommand::JoinRoom {
            user_id: local_user.clone(),
        };
        if send_command(&mut writer, &join).await.is_err() {
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }
        info!(user_id = %local_user, "realtime channel connected");
        let _ = events.send(ChannelEvent::Connected);

        loop {
            tokio::select! {
                command = outbound.recv() => {
                    // Sender dropped means the channel handle is gone.
                    let Some(command) = command else { return };
                    if send_command(&mut writer, &command).await.is_err() {
                        break;
                    }
                }
                frame = reader.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerEvent>(&text) {
                                Ok(event) => {
                                    let _ = events.send(ChannelEvent::Server(event));
                                }
                                Err(err) => {
                                    warn!(error = %err, "discarding undecodable server event");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "websocket receive failed");
                            break;
                        }
                    }
                }
            }
        }

        warn!("realtime channel disconnected, reconnecting");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

fn ws_url_from_http(server_url: &str) -> Result<String> {
    let base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    Ok(format!("{}/ws", base.trim_end_matches('/')))
}
