//! WebSocket listener.
//!
//! One task per connection. The task owns the socket: it forwards text
//! frames to [`ClientHub::handle_text`], drains the client's outbound queue
//! and pings the peer every `ping_interval`. A peer that does not answer a
//! ping within `ping_timeout` is dropped.

use crate::hub::{ClientHub, Outbound};
use crate::protocol::ServerMessage;
use futures::{SinkExt, StreamExt};
use kinetic_common::config::{HubConfig, secs};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct ServerSettings {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub max_message_bytes: usize,
}

impl From<&HubConfig> for ServerSettings {
    fn from(config: &HubConfig) -> Self {
        Self {
            ping_interval: secs(config.ping_interval_secs),
            ping_timeout: secs(config.ping_timeout_secs),
            max_message_bytes: config.max_message_bytes,
        }
    }
}

impl ServerSettings {
    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_bytes);
        config.max_frame_size = Some(self.max_message_bytes);
        config
    }
}

/// Accept connections until `shutdown` resolves.
///
/// Connection tasks outlive the accept loop; they end when the hub closes
/// them ([`ClientHub::shutdown`]) or the peer goes away.
pub async fn run(
    listener: TcpListener,
    hub: ClientHub,
    settings: ServerSettings,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    match listener.local_addr() {
        Ok(addr) => info!("🌐 Client hub listening on ws://{addr}"),
        Err(e) => warn!("Listening on an unknown address: {e}"),
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        continue;
                    }
                };
                let hub = hub.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, peer, hub, settings).await {
                        debug!(%peer, "Connection ended with error: {e}");
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Client hub listener stopped");
                break;
            }
        }
    }
}

async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    hub: ClientHub,
    settings: ServerSettings,
) -> Result<(), WsError> {
    let socket =
        tokio_tungstenite::accept_async_with_config(stream, Some(settings.websocket_config()))
            .await?;
    let (mut sink, mut frames) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client_id = hub.connect(tx).await;
    debug!(%peer, client = %client_id, "WebSocket handshake complete");

    let mut ping = tokio::time::interval(settings.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick is immediate.
    ping.tick().await;
    let mut pong_deadline: Option<Instant> = None;

    let outcome = loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => hub.handle_text(&client_id, &text).await,
                Some(Ok(Message::Pong(_))) => pong_deadline = None,
                Some(Ok(Message::Binary(_))) => {
                    hub.send_to(&client_id, &ServerMessage::error("Binary frames are not supported"))
                        .await
                }
                // Pings are answered by the protocol layer.
                Some(Ok(Message::Ping(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Err(e)) => break Err(e),
            },
            outbound = rx.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        break Err(e);
                    }
                }
                Some(Outbound::Close) | None => {
                    // The peer may already be gone.
                    let _ = sink.send(Message::Close(None)).await;
                    break Ok(());
                }
            },
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    break Err(e);
                }
                pong_deadline.get_or_insert(Instant::now() + settings.ping_timeout);
            }
            _ = expire(pong_deadline) => {
                warn!(%peer, client = %client_id, "Ping timeout, dropping client");
                break Ok(());
            }
        }
    };

    hub.disconnect(&client_id).await;
    outcome
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
