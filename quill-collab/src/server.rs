//! WebSocket relay: channel-based fan-out of opaque payloads.
//!
//! ```text
//! Client A ──┐                         ┌──► Client B
//!            ├── Publish{channel} ──► channel group ──┤
//! Client C ──┘   (broadcast::Sender)   └──► Client C (not A)
//! ```
//!
//! The relay never looks inside a payload: document state lives only in
//! the sessions. Each channel is a `tokio::sync::broadcast` group; a
//! connection runs one forwarding task per subscribed channel feeding its
//! socket writer. Channels with no subscriber left are dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::transport::RelayFrame;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per subscriber before it lags
    pub channel_capacity: usize,
    /// Larger binary frames are dropped
    pub max_frame_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel_capacity: 256,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl RelayConfig {
    /// Ephemeral port, small buffers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            channel_capacity: 64,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_relayed: u64,
    pub bytes_relayed: u64,
    pub active_channels: usize,
}

/// One published frame, pre-encoded as `Deliver`.
struct Relayed {
    origin: u64,
    bytes: Vec<u8>,
}

type Channels = RwLock<HashMap<String, broadcast::Sender<Arc<Relayed>>>>;

struct RelayState {
    config: RelayConfig,
    channels: Channels,
    stats: RwLock<RelayStats>,
    next_connection: AtomicU64,
}

impl RelayState {
    async fn join(&self, channel: &str) -> broadcast::Receiver<Arc<Relayed>> {
        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(channel) {
                return sender.subscribe();
            }
        }
        let mut channels = self.channels.write().await;
        let rx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.config.channel_capacity).0)
            .subscribe();
        self.stats.write().await.active_channels = channels.len();
        rx
    }

    async fn publish(&self, origin: u64, channel: String, payload: Vec<u8>) {
        let sender = self.channels.read().await.get(&channel).cloned();
        let Some(sender) = sender else {
            log::debug!("Publish to unknown channel {channel} dropped");
            return;
        };

        let len = payload.len() as u64;
        let bytes = match (RelayFrame::Deliver { channel, payload }).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to encode delivery: {e}");
                return;
            }
        };
        let _ = sender.send(Arc::new(Relayed { origin, bytes }));

        let mut stats = self.stats.write().await;
        stats.frames_relayed += 1;
        stats.bytes_relayed += len;
    }

    async fn remove_if_empty(&self, channel: &str) {
        let mut channels = self.channels.write().await;
        if channels.get(channel).is_some_and(|s| s.receiver_count() == 0) {
            channels.remove(channel);
            log::debug!("Channel {channel} removed (empty)");
        }
        self.stats.write().await.active_channels = channels.len();
    }
}

/// The relay server.
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Bind the listening socket. Use port 0 to let the OS pick.
    pub async fn bind(config: RelayConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Relay listening on {local_addr}");

        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(RelayState {
                config,
                channels: RwLock::new(HashMap::new()),
                stats: RwLock::new(RelayStats::default()),
                next_connection: AtomicU64::new(1),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, state).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.state.stats.read().await.clone()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.state.config
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RelayState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let conn_id = state.next_connection.fetch_add(1, Ordering::Relaxed);

    log::info!("WebSocket connection {conn_id} established from {addr}");
    {
        let mut s = state.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let (out_tx, mut out_rx) = mpsc::channel::<Arc<Relayed>>(state.config.channel_capacity);
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    let result = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > state.config.max_frame_bytes {
                            log::warn!("Dropping {} byte frame from {addr}", data.len());
                            continue;
                        }
                        match RelayFrame::decode(&data) {
                            Ok(RelayFrame::Subscribe { channel }) => {
                                if forwarders.contains_key(&channel) {
                                    continue;
                                }
                                let rx = state.join(&channel).await;
                                log::debug!("Connection {conn_id} subscribed to {channel}");
                                forwarders.insert(channel, spawn_forwarder(conn_id, rx, out_tx.clone()));
                            }
                            Ok(RelayFrame::Unsubscribe { channel }) => {
                                if let Some(handle) = forwarders.remove(&channel) {
                                    handle.abort();
                                    let _ = handle.await;
                                    state.remove_if_empty(&channel).await;
                                }
                            }
                            Ok(RelayFrame::Publish { channel, payload }) => {
                                state.publish(conn_id, channel, payload).await;
                            }
                            Ok(RelayFrame::Deliver { .. }) => {
                                log::warn!("Client {addr} sent a Deliver frame");
                            }
                            Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {conn_id} closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },

                relayed = out_rx.recv() => {
                    if let Some(relayed) = relayed {
                        ws_sender.send(Message::Binary(relayed.bytes.clone().into())).await?;
                    }
                }
            }
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    }
    .await;

    for (channel, handle) in forwarders.drain() {
        handle.abort();
        let _ = handle.await;
        state.remove_if_empty(&channel).await;
    }
    state.stats.write().await.active_connections -= 1;

    result
}

/// Feed one channel's frames, minus our own, into the connection writer.
fn spawn_forwarder(
    conn_id: u64,
    mut rx: broadcast::Receiver<Arc<Relayed>>,
    out: mpsc::Sender<Arc<Relayed>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(relayed) => {
                    if relayed.origin == conn_id {
                        continue;
                    }
                    if out.send(relayed).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Connection {conn_id} lagged by {n} frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
