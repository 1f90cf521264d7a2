//! WebSocket client transport talking to a [`RelayServer`](crate::server::RelayServer).
//!
//! Provides:
//! - channel subscribe/unsubscribe multiplexed over one socket
//! - a supervisor task that reconnects with exponential backoff
//!   (100 ms doubling to 5 s) and re-subscribes every live channel
//! - `Down`/`Up` events so sessions can resynchronise
//!
//! Nothing is queued while disconnected: `broadcast` fails with
//! `NotConnected` and recovery is left to the state-vector handshake.
//! An unreachable relay at connect time is treated like a later drop.
//!
//! Inbound frames are handed to subscriptions without waiting: a
//! subscriber whose buffer is full loses the frame, so one slow session
//! never stalls the socket for the others.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use super::{
    Subscription, SubscriptionId, SyncTransport, TransportError, TransportEvent, SUBSCRIPTION_BUFFER,
};

pub const RECONNECT_BASE: Duration = Duration::from_millis(100);
pub const RECONNECT_MAX: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Frames exchanged between a client and the relay (bincode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    /// Client → relay: fan out to every other subscriber.
    Publish { channel: String, payload: Vec<u8> },
    /// Relay → client.
    Deliver { channel: String, payload: Vec<u8> },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        let (frame, read): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| TransportError::Io(e.to_string()))?;
        if read != bytes.len() {
            return Err(TransportError::Io(format!("{} trailing bytes", bytes.len() - read)));
        }
        Ok(frame)
    }
}

struct Shared {
    url: String,
    connected: AtomicBool,
    subscriptions: Mutex<HashMap<SubscriptionId, (String, mpsc::Sender<TransportEvent>)>>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionId, (String, mpsc::Sender<TransportEvent>)>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn channels(&self) -> BTreeSet<String> {
        self.lock().values().map(|(channel, _)| channel.clone()).collect()
    }

    fn senders(&self, channel: Option<&str>) -> Vec<mpsc::Sender<TransportEvent>> {
        self.lock()
            .values()
            .filter(|(c, _)| channel.map_or(true, |wanted| c == wanted))
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    fn notify(&self, channel: Option<&str>, event: TransportEvent) {
        for tx in self.senders(channel) {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(TransportEvent::Message(_))) => {
                    log::warn!("Subscriber on {} is not keeping up, dropping frame", self.url);
                }
                // Link changes must arrive, just not at the cost of the pump.
                Err(mpsc::error::TrySendError::Full(link)) => {
                    tokio::spawn(async move {
                        let _ = tx.send(link).await;
                    });
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// Relay client.
pub struct WebSocketTransport {
    shared: Arc<Shared>,
    outgoing: mpsc::Sender<RelayFrame>,
    next_subscription: AtomicU64,
    supervisor: JoinHandle<()>,
}

impl WebSocketTransport {
    /// Connect to `url` (e.g. `ws://127.0.0.1:9090`).
    ///
    /// Only a malformed URL is an error. If the relay cannot be reached the
    /// transport starts disconnected and keeps retrying in the background,
    /// announcing `Up` to subscribers once it gets through.
    pub async fn connect(url: impl Into<String>) -> Result<Self, TransportError> {
        let url = url.into();
        url.as_str()
            .into_client_request()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let first = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                log::info!("Connected to relay at {url}");
                Some(stream)
            }
            Err(e) => {
                log::warn!("Relay at {url} unreachable, retrying in the background: {e}");
                None
            }
        };

        let shared = Arc::new(Shared {
            url,
            connected: AtomicBool::new(first.is_some()),
            subscriptions: Mutex::new(HashMap::new()),
        });
        let (outgoing, out_rx) = mpsc::channel(256);
        let supervisor = tokio::spawn(supervise(shared.clone(), first, out_rx));

        Ok(Self {
            shared,
            outgoing,
            next_subscription: AtomicU64::new(1),
            supervisor,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    async fn send_frame(&self, frame: RelayFrame) -> Result<(), TransportError> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[async_trait]
impl SyncTransport for WebSocketTransport {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        let (tx, events) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.shared.lock().insert(id, (channel.to_string(), tx));

        // While disconnected the supervisor re-subscribes on reconnect.
        if self.is_connected() {
            self.send_frame(RelayFrame::Subscribe { channel: channel.to_string() }).await?;
        }
        Ok(Subscription::new(id, channel, events))
    }

    async fn broadcast(&self, channel: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.send_frame(RelayFrame::Publish { channel: channel.to_string(), payload: bytes }).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        let (channel, _) = self.shared.lock().remove(&id).ok_or(TransportError::ChannelClosed)?;
        let still_used = self.shared.channels().contains(&channel);
        if !still_used && self.is_connected() {
            self.send_frame(RelayFrame::Unsubscribe { channel }).await?;
        }
        Ok(())
    }
}

enum PumpExit {
    /// Transport dropped.
    Shutdown,
    Lost(String),
}

async fn supervise(
    shared: Arc<Shared>,
    first: Option<WsStream>,
    mut outgoing: mpsc::Receiver<RelayFrame>,
) {
    let mut live = first;
    loop {
        let stream = match live.take() {
            Some(stream) => stream,
            None => {
                let stream = reconnect(&shared).await;
                shared.connected.store(true, Ordering::SeqCst);
                log::info!("Reconnected to relay at {}", shared.url);
                shared.notify(None, TransportEvent::Up);
                stream
            }
        };

        match pump(&shared, stream, &mut outgoing).await {
            PumpExit::Shutdown => return,
            PumpExit::Lost(reason) => {
                shared.connected.store(false, Ordering::SeqCst);
                log::warn!("Relay connection to {} lost: {reason}", shared.url);
                shared.notify(None, TransportEvent::Down);
            }
        }
    }
}

/// Retry until a socket is up and every live channel is re-subscribed.
async fn reconnect(shared: &Shared) -> WsStream {
    let mut delay = RECONNECT_BASE;
    loop {
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(RECONNECT_MAX);

        let mut stream = match tokio_tungstenite::connect_async(shared.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                log::debug!("Reconnect to {} failed: {e}", shared.url);
                continue;
            }
        };

        let mut resubscribed = true;
        for channel in shared.channels() {
            let sent = match (RelayFrame::Subscribe { channel }).encode() {
                Ok(bytes) => stream.send(Message::Binary(bytes.into())).await.is_ok(),
                Err(_) => false,
            };
            if !sent {
                resubscribed = false;
                break;
            }
        }
        if resubscribed {
            return stream;
        }
    }
}

async fn pump(shared: &Shared, stream: WsStream, outgoing: &mut mpsc::Receiver<RelayFrame>) -> PumpExit {
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            frame = outgoing.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.close().await;
                    return PumpExit::Shutdown;
                };
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("Dropping unencodable relay frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                    return PumpExit::Lost(e.to_string());
                }
            }

            msg = source.next() => match msg {
                Some(Ok(Message::Binary(data))) => match RelayFrame::decode(&data) {
                    Ok(RelayFrame::Deliver { channel, payload }) => {
                        shared.notify(Some(&channel), TransportEvent::Message(payload));
                    }
                    Ok(other) => log::debug!("Ignoring unexpected relay frame {other:?}"),
                    Err(e) => log::warn!("Failed to decode relay frame: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => return PumpExit::Lost("closed by relay".into()),
                Some(Err(e)) => return PumpExit::Lost(e.to_string()),
                Some(Ok(_)) => {}
            }
        }
    }
}
