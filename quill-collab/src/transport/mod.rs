//! Pub/sub channel abstraction between sessions.
//!
//! ```text
//! SyncCoordinator ── broadcast(channel, bytes) ──► dyn SyncTransport
//!        ▲                                              │
//!        └──── Subscription::recv() ◄── TransportEvent ─┘
//! ```
//!
//! Delivery is at most once per send with no ordering guarantee. A
//! sender never receives its own broadcasts. `Down`/`Up` tell the
//! subscriber that the link dropped and came back; anything sent in
//! between is lost and must be recovered by the caller.

pub mod hub;
pub mod websocket;

pub use hub::{HubTransport, LocalHub};
pub use websocket::{RelayFrame, WebSocketTransport};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Buffered events per subscription before the feeder waits.
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(Vec<u8>),
    /// Link lost.
    Down,
    /// Link restored.
    Up,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    NotConnected,
    ChannelClosed,
    Io(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NotConnected => write!(f, "Transport not connected"),
            TransportError::ChannelClosed => write!(f, "Transport channel closed"),
            TransportError::Io(e) => write!(f, "Transport I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Handle identifying one subscription for `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Receiving side of one channel subscription.
pub struct Subscription {
    id: SubscriptionId,
    channel: String,
    events: mpsc::Receiver<TransportEvent>,
}

impl Subscription {
    pub fn new(id: SubscriptionId, channel: impl Into<String>, events: mpsc::Receiver<TransportEvent>) -> Self {
        Self { id, channel: channel.into(), events }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next event; `None` once the transport dropped the subscription.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

/// Broadcast channel used by document sessions.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError>;

    /// Send to every other subscriber of `channel`.
    async fn broadcast(&self, channel: &str, bytes: Vec<u8>) -> Result<(), TransportError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError>;
}
