//! In-process fan-out transport.
//!
//! Every channel is one `tokio::sync::broadcast` group. Each subscription
//! gets its own receiver plus a forwarding task that filters out the
//! subscriber's own frames and anything arriving while its endpoint is
//! offline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{
    Subscription, SubscriptionId, SyncTransport, TransportError, TransportEvent, SUBSCRIPTION_BUFFER,
};

/// A published payload tagged with the endpoint that sent it.
#[derive(Debug)]
struct HubFrame {
    origin: u64,
    payload: Vec<u8>,
}

/// Hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub messages_sent: u64,
    /// Frames skipped by lagging subscribers.
    pub messages_dropped: u64,
}

#[derive(Default)]
struct AtomicHubStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

struct HubInner {
    channels: RwLock<HashMap<String, broadcast::Sender<Arc<HubFrame>>>>,
    capacity: usize,
    next_endpoint: AtomicU64,
    stats: AtomicHubStats,
}

/// Shared switchboard. Cheap to clone; clones see the same channels.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    /// `capacity` frames are buffered per subscriber before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: RwLock::new(HashMap::new()),
                capacity,
                next_endpoint: AtomicU64::new(1),
                stats: AtomicHubStats::default(),
            }),
        }
    }

    /// A new, online endpoint attached to this hub.
    pub fn endpoint(&self) -> HubTransport {
        HubTransport {
            hub: self.clone(),
            endpoint: self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed),
            online: Arc::new(AtomicBool::new(true)),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    async fn join(&self, channel: &str) -> broadcast::Receiver<Arc<HubFrame>> {
        {
            let channels = self.inner.channels.read().await;
            if let Some(sender) = channels.get(channel) {
                return sender.subscribe();
            }
        }

        let mut channels = self.inner.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .subscribe()
    }

    async fn publish(&self, channel: &str, frame: HubFrame) -> usize {
        let sender = {
            let channels = self.inner.channels.read().await;
            channels.get(channel).cloned()
        };
        self.inner.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        match sender {
            Some(sender) => sender.send(Arc::new(frame)).unwrap_or(0),
            None => 0,
        }
    }

    async fn remove_if_empty(&self, channel: &str) -> bool {
        let mut channels = self.inner.channels.write().await;
        if channels.get(channel).is_some_and(|s| s.receiver_count() == 0) {
            channels.remove(channel);
            log::debug!("Hub channel {channel} removed (empty)");
            return true;
        }
        false
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.channels.read().await.len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            messages_sent: self.inner.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.inner.stats.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(256)
    }
}

struct HubSubscription {
    channel: String,
    events: mpsc::Sender<TransportEvent>,
    forwarder: JoinHandle<()>,
}

/// One participant's view of a [`LocalHub`].
pub struct HubTransport {
    hub: LocalHub,
    endpoint: u64,
    online: Arc<AtomicBool>,
    subscriptions: Mutex<HashMap<SubscriptionId, HubSubscription>>,
    next_subscription: AtomicU64,
}

impl HubTransport {
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Simulate a link drop or recovery.
    ///
    /// Subscriptions get `Down`/`Up`; while offline nothing is sent or delivered.
    pub async fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        log::info!(
            "Hub endpoint {} is now {}",
            self.endpoint,
            if online { "online" } else { "offline" }
        );

        let senders: Vec<mpsc::Sender<TransportEvent>> = {
            let subs = self.subscriptions.lock().await;
            subs.values().map(|s| s.events.clone()).collect()
        };
        let event = if online { TransportEvent::Up } else { TransportEvent::Down };
        for tx in senders {
            let _ = tx.send(event.clone()).await;
        }
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}

#[async_trait]
impl SyncTransport for HubTransport {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        let mut rx = self.hub.join(channel).await;
        let (tx, events) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));

        let endpoint = self.endpoint;
        let online = self.online.clone();
        let hub = self.hub.clone();
        let feed = tx.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if frame.origin == endpoint || !online.load(Ordering::SeqCst) {
                            continue;
                        }
                        if feed.send(TransportEvent::Message(frame.payload.clone())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Hub endpoint {endpoint} lagged by {n} messages");
                        hub.inner.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.subscriptions.lock().await.insert(
            id,
            HubSubscription { channel: channel.to_string(), events: tx, forwarder },
        );
        Ok(Subscription::new(id, channel, events))
    }

    async fn broadcast(&self, channel: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_online() {
            return Err(TransportError::NotConnected);
        }
        let frame = HubFrame { origin: self.endpoint, payload: bytes };
        let receivers = self.hub.publish(channel, frame).await;
        log::trace!("Hub endpoint {} published to {receivers} receivers on {channel}", self.endpoint);
        Ok(())
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        let sub = self
            .subscriptions
            .lock()
            .await
            .remove(&id)
            .ok_or(TransportError::ChannelClosed)?;
        sub.forwarder.abort();
        let _ = sub.forwarder.await;
        self.hub.remove_if_empty(&sub.channel).await;
        Ok(())
    }
}

impl Drop for HubTransport {
    fn drop(&mut self) {
        for sub in self.subscriptions.get_mut().values() {
            sub.forwarder.abort();
        }
    }
}
