//! Document session: ties one [`TextDoc`] and one [`AwarenessStore`] to a
//! transport channel and a persistence store.
//!
//! ## Lifecycle
//!
//! ```text
//!  Connecting ──► Syncing ──► Synced
//!                   ▲  │         │
//!              Up   │  └── Down ─┴──► Disconnected
//!                   └────────────────────┘
//!  any ── close() ──► Closed
//! ```
//!
//! - **Connecting**: subscribe, load the stored snapshot as baseline
//!   (or seed, or start empty and report `LoadFailed`). A refused
//!   subscription does not stop the session: it opens `Disconnected`.
//! - **Syncing**: announce our state vector and presence. Synced after the
//!   first `SyncStep2` addressed to us, or once the grace period passes
//!   without an answer.
//! - **Disconnected**: edits keep applying locally and nothing is sent.
//!   On `Up` the state-vector handshake recovers whatever was missed.
//!   Without a subscription the session re-subscribes with backoff and
//!   runs the handshake once that succeeds.
//!
//! One task owns the document; handles talk to it over a command channel,
//! so local edits and remote integrations never interleave. Saves run on
//! their own task against a copy of the document and report back.

use std::sync::Arc;
use std::time::Duration;

use quill_text::codec;
use quill_text::{Delta, EncodingError, ReplicaId, StateVector, TextDoc, TextError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::awareness::{
    AwarenessChange, AwarenessEntry, AwarenessField, AwarenessStore, Cursor, Identity,
};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::storage::{PersistenceError, PersistenceStore};
use crate::transport::{Subscription, SyncTransport, TransportEvent};

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet period after the last local edit before saving
    pub persist_debounce: Duration,
    /// First retry delay after a failed save or subscribe; doubles per attempt
    pub retry_base: Duration,
    pub retry_max_delay: Duration,
    /// Retries after the first failed save attempt
    pub max_save_retries: u32,
    /// Presence liveness threshold; heartbeats go out every third of it
    pub awareness_timeout: Duration,
    /// How long to wait for a peer before declaring a lone session synced
    pub sync_grace: Duration,
    /// Initial content when nothing is stored yet
    pub seed_text: Option<String>,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persist_debounce: Duration::from_secs(1),
            retry_base: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(10),
            max_save_retries: 5,
            awareness_timeout: Duration::from_secs(30),
            sync_grace: Duration::from_secs(2),
            seed_text: None,
            command_buffer: 64,
            event_buffer: 256,
        }
    }
}

impl SessionConfig {
    /// Short timers so tests finish quickly.
    pub fn for_testing() -> Self {
        Self {
            persist_debounce: Duration::from_millis(50),
            retry_base: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(80),
            max_save_retries: 5,
            awareness_timeout: Duration::from_secs(3),
            sync_grace: Duration::from_millis(200),
            seed_text: None,
            command_buffer: 64,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Connecting,
    Syncing,
    Synced,
    Disconnected,
    Closed,
}

impl SyncState {
    fn is_online(self) -> bool {
        matches!(self, SyncState::Syncing | SyncState::Synced)
    }
}

/// Notifications for the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SyncState),
    TextChanged(String),
    AwarenessChanged(AwarenessChange),
    Saved,
    /// Retries exhausted; the document is not saved.
    SaveFailed { attempts: u32 },
    /// Stored snapshot unreadable; the session started empty.
    LoadFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The session task is gone.
    Closed,
    Text(TextError),
    Persistence(PersistenceError),
    Encoding(EncodingError),
    /// Presence state peers would reject.
    Protocol(ProtocolError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Closed => write!(f, "Session closed"),
            SessionError::Text(e) => write!(f, "{e}"),
            SessionError::Persistence(e) => write!(f, "{e}"),
            SessionError::Encoding(e) => write!(f, "{e}"),
            SessionError::Protocol(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<TextError> for SessionError {
    fn from(e: TextError) -> Self {
        SessionError::Text(e)
    }
}

impl From<PersistenceError> for SessionError {
    fn from(e: PersistenceError) -> Self {
        SessionError::Persistence(e)
    }
}

impl From<EncodingError> for SessionError {
    fn from(e: EncodingError) -> Self {
        SessionError::Encoding(e)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}

enum Command {
    Insert { offset: usize, text: String, reply: oneshot::Sender<Result<(), SessionError>> },
    Delete { offset: usize, length: usize, reply: oneshot::Sender<Result<(), SessionError>> },
    SetCursor { cursor: Option<Cursor>, reply: oneshot::Sender<()> },
    SetIdentity { identity: Identity, reply: oneshot::Sender<Result<(), SessionError>> },
    Text(oneshot::Sender<String>),
    StateVector(oneshot::Sender<StateVector>),
    Awareness(oneshot::Sender<Vec<AwarenessEntry>>),
    Close(oneshot::Sender<()>),
}

struct SaveOutcome {
    generation: u64,
    result: Result<Option<Delta>, SaveFailure>,
}

struct SaveFailure {
    attempts: u32,
    error: SessionError,
}

/// Builder for one document session.
///
/// Subscribe to events before [`start`](Self::start) to see what happens
/// while the session connects (notably `LoadFailed`).
pub struct SyncCoordinator {
    doc_id: Uuid,
    identity: Identity,
    transport: Arc<dyn SyncTransport>,
    store: Arc<dyn PersistenceStore>,
    config: SessionConfig,
    events: broadcast::Sender<SessionEvent>,
}

impl SyncCoordinator {
    pub fn new(
        doc_id: Uuid,
        identity: Identity,
        transport: Arc<dyn SyncTransport>,
        store: Arc<dyn PersistenceStore>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self { doc_id, identity, transport, store, config, events }
    }

    /// Open a session in one step.
    pub async fn open(
        doc_id: Uuid,
        identity: Identity,
        transport: Arc<dyn SyncTransport>,
        store: Arc<dyn PersistenceStore>,
        config: SessionConfig,
    ) -> Result<SessionHandle, SessionError> {
        Self::new(doc_id, identity, transport, store, config).start().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Run the connecting phase and spawn the session task.
    ///
    /// Fails only if the identity would be rejected by peers. A transport
    /// that refuses the subscription leaves the session `Disconnected`
    /// and retrying in the background.
    pub async fn start(self) -> Result<SessionHandle, SessionError> {
        let replica = ReplicaId::random();
        let awareness =
            AwarenessStore::with_timeout(replica, self.identity.clone(), self.config.awareness_timeout);
        if let Some(state) = awareness.local_state() {
            state.validate()?;
        }

        let channel = self.doc_id.to_string();
        let (state_tx, state_rx) = watch::channel(SyncState::Connecting);
        let _ = self.events.send(SessionEvent::StateChanged(SyncState::Connecting));

        let subscription = match self.transport.subscribe(&channel).await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                log::warn!("Subscribing {replica} to {channel} failed, starting offline: {e}");
                None
            }
        };
        let doc = self.load_baseline(replica).await;
        log::info!(
            "Session {replica} opened document {} ({} chars)",
            self.doc_id,
            doc.len()
        );

        let (command_tx, command_rx) = mpsc::channel(self.config.command_buffer.max(1));
        let (outcome_tx, outcome_rx) = mpsc::channel(4);
        let resubscribe_delay = self.config.retry_base;

        let actor = SessionActor {
            doc_id: self.doc_id,
            channel,
            replica,
            doc,
            awareness,
            transport: self.transport,
            store: self.store,
            config: self.config,
            state: SyncState::Connecting,
            state_tx,
            events: self.events.clone(),
            generation: 0,
            saved_generation: 0,
            persist_at: None,
            sync_deadline: None,
            resubscribe_at: None,
            resubscribe_delay,
            save_task: None,
            save_queued: false,
            outcome_tx,
        };
        tokio::spawn(actor.run(command_rx, subscription, outcome_rx));

        Ok(SessionHandle {
            doc_id: self.doc_id,
            replica,
            commands: command_tx,
            state: state_rx,
            events: self.events,
        })
    }

    async fn load_baseline(&self, replica: ReplicaId) -> TextDoc {
        let loaded = match self.store.load(self.doc_id).await {
            Ok(loaded) => loaded,
            Err(e) => {
                log::warn!("Loading {} failed, starting empty: {e}", self.doc_id);
                let _ = self.events.send(SessionEvent::LoadFailed(e.to_string()));
                return TextDoc::new(replica);
            }
        };

        match loaded {
            Some(bytes) => match codec::decode_delta(&bytes) {
                Ok(delta) => {
                    let mut doc = TextDoc::new(replica);
                    doc.integrate(&delta);
                    doc
                }
                Err(e) => {
                    log::warn!("Stored snapshot of {} is unreadable, starting empty: {e}", self.doc_id);
                    let _ = self.events.send(SessionEvent::LoadFailed(e.to_string()));
                    TextDoc::new(replica)
                }
            },
            None => match &self.config.seed_text {
                Some(seed) => TextDoc::seeded(replica, seed),
                None => TextDoc::new(replica),
            },
        }
    }
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    doc_id: Uuid,
    replica: ReplicaId,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SyncState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn insert(&self, offset: usize, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        self.request(|reply| Command::Insert { offset, text, reply }).await?
    }

    pub async fn delete(&self, offset: usize, length: usize) -> Result<(), SessionError> {
        self.request(|reply| Command::Delete { offset, length, reply }).await?
    }

    pub async fn set_cursor(&self, cursor: Option<Cursor>) -> Result<(), SessionError> {
        self.request(|reply| Command::SetCursor { cursor, reply }).await
    }

    /// Fails with [`SessionError::Protocol`] if peers would reject the
    /// identity; the previous one stays in place.
    pub async fn set_identity(&self, identity: Identity) -> Result<(), SessionError> {
        self.request(|reply| Command::SetIdentity { identity, reply }).await?
    }

    pub async fn text(&self) -> Result<String, SessionError> {
        self.request(Command::Text).await
    }

    pub async fn state_vector(&self) -> Result<StateVector, SessionError> {
        self.request(Command::StateVector).await
    }

    /// Live presence entries, cursors clamped to the current text.
    pub async fn awareness(&self) -> Result<Vec<AwarenessEntry>, SessionError> {
        self.request(Command::Awareness).await
    }

    pub fn sync_state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Resolve once the session reaches `state`.
    pub async fn wait_for_state(&self, state: SyncState) -> Result<(), SessionError> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == state).await.map_err(|_| SessionError::Closed)?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Tear the session down and wait for it: final save if dirty,
    /// presence leave, unsubscribe.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.request(Command::Close).await
    }
}

struct SessionActor {
    doc_id: Uuid,
    channel: String,
    replica: ReplicaId,
    doc: TextDoc,
    awareness: AwarenessStore,
    transport: Arc<dyn SyncTransport>,
    store: Arc<dyn PersistenceStore>,
    config: SessionConfig,
    state: SyncState,
    state_tx: watch::Sender<SyncState>,
    events: broadcast::Sender<SessionEvent>,
    /// Bumped on every local edit.
    generation: u64,
    /// Generation covered by the last successful save.
    saved_generation: u64,
    persist_at: Option<Instant>,
    sync_deadline: Option<Instant>,
    /// Next subscribe attempt while the session has no subscription.
    resubscribe_at: Option<Instant>,
    resubscribe_delay: Duration,
    save_task: Option<JoinHandle<()>>,
    /// Debounce fired while a save was still running.
    save_queued: bool,
    outcome_tx: mpsc::Sender<SaveOutcome>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut subscription: Option<Subscription>,
        mut outcomes: mpsc::Receiver<SaveOutcome>,
    ) {
        if subscription.is_some() {
            self.enter_syncing().await;
        } else {
            self.set_state(SyncState::Disconnected);
            self.schedule_resubscribe();
        }

        let period = self.awareness.heartbeat_interval().max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Close(reply)) => {
                        self.shutdown(subscription.take()).await;
                        // Release the store before acknowledging.
                        drop(self);
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.shutdown(subscription.take()).await;
                        return;
                    }
                },

                event = next_event(&mut subscription) => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        log::warn!("Transport dropped the subscription of {}", self.replica);
                        subscription = None;
                        self.set_state(SyncState::Disconnected);
                        self.schedule_resubscribe();
                    }
                },

                _ = sleep_until_opt(self.resubscribe_at) => {
                    self.resubscribe_at = None;
                    self.resubscribe(&mut subscription).await;
                }

                Some(outcome) = outcomes.recv() => self.handle_save_outcome(outcome),

                _ = sleep_until_opt(self.persist_at) => {
                    self.persist_at = None;
                    self.request_save();
                }

                _ = sleep_until_opt(self.sync_deadline) => {
                    self.sync_deadline = None;
                    if self.state == SyncState::Syncing {
                        log::info!("No peer answered {} within the grace period", self.replica);
                        self.set_state(SyncState::Synced);
                    }
                }

                _ = heartbeat.tick() => self.on_heartbeat().await,
            }
        }
    }

    fn set_state(&mut self, state: SyncState) {
        if self.state == state {
            return;
        }
        log::info!("Session {} on {}: {:?} -> {:?}", self.replica, self.doc_id, self.state, state);
        self.state = state;
        if state != SyncState::Syncing {
            self.sync_deadline = None;
        }
        let _ = self.state_tx.send(state);
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn emit_text(&self) {
        self.emit(SessionEvent::TextChanged(self.doc.materialize()));
    }

    async fn enter_syncing(&mut self) {
        self.set_state(SyncState::Syncing);
        self.sync_deadline = Some(Instant::now() + self.config.sync_grace);
        let hello = SyncMessage::sync_step1(self.replica, self.doc_id, self.doc.state_vector());
        self.send(hello).await;
        self.broadcast_presence().await;
    }

    fn schedule_resubscribe(&mut self) {
        self.resubscribe_at = Some(Instant::now() + self.resubscribe_delay);
    }

    async fn resubscribe(&mut self, subscription: &mut Option<Subscription>) {
        match self.transport.subscribe(&self.channel).await {
            Ok(fresh) => {
                log::info!("Session {} subscribed to {}", self.replica, self.channel);
                *subscription = Some(fresh);
                self.resubscribe_delay = self.config.retry_base;
                self.enter_syncing().await;
            }
            Err(e) => {
                log::debug!("Subscribe for {} failed again: {e}", self.replica);
                self.resubscribe_delay = (self.resubscribe_delay * 2).min(self.config.retry_max_delay);
                self.schedule_resubscribe();
            }
        }
    }

    async fn broadcast_presence(&mut self) {
        if let Some(update) = self.awareness.heartbeat() {
            let msg = SyncMessage::awareness(self.replica, self.doc_id, &update);
            self.send(msg).await;
        }
    }

    /// Encode and broadcast, unless offline. A failed send means the link is down.
    async fn send(&mut self, msg: Result<SyncMessage, ProtocolError>) {
        if !self.state.is_online() {
            return;
        }
        let bytes = match msg.and_then(|m| m.encode()) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to encode outbound message: {e}");
                return;
            }
        };
        if let Err(e) = self.transport.broadcast(&self.channel, bytes).await {
            log::warn!("Broadcast from {} failed: {e}", self.replica);
            self.set_state(SyncState::Disconnected);
        }
    }

    // ── Commands ─────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Insert { offset, text, reply } => {
                let result = self.doc.insert(offset, &text).map_err(SessionError::from);
                let _ = reply.send(self.after_local_edit(result).await);
            }
            Command::Delete { offset, length, reply } => {
                let result = self.doc.delete(offset, length).map_err(SessionError::from);
                let _ = reply.send(self.after_local_edit(result).await);
            }
            Command::SetCursor { cursor, reply } => {
                if let Err(e) = self.set_local_field(AwarenessField::Cursor(cursor)).await {
                    log::warn!("Ignoring cursor for {}: {e}", self.replica);
                }
                let _ = reply.send(());
            }
            Command::SetIdentity { identity, reply } => {
                let result = self.set_local_field(AwarenessField::Identity(identity)).await;
                let _ = reply.send(result);
            }
            Command::Text(reply) => {
                let _ = reply.send(self.doc.materialize());
            }
            Command::StateVector(reply) => {
                let _ = reply.send(self.doc.state_vector().clone());
            }
            Command::Awareness(reply) => {
                let len = self.doc.len();
                let mut entries = self.awareness.snapshot();
                for entry in &mut entries {
                    entry.state.cursor = entry.state.cursor.map(|c| c.clamped(len));
                }
                let _ = reply.send(entries);
            }
            // Handled by the run loop.
            Command::Close(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn after_local_edit(&mut self, result: Result<Delta, SessionError>) -> Result<(), SessionError> {
        let delta = result?;
        if delta.is_empty() {
            return Ok(());
        }
        self.generation += 1;
        self.persist_at = Some(Instant::now() + self.config.persist_debounce);

        let update = SyncMessage::update(self.replica, self.doc_id, &delta);
        self.send(update).await;
        self.emit_text();
        Ok(())
    }

    async fn set_local_field(&mut self, field: AwarenessField) -> Result<(), SessionError> {
        let update = self.awareness.set_local_field(field)?;
        let msg = SyncMessage::awareness(self.replica, self.doc_id, &update);
        self.send(msg).await;
        self.emit(SessionEvent::AwarenessChanged(AwarenessChange {
            updated: vec![self.replica],
            ..AwarenessChange::default()
        }));
        Ok(())
    }

    // ── Transport ────────────────────────────────────────────────

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(bytes) => {
                if let Err(e) = self.handle_message(&bytes).await {
                    log::warn!("Dropping message for {}: {e}", self.replica);
                }
            }
            TransportEvent::Down => self.set_state(SyncState::Disconnected),
            TransportEvent::Up => {
                if self.state == SyncState::Disconnected {
                    self.enter_syncing().await;
                }
            }
        }
    }

    async fn handle_message(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let msg = SyncMessage::decode(bytes)?;
        if !msg.is_for(self.replica, self.doc_id) {
            return Ok(());
        }

        match msg.msg_type {
            MessageType::SyncStep1 => {
                let remote = msg.state_vector()?;
                let diff = self.doc.diff(&remote);
                log::debug!(
                    "{} answers state vector of {} with {} items",
                    self.replica,
                    msg.sender,
                    diff.items.len()
                );
                let reply = SyncMessage::sync_step2(self.replica, self.doc_id, msg.sender, &diff);
                self.send(reply).await;

                if msg.target.is_none() {
                    let ours = SyncMessage::sync_step1_reply(
                        self.replica,
                        self.doc_id,
                        msg.sender,
                        self.doc.state_vector(),
                    );
                    self.send(ours).await;
                    // Let the newcomer see us without waiting for a heartbeat.
                    self.broadcast_presence().await;
                }
            }
            MessageType::SyncStep2 => {
                let delta = msg.delta()?;
                self.integrate(&delta);
                if self.state == SyncState::Syncing {
                    self.set_state(SyncState::Synced);
                }
            }
            MessageType::Update => {
                let delta = msg.delta()?;
                self.integrate(&delta);
            }
            MessageType::Awareness => {
                let update = msg.awareness_update()?;
                let change = self.awareness.apply_remote(&update, std::time::Instant::now());
                if !change.is_empty() {
                    self.emit(SessionEvent::AwarenessChanged(change));
                }
            }
        }
        Ok(())
    }

    fn integrate(&mut self, delta: &Delta) {
        let report = self.doc.integrate(delta);
        if report.changed() {
            self.emit_text();
        }
    }

    async fn on_heartbeat(&mut self) {
        self.broadcast_presence().await;
        let change = self.awareness.expire(std::time::Instant::now());
        if !change.is_empty() {
            self.emit(SessionEvent::AwarenessChanged(change));
        }
    }

    // ── Persistence ──────────────────────────────────────────────

    fn is_dirty(&self) -> bool {
        self.generation > self.saved_generation
    }

    fn request_save(&mut self) {
        if !self.is_dirty() {
            return;
        }
        if self.save_task.is_some() {
            self.save_queued = true;
            return;
        }

        let store = self.store.clone();
        let doc_id = self.doc_id;
        let snapshot = self.doc.clone();
        let generation = self.generation;
        let config = self.config.clone();
        let outcomes = self.outcome_tx.clone();
        self.save_task = Some(tokio::spawn(async move {
            let result = save_with_retry(store.as_ref(), doc_id, snapshot, &config).await;
            let _ = outcomes.send(SaveOutcome { generation, result }).await;
        }));
    }

    fn handle_save_outcome(&mut self, outcome: SaveOutcome) {
        self.save_task = None;
        match outcome.result {
            Ok(stored) => {
                self.saved_generation = self.saved_generation.max(outcome.generation);
                log::debug!("Saved {} at generation {}", self.doc_id, outcome.generation);
                // Other sessions may have stored edits we have not seen.
                if let Some(stored) = stored {
                    self.integrate(&stored);
                }
                self.emit(SessionEvent::Saved);
                if std::mem::take(&mut self.save_queued) {
                    self.request_save();
                }
            }
            Err(failure) => {
                log::error!(
                    "Giving up saving {} after {} attempts: {}",
                    self.doc_id,
                    failure.attempts,
                    failure.error
                );
                self.save_queued = false;
                self.emit(SessionEvent::SaveFailed { attempts: failure.attempts });
            }
        }
    }

    async fn shutdown(&mut self, subscription: Option<Subscription>) {
        self.persist_at = None;
        self.sync_deadline = None;
        self.resubscribe_at = None;

        if let Some(task) = self.save_task.take() {
            task.abort();
            let _ = task.await;
        }
        if self.is_dirty() {
            let mut snapshot = self.doc.clone();
            match persist_once(self.store.as_ref(), self.doc_id, &mut snapshot).await {
                Ok(_) => {
                    self.saved_generation = self.generation;
                    self.emit(SessionEvent::Saved);
                }
                Err(e) => {
                    log::error!("Final save of {} failed: {e}", self.doc_id);
                    self.emit(SessionEvent::SaveFailed { attempts: 1 });
                }
            }
        }

        let leave = self.awareness.remove_local();
        let msg = SyncMessage::awareness(self.replica, self.doc_id, &leave);
        self.send(msg).await;

        if let Some(subscription) = subscription {
            if let Err(e) = self.transport.unsubscribe(subscription.id()).await {
                log::debug!("Unsubscribe on close failed: {e}");
            }
        }
        self.set_state(SyncState::Closed);
    }
}

async fn next_event(subscription: &mut Option<Subscription>) -> Option<TransportEvent> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Read-merge-write: fold whatever is stored into `doc`, then store the union.
///
/// Returns the stored delta so the caller can pick up foreign edits.
async fn persist_once(
    store: &dyn PersistenceStore,
    doc_id: Uuid,
    doc: &mut TextDoc,
) -> Result<Option<Delta>, SessionError> {
    let stored = match store.load(doc_id).await? {
        Some(bytes) => match codec::decode_delta(&bytes) {
            Ok(delta) => Some(delta),
            Err(e) => {
                log::warn!("Overwriting unreadable snapshot of {doc_id}: {e}");
                None
            }
        },
        None => None,
    };
    if let Some(delta) = &stored {
        doc.integrate(delta);
    }

    let bytes = codec::encode_delta(&doc.encode_state())?;
    store.save(doc_id, &bytes).await?;
    Ok(stored)
}

async fn save_with_retry(
    store: &dyn PersistenceStore,
    doc_id: Uuid,
    mut doc: TextDoc,
    config: &SessionConfig,
) -> Result<Option<Delta>, SaveFailure> {
    let mut delay = config.retry_base;
    let mut attempts = 0;
    loop {
        attempts += 1;
        match persist_once(store, doc_id, &mut doc).await {
            Ok(stored) => return Ok(stored),
            Err(error) if attempts > config.max_save_retries => {
                return Err(SaveFailure { attempts, error });
            }
            Err(e) => {
                log::warn!("Save attempt {attempts} for {doc_id} failed: {e}; retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(config.retry_max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::transport::LocalHub;

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.persist_debounce, Duration::from_secs(1));
        assert_eq!(config.awareness_timeout, Duration::from_secs(30));
        assert!(config.seed_text.is_none());
    }

    #[test]
    fn test_online_states() {
        assert!(SyncState::Syncing.is_online());
        assert!(SyncState::Synced.is_online());
        assert!(!SyncState::Disconnected.is_online());
        assert!(!SyncState::Connecting.is_online());
        assert!(!SyncState::Closed.is_online());
    }

    #[tokio::test]
    async fn test_persist_once_merges_stored_state() {
        let store = MemoryStore::new();
        let doc_id = Uuid::new_v4();

        let mut other = TextDoc::new(ReplicaId(1));
        other.insert(0, "theirs").unwrap();
        store.put(doc_id, codec::encode_delta(&other.encode_state()).unwrap());

        let mut ours = TextDoc::new(ReplicaId(2));
        ours.insert(0, "ours").unwrap();
        let stored = persist_once(&store, doc_id, &mut ours).await.unwrap();
        assert!(stored.is_some());

        let saved = codec::decode_delta(&store.get(doc_id).unwrap()).unwrap();
        let mut check = TextDoc::new(ReplicaId(3));
        check.integrate(&saved);
        assert_eq!(check.len(), 10);
        assert_eq!(check.materialize(), ours.materialize());
    }

    #[tokio::test]
    async fn test_save_with_retry_gives_up() {
        let store = MemoryStore::new();
        store.fail_next_saves(100);
        let mut config = SessionConfig::for_testing();
        config.max_save_retries = 2;

        let result = save_with_retry(&store, Uuid::new_v4(), TextDoc::new(ReplicaId(1)), &config).await;
        match result {
            Err(failure) => assert_eq!(failure.attempts, 3),
            Ok(_) => panic!("save should have failed"),
        }
        assert_eq!(store.save_attempts(), 3);
    }

    #[tokio::test]
    async fn test_lone_session_becomes_synced() {
        let hub = LocalHub::new(64);
        let session = SyncCoordinator::open(
            Uuid::new_v4(),
            Identity::new("u", "Solo"),
            Arc::new(hub.endpoint()),
            Arc::new(MemoryStore::new()),
            SessionConfig::for_testing(),
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), session.wait_for_state(SyncState::Synced))
            .await
            .unwrap()
            .unwrap();
        session.close().await.unwrap();
        assert_eq!(session.sync_state(), SyncState::Closed);
        assert_eq!(session.insert(0, "late").await, Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn test_bad_offset_reported() {
        let hub = LocalHub::new(64);
        let session = SyncCoordinator::open(
            Uuid::new_v4(),
            Identity::new("u", "Solo"),
            Arc::new(hub.endpoint()),
            Arc::new(MemoryStore::new()),
            SessionConfig::for_testing(),
        )
        .await
        .unwrap();

        assert_eq!(
            session.insert(3, "x").await,
            Err(SessionError::Text(TextError::OffsetOutOfBounds { offset: 3, len: 0 }))
        );
        assert_eq!(session.text().await.unwrap(), "");
    }
}
