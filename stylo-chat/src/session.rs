//! Chat session: the provider-scoped owner of connections and state.
//!
//! A [`ChatSession`] is constructed explicitly when the chat surface mounts
//! and torn down with [`ChatSession::shutdown`] (or by dropping it). It owns:
//!
//! - one [`Connection`] per open conversation
//! - the [`Dispatcher`] and, through it, the store and presence tracker
//! - a `watch` channel publishing an immutable [`ChatSnapshot`] after every
//!   state change
//! - a bounded notice channel for one-shot events (alerts, errors, closes)
//!
//! The session does no work on its own: the caller drives it with
//! [`ChatSession::step`] (async) or [`ChatSession::process_pending`].

use std::collections::BTreeMap;
use std::future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::connection::{Connection, ConnectionState};
use crate::dispatcher::{ChatNotice, Dispatcher, Effect};
use crate::error::ChatError;
use crate::presence::{PresenceSnapshot, PresenceTracker};
use crate::protocol::{
    self, Conversation, ConversationSnapshot, Envelope, EnvelopeBody, SearchPayload,
};
use crate::store::{ConversationStore, StoreSnapshot};
use crate::transport::{
    ConnectionId, Connector, TransportEvent, WsConnector, CLOSE_NORMAL,
};

/// Everything a UI needs to render, at one point in time.
#[derive(Debug, Clone, Default)]
pub struct ChatSnapshot {
    pub store: StoreSnapshot,
    pub presence: PresenceSnapshot,
    /// conversation_id → state of its connection
    pub connections: BTreeMap<String, ConnectionState>,
}

impl ChatSnapshot {
    pub fn connection_state(&self, conversation_id: &str) -> Option<ConnectionState> {
        self.connections.get(conversation_id).copied()
    }
}

/// What woke [`ChatSession::step`].
enum Wake {
    Event(ConnectionId, TransportEvent),
    TypingDeadline,
    Idle,
}

/// Provider-scoped chat session.
pub struct ChatSession<C: Connector = WsConnector> {
    config: ChatConfig,
    user_id: String,
    connector: C,
    dispatcher: Dispatcher,

    /// Live connections, keyed by conversation id.
    connections: BTreeMap<String, Connection>,
    next_connection_id: u64,

    /// Transport events from every connection, tagged by id.
    events_tx: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>,
    events_rx: mpsc::UnboundedReceiver<(ConnectionId, TransportEvent)>,

    notice_tx: mpsc::Sender<ChatNotice>,
    notice_rx: Option<mpsc::Receiver<ChatNotice>>,

    snapshot_tx: watch::Sender<Arc<ChatSnapshot>>,
}

impl ChatSession<WsConnector> {
    /// Session over real WebSocket connections.
    pub fn with_websocket(config: ChatConfig, user_id: impl Into<String>) -> Self {
        Self::new(config, user_id, WsConnector)
    }
}

impl<C: Connector> ChatSession<C> {
    pub fn new(config: ChatConfig, user_id: impl Into<String>, connector: C) -> Self {
        let user_id = user_id.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::channel(config.notice_capacity.max(1));
        let (snapshot_tx, _) = watch::channel(Arc::new(ChatSnapshot::default()));
        let dispatcher = Dispatcher::new(user_id.clone(), config.typing_timeout);

        Self {
            config,
            user_id,
            connector,
            dispatcher,
            connections: BTreeMap::new(),
            next_connection_id: 0,
            events_tx,
            events_rx,
            notice_tx,
            notice_rx: Some(notice_rx),
            snapshot_tx,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Take the notice receiver (can only be called once).
    pub fn take_notice_rx(&mut self) -> Option<mpsc::Receiver<ChatNotice>> {
        self.notice_rx.take()
    }

    /// Subscribe to state changes. The receiver always holds the latest
    /// snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ChatSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> Arc<ChatSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn store(&self) -> &ConversationStore {
        self.dispatcher.store()
    }

    pub fn presence(&self) -> &PresenceTracker {
        self.dispatcher.presence()
    }

    // ── Connections ─────────────────────────────────────────────

    /// Open a connection for `conversation_id`, replacing any existing one.
    ///
    /// The connection starts CONNECTING; [`ChatNotice::ConnectionOpened`]
    /// signals readiness.
    pub fn open(&mut self, conversation_id: &str) -> Result<ConnectionId, ChatError> {
        let id = ConnectionId(self.next_connection_id + 1);
        let connection = Connection::open(
            &self.config,
            id,
            &self.user_id,
            conversation_id,
            &mut self.connector,
            self.events_tx.clone(),
        )?;
        self.next_connection_id = id.0;

        if let Some(mut previous) = self
            .connections
            .insert(conversation_id.to_string(), connection)
        {
            log::debug!("{}: replaced by {id}", previous.id());
            previous.close();
        }
        self.publish();
        Ok(id)
    }

    /// Close and release the connection for `conversation_id`.
    ///
    /// Its typing deadlines are cancelled and any events it still reports are
    /// ignored. Returns `false` if there was no connection.
    pub fn close(&mut self, conversation_id: &str) -> bool {
        let Some(mut connection) = self.connections.remove(conversation_id) else {
            return false;
        };
        connection.close();
        self.dispatcher.end_conversation(conversation_id);
        self.publish();
        true
    }

    pub fn connection_state(&self, conversation_id: &str) -> Option<ConnectionState> {
        self.connections.get(conversation_id).map(Connection::state)
    }

    pub fn connection(&self, conversation_id: &str) -> Option<&Connection> {
        self.connections.get(conversation_id)
    }

    // ── Sending ─────────────────────────────────────────────────

    /// Send an envelope on the connection for its conversation.
    ///
    /// Envelopes without a conversation go out on the first OPEN connection.
    /// Fails with [`ChatError::NotConnected`] if there is no such connection
    /// or it is not OPEN.
    pub fn send(&mut self, envelope: &Envelope) -> Result<(), ChatError> {
        let connection = match envelope.conversation_id.as_deref() {
            Some(conversation_id) => self.connections.get_mut(conversation_id),
            None => self.connections.values_mut().find(|c| c.state().is_open()),
        };
        connection.ok_or(ChatError::NotConnected)?.send(envelope)
    }

    /// Send a text message. Returns the envelope that went out, so the
    /// caller knows the generated message id.
    pub fn send_text(
        &mut self,
        conversation_id: &str,
        content: impl Into<String>,
    ) -> Result<Envelope, ChatError> {
        let envelope = Envelope::text(self.user_id.clone(), conversation_id, content);
        self.send(&envelope)?;
        Ok(envelope)
    }

    pub fn send_typing(&mut self, conversation_id: &str, is_typing: bool) -> Result<(), ChatError> {
        let envelope = if is_typing {
            Envelope::typing(self.user_id.clone(), conversation_id, None)
        } else {
            Envelope::stop_typing(self.user_id.clone(), conversation_id)
        };
        self.send(&envelope)
    }

    /// Send one read receipt covering every unread message in the
    /// conversation, and apply it locally.
    ///
    /// Returns the number of messages marked.
    pub fn mark_conversation_read(&mut self, conversation_id: &str) -> Result<usize, ChatError> {
        let unread = self
            .dispatcher
            .store()
            .entry(conversation_id)
            .ok_or_else(|| ChatError::UnknownConversation(conversation_id.to_string()))?
            .unread_ids(&self.user_id);
        if unread.is_empty() {
            return Ok(0);
        }

        let count = unread.len();
        let envelope = Envelope::read_receipt(self.user_id.clone(), conversation_id, unread);
        self.send(&envelope)?;
        self.apply(envelope);
        Ok(count)
    }

    /// Issue a search. Returns the request id echoed by the matching
    /// [`ChatNotice::SearchResults`].
    pub fn search(&mut self, query: impl Into<String>) -> Result<String, ChatError> {
        let request_id = Uuid::new_v4().to_string();
        let envelope = Envelope::new(
            self.user_id.clone(),
            None,
            EnvelopeBody::Search(SearchPayload {
                request_id: Some(request_id.clone()),
                query: query.into(),
            }),
        );
        self.send(&envelope)?;
        Ok(request_id)
    }

    // ── Local state feeds ───────────────────────────────────────

    /// Seed the store from a history fetch. Replaces everything held.
    pub fn bootstrap(&mut self, snapshots: Vec<ConversationSnapshot>) {
        self.dispatcher.replace_all(snapshots);
        self.publish();
    }

    pub fn upsert_conversation(&mut self, conversation: Conversation) {
        self.dispatcher.upsert_conversation(conversation);
        self.publish();
    }

    // ── Driving ─────────────────────────────────────────────────

    /// Wait for the next transport event or typing deadline and handle it.
    pub async fn step(&mut self) {
        let deadline = self.dispatcher.next_typing_deadline();
        let wake = tokio::select! {
            event = self.events_rx.recv() => match event {
                Some((id, event)) => Wake::Event(id, event),
                None => Wake::Idle,
            },
            _ = wait_until(deadline) => Wake::TypingDeadline,
        };

        match wake {
            Wake::Event(id, event) => self.handle_event(id, event),
            Wake::TypingDeadline => self.expire_typing(),
            Wake::Idle => {}
        }
    }

    /// Handle every event already queued, then expire due typing
    /// indicators. Never waits. Returns the number of events handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok((id, event)) = self.events_rx.try_recv() {
            self.handle_event(id, event);
            handled += 1;
        }
        self.expire_typing();
        handled
    }

    /// Close every connection and discard all state.
    pub fn shutdown(&mut self) {
        let count = self.connections.len();
        for (_, mut connection) in std::mem::take(&mut self.connections) {
            connection.close();
        }
        self.dispatcher.reset();
        while self.events_rx.try_recv().is_ok() {}
        self.publish();
        log::info!("Chat session for {} shut down ({count} connection(s))", self.user_id);
    }

    fn handle_event(&mut self, id: ConnectionId, event: TransportEvent) {
        let Some(conversation_id) = self
            .connections
            .iter()
            .find(|(_, c)| c.id() == id)
            .map(|(conversation_id, _)| conversation_id.clone())
        else {
            log::trace!("{id}: ignoring event from released connection");
            return;
        };

        match event {
            TransportEvent::Frame(frame) => match protocol::decode(&frame) {
                Ok(envelope) => self.apply(envelope),
                Err(error) => {
                    log::warn!("{id}: dropping frame: {error}");
                    self.notify(ChatNotice::DecodeFailed {
                        conversation_id,
                        error,
                    });
                }
            },
            TransportEvent::Error(error) => {
                log::warn!("{id}: transport error: {error}");
                self.notify(ChatNotice::ConnectionError {
                    conversation_id,
                    error,
                });
            }
            lifecycle => {
                let Some(connection) = self.connections.get_mut(&conversation_id) else {
                    return;
                };
                let before = connection.state();
                let after = connection.apply(&lifecycle);
                if before == after {
                    return;
                }

                match lifecycle {
                    TransportEvent::Opened => {
                        log::info!("{id}: open");
                        self.notify(ChatNotice::ConnectionOpened { conversation_id });
                    }
                    TransportEvent::Closed { code, reason } => {
                        log::info!("{id}: closed by peer ({code} {reason})");
                        self.notify(ChatNotice::ConnectionClosed {
                            conversation_id,
                            code,
                            reason,
                            normal: code == CLOSE_NORMAL,
                        });
                    }
                    _ => {}
                }
                self.publish();
            }
        }
    }

    fn apply(&mut self, envelope: Envelope) {
        match self.dispatcher.dispatch(envelope, Instant::now()) {
            Effect::StoreChanged | Effect::PresenceChanged => self.publish(),
            Effect::Notice(notice) => self.notify(notice),
            Effect::Unchanged => {}
        }
    }

    fn expire_typing(&mut self) {
        if self.dispatcher.expire_typing(Instant::now()) {
            self.publish();
        }
    }

    fn notify(&self, notice: ChatNotice) {
        if let Err(mpsc::error::TrySendError::Full(notice)) = self.notice_tx.try_send(notice) {
            // An untaken receiver fills up silently.
            if self.notice_rx.is_none() {
                log::warn!("Notice buffer full, dropping {notice:?}");
            }
        }
    }

    fn publish(&self) {
        let snapshot = ChatSnapshot {
            store: self.dispatcher.store().snapshot(),
            presence: self.dispatcher.presence().snapshot(),
            connections: self
                .connections
                .iter()
                .map(|(conversation_id, c)| (conversation_id.clone(), c.state()))
                .collect(),
        };
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
