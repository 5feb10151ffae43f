//! Connection manager: one live connection per (user, conversation) pair.
//!
//! ```text
//!            Opened            close()
//! CONNECTING ──────► OPEN ─────────────────► CLOSED
//!     │                │                        ▲
//!     └────────────────┴── Closed (transport) ──┘
//! ```
//!
//! The handle releases its transport exactly once: on the first `close()`,
//! when the transport reports closure, or on drop, whichever comes first.
//! `close()` is synchronous here. It queues the close frame and drops the
//! transport in one call, so a handle never reports `Closing`; the closing
//! handshake finishes inside the transport. `Closing` is kept for transports
//! that surface the handshake. Reconnection is left to the caller.

use std::fmt;

use tokio::sync::mpsc;
use url::Url;

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::protocol::{self, Envelope};
use crate::transport::{
    ConnectionId, Connector, EventSink, Transport, TransportEvent, CLOSE_NORMAL,
};

/// Path of the chat endpoint, relative to the base URL.
pub const CHAT_PATH: &str = "chat/ws";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// State after a transport event, or `None` if the event does not move
    /// the machine.
    pub fn on_event(self, event: &TransportEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        match (self, event) {
            (Connecting, TransportEvent::Opened) => Some(Open),
            (Connecting | Open | Closing, TransportEvent::Closed { .. }) => Some(Closed),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        *self == ConnectionState::Open
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Build the WebSocket URI for a chat connection.
///
/// `http` becomes `ws` and `https` becomes `wss`; `ws`/`wss` base URLs are
/// used as given. `/chat/ws` is appended to the base path and the user and
/// conversation ids go in the query string.
pub fn connection_uri(
    base_url: &str,
    user_id: &str,
    conversation_id: &str,
) -> Result<String, ChatError> {
    let mut url = Url::parse(base_url.trim())
        .map_err(|e| ChatError::Config(format!("invalid base URL {base_url:?}: {e}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ChatError::Config(format!(
                "unsupported base URL scheme '{other}'"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ChatError::Config(format!("cannot use scheme '{scheme}' for {base_url:?}")))?;

    let path = format!("{}/{CHAT_PATH}", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_fragment(None);
    url.query_pairs_mut()
        .clear()
        .append_pair("user_id", user_id)
        .append_pair("conversation_id", conversation_id);

    Ok(url.into())
}

/// Handle for one live chat connection.
pub struct Connection {
    id: ConnectionId,
    user_id: String,
    conversation_id: String,
    uri: String,
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
}

impl Connection {
    /// Start connecting `user_id` to `conversation_id`.
    ///
    /// Returns as soon as the attempt is started; the handle is usable once
    /// [`TransportEvent::Opened`] arrives on `events`. Fails with
    /// [`ChatError::Config`] before any connection attempt if the base URL is
    /// missing or unusable.
    pub fn open(
        config: &ChatConfig,
        id: ConnectionId,
        user_id: &str,
        conversation_id: &str,
        connector: &mut dyn Connector,
        events: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>,
    ) -> Result<Self, ChatError> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| ChatError::Config("base API URL is not configured".into()))?;
        let uri = connection_uri(base_url, user_id, conversation_id)?;

        log::info!("{id}: connecting to conversation {conversation_id}");
        let transport = connector.connect(&uri, EventSink::new(id, events));

        Ok(Self {
            id,
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            uri,
            state: ConnectionState::Connecting,
            transport: Some(transport),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Apply a transport event to the state machine and return the new state.
    pub fn apply(&mut self, event: &TransportEvent) -> ConnectionState {
        if let Some(next) = self.state.on_event(event) {
            log::debug!("{}: {} -> {}", self.id, self.state, next);
            self.state = next;
            if next == ConnectionState::Closed {
                // Closed by the remote end; nothing left to close.
                self.transport = None;
            }
        }
        self.state
    }

    /// Encode and transmit an envelope.
    ///
    /// Fails with [`ChatError::NotConnected`] unless the connection is OPEN;
    /// nothing is queued.
    pub fn send(&mut self, envelope: &Envelope) -> Result<(), ChatError> {
        if !self.state.is_open() {
            return Err(ChatError::NotConnected);
        }
        let transport = self.transport.as_mut().ok_or(ChatError::NotConnected)?;
        let frame = protocol::encode(envelope)?;
        log::trace!("{}: -> {}", self.id, envelope.kind());
        transport.send_text(frame)
    }

    /// Close the connection. Safe to call any number of times.
    pub fn close(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        if self.state != ConnectionState::Closed {
            transport.close(CLOSE_NORMAL, "client closed");
        }
        drop(transport);
        self.state = ConnectionState::Closed;
        log::info!("{}: closed conversation {}", self.id, self.conversation_id);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("conversation_id", &self.conversation_id)
            .field("state", &self.state)
            .finish()
    }
}
