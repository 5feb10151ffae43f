//! # stylo-chat — Real-time chat transport for the stylist marketplace
//!
//! Keeps a local view of a user's conversations in sync with the chat server
//! over one WebSocket connection per open conversation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   send(envelope)   ┌─────────────┐    WebSocket    ┌────────┐
//! │ UI / caller │ ─────────────────► │ ChatSession │ ◄─────────────► │ server │
//! └──────▲──────┘                    └──────┬──────┘   JSON frames   └────────┘
//!        │ watch: ChatSnapshot              │ decode
//!        │ mpsc:  ChatNotice                ▼
//!        │                           ┌─────────────┐
//!        └───────────────────────────│ Dispatcher  │
//!                                    └──┬───────┬──┘
//!                                       ▼       ▼
//!                           ConversationStore  PresenceTracker
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Envelope model and JSON codec
//! - [`transport`] — Socket abstraction (WebSocket and in-memory)
//! - [`connection`] — Per-conversation connection state machine
//! - [`store`] — Conversations and message history
//! - [`presence`] — Online set and expiring typing indicators
//! - [`dispatcher`] — Applies decoded envelopes to store and tracker
//! - [`session`] — Provider-scoped owner of all of the above

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use config::ChatConfig;
pub use connection::{connection_uri, Connection, ConnectionState};
pub use dispatcher::{ChatNotice, Dispatcher, Effect};
pub use error::{ChatError, CodecError};
pub use presence::{PresenceSnapshot, PresenceTracker, TypingIndicator};
pub use protocol::{
    decode, encode, AlertLevel, ChatMessagePayload, Conversation, ConversationSnapshot,
    Envelope, EnvelopeBody, EnvelopeType, FileMeta, Message, MessageKind, ParticipantDetails,
    ParticipantRole, SearchPayload, SearchResultPayload, SystemAlertPayload,
};
pub use session::{ChatSession, ChatSnapshot};
pub use store::{AppendOutcome, ConversationEntry, ConversationStore, StoreSnapshot};
pub use transport::{
    ConnectionId, Connector, EventSink, MemoryConnector, MemoryLink, Transport, TransportEvent,
    WsConnector,
};
