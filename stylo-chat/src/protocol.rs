//! Chat wire protocol: data model and JSON codec.
//!
//! Every frame on the live connection is one JSON object:
//! ```text
//! {
//!   "type":            "text" | "file" | … | "all_conversations",
//!   "conversation_id": "c-42",          (absent for global envelopes)
//!   "sender_id":       "u-7",
//!   "payload":         { … },           (shape fixed by "type")
//!   "timestamp":       1718000000123    (seconds or milliseconds)
//! }
//! ```
//!
//! In memory the `type`/`payload` pair is the [`EnvelopeBody`] sum type, so a
//! payload can never disagree with its tag. [`decode`] rejects frames whose
//! payload does not have the shape its tag requires instead of coercing them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::CodecError;

// ───────────────────────────────────────────────────────────────────
// Envelope types
// ───────────────────────────────────────────────────────────────────

/// The fixed set of envelope tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Text,
    File,
    Audio,
    Video,
    Order,
    Typing,
    StopTyping,
    ReadReceipt,
    UserOnline,
    UserOffline,
    SystemAlert,
    Search,
    SearchResult,
    AllConversations,
}

impl EnvelopeType {
    pub const ALL: [EnvelopeType; 14] = [
        EnvelopeType::Text,
        EnvelopeType::File,
        EnvelopeType::Audio,
        EnvelopeType::Video,
        EnvelopeType::Order,
        EnvelopeType::Typing,
        EnvelopeType::StopTyping,
        EnvelopeType::ReadReceipt,
        EnvelopeType::UserOnline,
        EnvelopeType::UserOffline,
        EnvelopeType::SystemAlert,
        EnvelopeType::Search,
        EnvelopeType::SearchResult,
        EnvelopeType::AllConversations,
    ];

    /// Wire tag for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::File => "file",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Order => "order",
            Self::Typing => "typing",
            Self::StopTyping => "stop_typing",
            Self::ReadReceipt => "read_receipt",
            Self::UserOnline => "user_online",
            Self::UserOffline => "user_offline",
            Self::SystemAlert => "system_alert",
            Self::Search => "search",
            Self::SearchResult => "search_result",
            Self::AllConversations => "all_conversations",
        }
    }

    /// Parse a wire tag. Returns `None` for anything outside the enumeration.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }

    /// Whether envelopes of this type must name a conversation.
    ///
    /// Presence, search, and the full snapshot sync are global.
    pub fn requires_conversation(&self) -> bool {
        !matches!(
            self,
            Self::UserOnline
                | Self::UserOffline
                | Self::Search
                | Self::SearchResult
                | Self::AllConversations
        )
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a stored chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    File,
    Audio,
    Video,
    Order,
}

impl MessageKind {
    pub fn envelope_type(&self) -> EnvelopeType {
        match self {
            Self::Text => EnvelopeType::Text,
            Self::File => EnvelopeType::File,
            Self::Audio => EnvelopeType::Audio,
            Self::Video => EnvelopeType::Video,
            Self::Order => EnvelopeType::Order,
        }
    }

    /// File, audio, and video messages carry an attachment.
    pub fn has_attachment(&self) -> bool {
        matches!(self, Self::File | Self::Audio | Self::Video)
    }
}

// ───────────────────────────────────────────────────────────────────
// Domain model
// ───────────────────────────────────────────────────────────────────

/// Attachment metadata for file/audio/video messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl FileMeta {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            size: None,
            mime_type: None,
        }
    }
}

/// A chat message held by the conversation store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub created_at: i64,
    /// Users who have read this message. Grows only.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub read_by: BTreeSet<String>,
}

impl Message {
    /// Build the stored form of an inbound chat envelope.
    pub fn from_payload(
        kind: MessageKind,
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        payload: &ChatMessagePayload,
    ) -> Self {
        Self {
            id: payload.id.clone(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            content: payload.content.clone(),
            message_type: kind,
            file: payload.file.clone(),
            order_id: payload.order_id.clone(),
            created_at: payload.created_at,
            read_by: BTreeSet::new(),
        }
    }

    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.contains(user_id)
    }

    /// Record a read. Returns `false` if the user had already read it.
    pub fn mark_read_by(&mut self, user_id: &str) -> bool {
        if self.read_by.contains(user_id) {
            return false;
        }
        self.read_by.insert(user_id.to_string())
    }

    /// `created_at` normalised to milliseconds.
    pub fn created_at_millis(&self) -> i64 {
        epoch_millis(self.created_at)
    }
}

/// Which side of the marketplace a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Customer,
    Stylist,
}

/// Display metadata for one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantDetails {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ParticipantRole>,
}

/// A conversation thread between two or more participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Ordered, duplicate-free.
    pub participant_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub participant_details: BTreeMap<String, ParticipantDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    pub fn new<I, S>(id: impl Into<String>, participants: I, created_at: i64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut conversation = Self {
            id: id.into(),
            participant_ids: participants.into_iter().map(Into::into).collect(),
            participant_details: BTreeMap::new(),
            last_message: None,
            created_at,
            updated_at: created_at,
        };
        conversation.dedup_participants();
        conversation
    }

    pub fn with_participant(
        mut self,
        user_id: impl Into<String>,
        details: ParticipantDetails,
    ) -> Self {
        let user_id = user_id.into();
        if !self.participant_ids.contains(&user_id) {
            self.participant_ids.push(user_id.clone());
        }
        self.participant_details.insert(user_id, details);
        self
    }

    /// Drop repeated participant ids, keeping first occurrences in order.
    pub fn dedup_participants(&mut self) {
        let mut seen = BTreeSet::new();
        self.participant_ids.retain(|id| seen.insert(id.clone()));
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_ids.iter().any(|id| id == user_id)
    }

    /// Latest activity in milliseconds: the last message, else `updated_at`.
    pub fn last_activity_millis(&self) -> i64 {
        let updated = epoch_millis(self.updated_at);
        match &self.last_message {
            Some(message) => message.created_at_millis().max(updated),
            None => updated,
        }
    }
}

/// A conversation together with the messages held for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    #[serde(flatten)]
    pub conversation: Conversation,
    #[serde(default)]
    pub messages: Vec<Message>,
}

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

/// Payload of text/file/audio/video/order envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub created_at: i64,
}

/// Payload of typing/stop_typing envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceiptPayload {
    pub message_ids: Vec<String>,
}

/// Payload of user_online/user_offline envelopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAlertPayload {
    pub text: String,
    pub level: AlertLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPayload {
    /// Echoed back in the matching `search_result`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResultPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub query: String,
    #[serde(default)]
    pub results: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllConversationsPayload {
    pub conversations: Vec<ConversationSnapshot>,
}

/// Tagged union of envelope payloads, keyed by envelope type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeBody {
    Text(ChatMessagePayload),
    File(ChatMessagePayload),
    Audio(ChatMessagePayload),
    Video(ChatMessagePayload),
    Order(ChatMessagePayload),
    Typing(TypingPayload),
    StopTyping(TypingPayload),
    ReadReceipt(ReadReceiptPayload),
    UserOnline(PresencePayload),
    UserOffline(PresencePayload),
    SystemAlert(SystemAlertPayload),
    Search(SearchPayload),
    SearchResult(SearchResultPayload),
    AllConversations(AllConversationsPayload),
}

impl EnvelopeBody {
    pub fn kind(&self) -> EnvelopeType {
        match self {
            Self::Text(_) => EnvelopeType::Text,
            Self::File(_) => EnvelopeType::File,
            Self::Audio(_) => EnvelopeType::Audio,
            Self::Video(_) => EnvelopeType::Video,
            Self::Order(_) => EnvelopeType::Order,
            Self::Typing(_) => EnvelopeType::Typing,
            Self::StopTyping(_) => EnvelopeType::StopTyping,
            Self::ReadReceipt(_) => EnvelopeType::ReadReceipt,
            Self::UserOnline(_) => EnvelopeType::UserOnline,
            Self::UserOffline(_) => EnvelopeType::UserOffline,
            Self::SystemAlert(_) => EnvelopeType::SystemAlert,
            Self::Search(_) => EnvelopeType::Search,
            Self::SearchResult(_) => EnvelopeType::SearchResult,
            Self::AllConversations(_) => EnvelopeType::AllConversations,
        }
    }

    /// Wrap a chat payload in the variant for `kind`.
    pub fn chat(kind: MessageKind, payload: ChatMessagePayload) -> Self {
        match kind {
            MessageKind::Text => Self::Text(payload),
            MessageKind::File => Self::File(payload),
            MessageKind::Audio => Self::Audio(payload),
            MessageKind::Video => Self::Video(payload),
            MessageKind::Order => Self::Order(payload),
        }
    }

    fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Text(p) | Self::File(p) | Self::Audio(p) | Self::Video(p) | Self::Order(p) => {
                serde_json::to_value(p)
            }
            Self::Typing(p) | Self::StopTyping(p) => serde_json::to_value(p),
            Self::ReadReceipt(p) => serde_json::to_value(p),
            Self::UserOnline(p) | Self::UserOffline(p) => serde_json::to_value(p),
            Self::SystemAlert(p) => serde_json::to_value(p),
            Self::Search(p) => serde_json::to_value(p),
            Self::SearchResult(p) => serde_json::to_value(p),
            Self::AllConversations(p) => serde_json::to_value(p),
        }
    }

    fn from_payload(kind: EnvelopeType, payload: Value) -> Result<Self, serde_json::Error> {
        fn parse<T: DeserializeOwned>(payload: Value) -> Result<T, serde_json::Error> {
            serde_json::from_value(payload)
        }

        Ok(match kind {
            EnvelopeType::Text => Self::Text(parse(payload)?),
            EnvelopeType::File => Self::File(parse(payload)?),
            EnvelopeType::Audio => Self::Audio(parse(payload)?),
            EnvelopeType::Video => Self::Video(parse(payload)?),
            EnvelopeType::Order => Self::Order(parse(payload)?),
            EnvelopeType::Typing => Self::Typing(parse(payload)?),
            EnvelopeType::StopTyping => Self::StopTyping(parse(payload)?),
            EnvelopeType::ReadReceipt => Self::ReadReceipt(parse(payload)?),
            EnvelopeType::UserOnline => Self::UserOnline(parse(payload)?),
            EnvelopeType::UserOffline => Self::UserOffline(parse(payload)?),
            EnvelopeType::SystemAlert => Self::SystemAlert(parse(payload)?),
            EnvelopeType::Search => Self::Search(parse(payload)?),
            EnvelopeType::SearchResult => Self::SearchResult(parse(payload)?),
            EnvelopeType::AllConversations => Self::AllConversations(parse(payload)?),
        })
    }

    /// Shape rules serde alone cannot express.
    fn validate(&self) -> Result<(), String> {
        match self {
            Self::Text(p) => {
                require_id(p)?;
                if p.content.is_none() {
                    return Err("text message has no content".into());
                }
            }
            Self::File(p) | Self::Audio(p) | Self::Video(p) => {
                require_id(p)?;
                match &p.file {
                    Some(file) if !file.url.is_empty() => {}
                    Some(_) => return Err("attachment url is empty".into()),
                    None => return Err("attachment metadata is missing".into()),
                }
            }
            Self::Order(p) => {
                require_id(p)?;
                if p.order_id.as_deref().map_or(true, str::is_empty) {
                    return Err("order message has no order_id".into());
                }
            }
            Self::ReadReceipt(p) if p.message_ids.is_empty() => {
                return Err("message_ids is empty".into());
            }
            Self::Search(p) if p.query.trim().is_empty() => {
                return Err("search query is empty".into());
            }
            _ => {}
        }
        Ok(())
    }
}

fn require_id(payload: &ChatMessagePayload) -> Result<(), String> {
    if payload.id.is_empty() {
        return Err("message id is empty".into());
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────────
// Envelope
// ───────────────────────────────────────────────────────────────────

/// One discrete unit exchanged over the live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub conversation_id: Option<String>,
    pub sender_id: String,
    /// Seconds or milliseconds since the epoch, set by the sender.
    pub timestamp: i64,
    pub body: EnvelopeBody,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    pub fn new(
        sender_id: impl Into<String>,
        conversation_id: Option<String>,
        body: EnvelopeBody,
    ) -> Self {
        Self {
            conversation_id,
            sender_id: sender_id.into(),
            timestamp: now_millis(),
            body,
        }
    }

    /// Create a chat message envelope with a fresh message id.
    pub fn chat(
        sender_id: impl Into<String>,
        conversation_id: impl Into<String>,
        kind: MessageKind,
        content: Option<String>,
        file: Option<FileMeta>,
        order_id: Option<String>,
    ) -> Self {
        let payload = ChatMessagePayload {
            id: Uuid::new_v4().to_string(),
            content,
            file,
            order_id,
            created_at: now_millis(),
        };
        Self::new(
            sender_id,
            Some(conversation_id.into()),
            EnvelopeBody::chat(kind, payload),
        )
    }

    pub fn text(
        sender_id: impl Into<String>,
        conversation_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::chat(
            sender_id,
            conversation_id,
            MessageKind::Text,
            Some(content.into()),
            None,
            None,
        )
    }

    /// File, audio, or video message. Other kinds are sent as plain files.
    pub fn attachment(
        sender_id: impl Into<String>,
        conversation_id: impl Into<String>,
        kind: MessageKind,
        file: FileMeta,
    ) -> Self {
        let kind = if kind.has_attachment() { kind } else { MessageKind::File };
        Self::chat(sender_id, conversation_id, kind, None, Some(file), None)
    }

    pub fn order(
        sender_id: impl Into<String>,
        conversation_id: impl Into<String>,
        order_id: impl Into<String>,
        content: Option<String>,
    ) -> Self {
        Self::chat(
            sender_id,
            conversation_id,
            MessageKind::Order,
            content,
            None,
            Some(order_id.into()),
        )
    }

    pub fn typing(
        sender_id: impl Into<String>,
        conversation_id: impl Into<String>,
        user_name: Option<String>,
    ) -> Self {
        Self::new(
            sender_id,
            Some(conversation_id.into()),
            EnvelopeBody::Typing(TypingPayload {
                user_name,
                is_typing: true,
            }),
        )
    }

    pub fn stop_typing(sender_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self::new(
            sender_id,
            Some(conversation_id.into()),
            EnvelopeBody::StopTyping(TypingPayload {
                user_name: None,
                is_typing: false,
            }),
        )
    }

    pub fn read_receipt(
        sender_id: impl Into<String>,
        conversation_id: impl Into<String>,
        message_ids: Vec<String>,
    ) -> Self {
        Self::new(
            sender_id,
            Some(conversation_id.into()),
            EnvelopeBody::ReadReceipt(ReadReceiptPayload { message_ids }),
        )
    }

    pub fn user_online(sender_id: impl Into<String>) -> Self {
        Self::new(sender_id, None, EnvelopeBody::UserOnline(PresencePayload::default()))
    }

    pub fn user_offline(sender_id: impl Into<String>, last_seen: Option<i64>) -> Self {
        Self::new(
            sender_id,
            None,
            EnvelopeBody::UserOffline(PresencePayload { last_seen }),
        )
    }

    pub fn system_alert(
        sender_id: impl Into<String>,
        conversation_id: impl Into<String>,
        text: impl Into<String>,
        level: AlertLevel,
    ) -> Self {
        Self::new(
            sender_id,
            Some(conversation_id.into()),
            EnvelopeBody::SystemAlert(SystemAlertPayload {
                text: text.into(),
                level,
            }),
        )
    }

    /// Search request with a fresh correlation id.
    pub fn search(sender_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self::new(
            sender_id,
            None,
            EnvelopeBody::Search(SearchPayload {
                request_id: Some(Uuid::new_v4().to_string()),
                query: query.into(),
            }),
        )
    }

    pub fn all_conversations(
        sender_id: impl Into<String>,
        conversations: Vec<ConversationSnapshot>,
    ) -> Self {
        Self::new(
            sender_id,
            None,
            EnvelopeBody::AllConversations(AllConversationsPayload { conversations }),
        )
    }

    /// Override the sender timestamp.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn kind(&self) -> EnvelopeType {
        self.body.kind()
    }
}

// ───────────────────────────────────────────────────────────────────
// Codec
// ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct OutboundFrame<'a> {
    #[serde(rename = "type")]
    kind: EnvelopeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    sender_id: &'a str,
    payload: Value,
    timestamp: i64,
}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(default)]
    conversation_id: Option<String>,
    sender_id: String,
    #[serde(default)]
    payload: Value,
    timestamp: i64,
}

fn missing_conversation(kind: EnvelopeType, conversation_id: Option<&str>) -> bool {
    kind.requires_conversation() && conversation_id.map_or(true, str::is_empty)
}

/// Serialize an envelope into a text frame.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    let kind = envelope.kind();
    if missing_conversation(kind, envelope.conversation_id.as_deref()) {
        return Err(CodecError::Encode(format!(
            "'{kind}' envelope has no conversation_id"
        )));
    }
    envelope
        .body
        .validate()
        .map_err(|reason| CodecError::Encode(format!("'{kind}' payload: {reason}")))?;

    let payload = envelope
        .body
        .to_payload()
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    let frame = OutboundFrame {
        kind,
        conversation_id: envelope.conversation_id.as_deref(),
        sender_id: &envelope.sender_id,
        payload,
        timestamp: envelope.timestamp,
    };
    serde_json::to_string(&frame).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Parse and validate a text frame.
pub fn decode(frame: &str) -> Result<Envelope, CodecError> {
    let value: Value =
        serde_json::from_str(frame).map_err(|e| CodecError::MalformedFrame(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(CodecError::MalformedFrame("frame is not a JSON object".into()));
    };

    let kind = match fields.remove("type") {
        Some(Value::String(tag)) => {
            EnvelopeType::parse(&tag).ok_or(CodecError::UnknownType(Some(tag)))?
        }
        Some(Value::Null) | None => return Err(CodecError::UnknownType(None)),
        Some(other) => return Err(CodecError::UnknownType(Some(other.to_string()))),
    };
    let invalid = |reason: String| CodecError::InvalidPayload { kind, reason };

    let header: InboundFrame =
        serde_json::from_value(Value::Object(fields)).map_err(|e| invalid(e.to_string()))?;
    if missing_conversation(kind, header.conversation_id.as_deref()) {
        return Err(invalid("missing conversation_id".into()));
    }

    let payload = match header.payload {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    let body = EnvelopeBody::from_payload(kind, payload).map_err(|e| invalid(e.to_string()))?;
    body.validate().map_err(invalid)?;

    Ok(Envelope {
        conversation_id: header.conversation_id,
        sender_id: header.sender_id,
        timestamp: header.timestamp,
        body,
    })
}

// ───────────────────────────────────────────────────────────────────
// Time helpers
// ───────────────────────────────────────────────────────────────────

/// Values below this are taken to be seconds rather than milliseconds.
const SECONDS_CUTOFF: i64 = 100_000_000_000;

/// Normalise an epoch timestamp in seconds or milliseconds to milliseconds.
pub fn epoch_millis(timestamp: i64) -> i64 {
    if timestamp.abs() < SECONDS_CUTOFF {
        timestamp.saturating_mul(1000)
    } else {
        timestamp
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
