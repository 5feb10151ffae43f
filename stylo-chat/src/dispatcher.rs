//! Protocol dispatcher: applies decoded envelopes to the store and tracker.
//!
//! | type                              | effect                                   |
//! |-----------------------------------|------------------------------------------|
//! | text / file / audio / video / order | append message, update `last_message` |
//! | typing / stop_typing              | set / clear typing indicator             |
//! | read_receipt                      | union sender into `read_by`              |
//! | user_online / user_offline        | update online set                        |
//! | system_alert                      | one-shot notice, not stored              |
//! | search / search_result            | forwarded as notices, not stored         |
//! | all_conversations                 | replace the whole store                  |
//!
//! Envelopes are applied strictly in the order they are handed in.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::CodecError;
use crate::presence::PresenceTracker;
use crate::protocol::{
    ChatMessagePayload, Conversation, ConversationSnapshot, Envelope, EnvelopeBody, Message,
    MessageKind, SearchPayload, SearchResultPayload, SystemAlertPayload,
};
use crate::store::{AppendOutcome, ConversationStore};

/// Notifications for the caller that are not store state.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatNotice {
    /// A connection reached OPEN.
    ConnectionOpened { conversation_id: String },
    /// The transport reported an error. The connection may still be open.
    ConnectionError {
        conversation_id: String,
        error: String,
    },
    /// A connection closed. `normal` is false for any code other than 1000.
    ConnectionClosed {
        conversation_id: String,
        code: u16,
        reason: String,
        normal: bool,
    },
    /// A frame was dropped because it failed to decode.
    DecodeFailed {
        conversation_id: String,
        error: CodecError,
    },
    SystemAlert {
        conversation_id: String,
        alert: SystemAlertPayload,
    },
    /// Another user issued a search on this channel.
    SearchRequested {
        sender_id: String,
        request: SearchPayload,
    },
    SearchResults(SearchResultPayload),
}

/// What applying one envelope changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StoreChanged,
    PresenceChanged,
    Notice(ChatNotice),
    Unchanged,
}

/// Routes envelopes to the store and tracker it owns.
#[derive(Debug)]
pub struct Dispatcher {
    store: ConversationStore,
    presence: PresenceTracker,
}

impl Dispatcher {
    pub fn new(local_user_id: impl Into<String>, typing_timeout: Duration) -> Self {
        Self::with_parts(
            ConversationStore::new(),
            PresenceTracker::new(local_user_id, typing_timeout),
        )
    }

    pub fn with_parts(store: ConversationStore, presence: PresenceTracker) -> Self {
        Self { store, presence }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Apply one envelope.
    pub fn dispatch(&mut self, envelope: Envelope, now: Instant) -> Effect {
        let Envelope {
            conversation_id,
            sender_id,
            timestamp: _,
            body,
        } = envelope;
        log::trace!("dispatch {} from {sender_id}", body.kind());

        match body {
            EnvelopeBody::Text(p) => self.append(MessageKind::Text, conversation_id, sender_id, p),
            EnvelopeBody::File(p) => self.append(MessageKind::File, conversation_id, sender_id, p),
            EnvelopeBody::Audio(p) => self.append(MessageKind::Audio, conversation_id, sender_id, p),
            EnvelopeBody::Video(p) => self.append(MessageKind::Video, conversation_id, sender_id, p),
            EnvelopeBody::Order(p) => self.append(MessageKind::Order, conversation_id, sender_id, p),

            // `is_typing` decides for `typing`; `stop_typing` always stops.
            EnvelopeBody::Typing(p) if p.is_typing => {
                let Some(conversation_id) = conversation_id else {
                    return Effect::Unchanged;
                };
                changed_presence(self.presence.start_typing(
                    &conversation_id,
                    &sender_id,
                    p.user_name,
                    now,
                ))
            }
            EnvelopeBody::Typing(_) | EnvelopeBody::StopTyping(_) => {
                let Some(conversation_id) = conversation_id else {
                    return Effect::Unchanged;
                };
                changed_presence(self.presence.stop_typing(&conversation_id, &sender_id))
            }

            EnvelopeBody::ReadReceipt(p) => {
                let Some(conversation_id) = conversation_id else {
                    return Effect::Unchanged;
                };
                let changed = self
                    .store
                    .mark_read(&conversation_id, &p.message_ids, &sender_id);
                if changed > 0 {
                    Effect::StoreChanged
                } else {
                    Effect::Unchanged
                }
            }

            EnvelopeBody::UserOnline(_) => changed_presence(self.presence.set_online(&sender_id, true)),
            EnvelopeBody::UserOffline(_) => {
                changed_presence(self.presence.set_online(&sender_id, false))
            }

            EnvelopeBody::SystemAlert(alert) => {
                let Some(conversation_id) = conversation_id else {
                    return Effect::Unchanged;
                };
                Effect::Notice(ChatNotice::SystemAlert {
                    conversation_id,
                    alert,
                })
            }
            EnvelopeBody::Search(request) => Effect::Notice(ChatNotice::SearchRequested {
                sender_id,
                request,
            }),
            EnvelopeBody::SearchResult(results) => Effect::Notice(ChatNotice::SearchResults(results)),

            EnvelopeBody::AllConversations(p) => {
                self.replace_all(p.conversations);
                Effect::StoreChanged
            }
        }
    }

    fn append(
        &mut self,
        kind: MessageKind,
        conversation_id: Option<String>,
        sender_id: String,
        payload: ChatMessagePayload,
    ) -> Effect {
        let Some(conversation_id) = conversation_id else {
            return Effect::Unchanged;
        };
        let message = Message::from_payload(kind, conversation_id, sender_id, &payload);
        match self.store.append_message(message) {
            AppendOutcome::Appended => Effect::StoreChanged,
            AppendOutcome::Duplicate => Effect::Unchanged,
            AppendOutcome::UnknownConversation => {
                log::debug!(
                    "Dropping {} message {}: conversation not in store",
                    kind.envelope_type(),
                    payload.id
                );
                Effect::Unchanged
            }
        }
    }

    /// Snapshot sync: replace every conversation with `snapshots`.
    pub fn replace_all(&mut self, snapshots: Vec<ConversationSnapshot>) {
        log::info!("Snapshot sync: {} conversation(s)", snapshots.len());
        self.store.replace_all(snapshots);
    }

    /// Insert or update conversation metadata fetched out-of-band.
    pub fn upsert_conversation(&mut self, conversation: Conversation) {
        self.store.upsert_conversation(conversation);
    }

    /// Expire stale typing indicators. Returns `true` if any were removed.
    pub fn expire_typing(&mut self, now: Instant) -> bool {
        !self.presence.expire(now).is_empty()
    }

    pub fn next_typing_deadline(&self) -> Option<Instant> {
        self.presence.next_expiry()
    }

    /// A conversation's screen went away: cancel its typing deadlines.
    pub fn end_conversation(&mut self, conversation_id: &str) -> bool {
        self.presence.clear_conversation(conversation_id)
    }

    /// Drop all store and presence state.
    pub fn reset(&mut self) {
        self.store.clear();
        self.presence.clear();
    }
}

fn changed_presence(changed: bool) -> Effect {
    if changed {
        Effect::PresenceChanged
    } else {
        Effect::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        AlertLevel, ChatMessagePayload, FileMeta, ReadReceiptPayload, TypingPayload,
    };

    const ME: &str = "u-customer";
    const STYLIST: &str = "u-stylist";

    fn dispatcher() -> Dispatcher {
        let mut dispatcher = Dispatcher::new(ME, Duration::from_secs(3));
        dispatcher.upsert_conversation(Conversation::new("c1", [ME, STYLIST], 1_000));
        dispatcher
    }

    fn text(id: &str, conversation: &str, sender: &str, created_at: i64) -> Envelope {
        Envelope {
            conversation_id: Some(conversation.into()),
            sender_id: sender.into(),
            timestamp: created_at,
            body: EnvelopeBody::Text(ChatMessagePayload {
                id: id.into(),
                content: Some("hi".into()),
                file: None,
                order_id: None,
                created_at,
            }),
        }
    }

    fn receipt(conversation: &str, reader: &str, ids: &[&str]) -> Envelope {
        Envelope {
            conversation_id: Some(conversation.into()),
            sender_id: reader.into(),
            timestamp: 2_000,
            body: EnvelopeBody::ReadReceipt(ReadReceiptPayload {
                message_ids: ids.iter().map(|s| s.to_string()).collect(),
            }),
        }
    }

    fn last_message_id(dispatcher: &Dispatcher, conversation: &str) -> Option<String> {
        dispatcher
            .store()
            .entry(conversation)
            .and_then(|e| e.conversation.last_message.as_ref())
            .map(|m| m.id.clone())
    }

    #[test]
    fn test_text_updates_last_message() {
        let mut d = dispatcher();
        let now = Instant::now();
        assert_eq!(d.dispatch(text("msg1", "c1", STYLIST, 1_100), now), Effect::StoreChanged);
        assert_eq!(last_message_id(&d, "c1").as_deref(), Some("msg1"));

        assert_eq!(d.dispatch(text("msg2", "c1", ME, 1_200), now), Effect::StoreChanged);
        assert_eq!(last_message_id(&d, "c1").as_deref(), Some("msg2"));
    }

    #[test]
    fn test_attachment_kinds_are_stored() {
        let mut d = dispatcher();
        let payload = ChatMessagePayload {
            id: "v1".into(),
            content: None,
            file: Some(FileMeta::new("https://cdn.example.com/fit.mp4")),
            order_id: None,
            created_at: 1_300,
        };
        let envelope = Envelope {
            conversation_id: Some("c1".into()),
            sender_id: STYLIST.into(),
            timestamp: 1_300,
            body: EnvelopeBody::Video(payload),
        };
        d.dispatch(envelope, Instant::now());

        let entry = d.store().entry("c1").unwrap();
        assert_eq!(entry.messages[0].message_type, MessageKind::Video);
        assert!(entry.messages[0].content.is_none());
    }

    #[test]
    fn test_message_for_unknown_conversation_is_noop() {
        let mut d = dispatcher();
        let version = d.store().version();
        assert_eq!(
            d.dispatch(text("m", "elsewhere", STYLIST, 1_100), Instant::now()),
            Effect::Unchanged
        );
        assert!(!d.store().contains("elsewhere"));
        assert_eq!(d.store().version(), version);
    }

    #[test]
    fn test_read_receipt_idempotent() {
        let mut d = dispatcher();
        let now = Instant::now();
        d.dispatch(text("m1", "c1", ME, 1_100), now);

        assert_eq!(d.dispatch(receipt("c1", STYLIST, &["m1"]), now), Effect::StoreChanged);
        let first = d.store().entry("c1").unwrap().messages[0].read_by.clone();

        assert_eq!(d.dispatch(receipt("c1", STYLIST, &["m1"]), now), Effect::Unchanged);
        let second = d.store().entry("c1").unwrap().messages[0].read_by.clone();
        assert_eq!(first, second);
        assert!(second.contains(STYLIST));
    }

    #[test]
    fn test_typing_and_stop_typing() {
        let mut d = dispatcher();
        let now = Instant::now();
        let typing = Envelope {
            conversation_id: Some("c1".into()),
            sender_id: STYLIST.into(),
            timestamp: 1,
            body: EnvelopeBody::Typing(TypingPayload {
                user_name: Some("Mira".into()),
                is_typing: true,
            }),
        };
        assert_eq!(d.dispatch(typing, now), Effect::PresenceChanged);
        assert!(d.presence().is_typing("c1", STYLIST));

        let stop = Envelope::stop_typing(STYLIST, "c1");
        assert_eq!(d.dispatch(stop, now), Effect::PresenceChanged);
        assert!(!d.presence().is_typing("c1", STYLIST));
    }

    #[test]
    fn test_typing_flag_false_stops_typing() {
        let mut d = dispatcher();
        let now = Instant::now();
        d.dispatch(Envelope::typing(STYLIST, "c1", None), now);
        assert!(d.presence().is_typing("c1", STYLIST));

        let mut idle = Envelope::typing(STYLIST, "c1", None);
        idle.body = EnvelopeBody::Typing(TypingPayload {
            user_name: None,
            is_typing: false,
        });
        assert_eq!(d.dispatch(idle, now), Effect::PresenceChanged);
        assert!(!d.presence().is_typing("c1", STYLIST));
        assert_eq!(d.next_typing_deadline(), None);
    }

    #[test]
    fn test_stop_typing_stops_whatever_the_flag() {
        let mut d = dispatcher();
        let now = Instant::now();
        d.dispatch(Envelope::typing(STYLIST, "c1", None), now);

        let mut stop = Envelope::stop_typing(STYLIST, "c1");
        stop.body = EnvelopeBody::StopTyping(TypingPayload {
            user_name: None,
            is_typing: true,
        });
        assert_eq!(d.dispatch(stop, now), Effect::PresenceChanged);
        assert!(!d.presence().is_typing("c1", STYLIST));
    }

    #[test]
    fn test_system_alert_without_conversation_is_dropped() {
        let mut d = dispatcher();
        let mut alert = Envelope::system_alert("server", "c1", "Maintenance", AlertLevel::Warning);
        alert.conversation_id = None;
        assert_eq!(d.dispatch(alert, Instant::now()), Effect::Unchanged);
    }

    #[test]
    fn test_typing_expires() {
        let mut d = dispatcher();
        let now = Instant::now();
        d.dispatch(Envelope::typing(STYLIST, "c1", None), now);
        assert_eq!(d.next_typing_deadline(), Some(now + Duration::from_secs(3)));

        assert!(!d.expire_typing(now + Duration::from_secs(1)));
        assert!(d.expire_typing(now + Duration::from_secs(3)));
        assert!(!d.presence().is_typing("c1", STYLIST));
    }

    #[test]
    fn test_presence_online_offline() {
        let mut d = dispatcher();
        let now = Instant::now();
        assert_eq!(d.dispatch(Envelope::user_online(STYLIST), now), Effect::PresenceChanged);
        assert!(d.presence().is_online(STYLIST));
        assert_eq!(d.dispatch(Envelope::user_online(STYLIST), now), Effect::Unchanged);
        assert_eq!(
            d.dispatch(Envelope::user_offline(STYLIST, None), now),
            Effect::PresenceChanged
        );
        assert!(!d.presence().is_online(STYLIST));
    }

    #[test]
    fn test_system_alert_is_notice_only() {
        let mut d = dispatcher();
        let version = d.store().version();
        let alert = Envelope::system_alert("server", "c1", "Order shipped", AlertLevel::Info);
        match d.dispatch(alert, Instant::now()) {
            Effect::Notice(ChatNotice::SystemAlert {
                conversation_id,
                alert,
            }) => {
                assert_eq!(conversation_id, "c1");
                assert_eq!(alert.text, "Order shipped");
            }
            other => panic!("expected alert notice, got {other:?}"),
        }
        assert_eq!(d.store().version(), version);
    }

    #[test]
    fn test_search_envelopes_are_forwarded() {
        let mut d = dispatcher();
        let now = Instant::now();
        let request = Envelope::search(STYLIST, "linen");
        assert!(matches!(
            d.dispatch(request, now),
            Effect::Notice(ChatNotice::SearchRequested { .. })
        ));

        let result = Envelope::new(
            "server",
            None,
            EnvelopeBody::SearchResult(SearchResultPayload {
                request_id: Some("r-1".into()),
                query: "linen".into(),
                results: Vec::new(),
            }),
        );
        match d.dispatch(result, now) {
            Effect::Notice(ChatNotice::SearchResults(payload)) => {
                assert_eq!(payload.request_id.as_deref(), Some("r-1"));
            }
            other => panic!("expected search results, got {other:?}"),
        }
        assert_eq!(d.store().len(), 1);
    }

    #[test]
    fn test_all_conversations_replaces_store() {
        let mut d = dispatcher();
        let now = Instant::now();
        for (i, id) in ["a1", "a2", "a3"].into_iter().enumerate() {
            d.dispatch(text(id, "c1", STYLIST, 1_100 + i as i64), now);
        }
        assert_eq!(d.store().entry("c1").unwrap().messages.len(), 3);

        let b = Conversation::new("B", [ME, "u-other"], 1_000);
        let b_messages = vec![Message::from_payload(
            MessageKind::Text,
            "B",
            "u-other",
            &ChatMessagePayload {
                id: "b1".into(),
                content: Some("hello".into()),
                file: None,
                order_id: None,
                created_at: 1_500,
            },
        )];
        let sync = Envelope::all_conversations(
            "server",
            vec![ConversationSnapshot {
                conversation: b,
                messages: b_messages,
            }],
        );
        assert_eq!(d.dispatch(sync, now), Effect::StoreChanged);

        assert!(!d.store().contains("c1"));
        assert!(d.store().contains("B"));
        assert_eq!(d.store().entry("B").unwrap().messages.len(), 1);
    }

    #[test]
    fn test_end_conversation_and_reset() {
        let mut d = dispatcher();
        let now = Instant::now();
        d.dispatch(Envelope::typing(STYLIST, "c1", None), now);
        d.dispatch(Envelope::user_online(STYLIST), now);

        assert!(d.end_conversation("c1"));
        assert_eq!(d.next_typing_deadline(), None);

        d.reset();
        assert!(d.store().is_empty());
        assert!(!d.presence().is_online(STYLIST));
    }
}
