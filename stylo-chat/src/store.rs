//! Conversation store: the session-scoped cache of conversations and messages.
//!
//! Only the [`Dispatcher`](crate::dispatcher::Dispatcher) mutates the store.
//! Readers get a [`StoreSnapshot`], an immutable view that shares unchanged
//! conversations with the live store (copy-on-write through `Arc`), so a
//! snapshot never observes a half-applied mutation.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::protocol::{epoch_millis, Conversation, ConversationSnapshot, Message};

/// A conversation and its messages, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

impl ConversationEntry {
    /// Build an entry, folding a preview-only `last_message` into the history.
    fn from_snapshot(snapshot: ConversationSnapshot) -> Self {
        let ConversationSnapshot {
            mut conversation,
            messages,
        } = snapshot;
        conversation.dedup_participants();

        let mut entry = Self {
            conversation,
            messages: Vec::with_capacity(messages.len() + 1),
        };
        let preview = entry.conversation.last_message.take();
        for message in messages.into_iter().chain(preview) {
            entry.insert(message);
        }
        entry.refresh_last_message();
        entry
    }

    fn position_of(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == message_id)
    }

    /// Insert in chronological order. Equal timestamps keep arrival order.
    fn insert(&mut self, message: Message) -> bool {
        if self.position_of(&message.id).is_some() {
            return false;
        }
        let at = message.created_at_millis();
        let index = self
            .messages
            .partition_point(|m| m.created_at_millis() <= at);
        self.messages.insert(index, message);
        true
    }

    fn refresh_last_message(&mut self) {
        self.conversation.last_message = self.messages.last().cloned();
        if let Some(last) = &self.conversation.last_message {
            if last.created_at_millis() > epoch_millis(self.conversation.updated_at) {
                self.conversation.updated_at = last.created_at;
            }
        }
    }

    pub fn unread_count(&self, user_id: &str) -> usize {
        self.messages
            .iter()
            .filter(|m| m.sender_id != user_id && !m.is_read_by(user_id))
            .count()
    }

    /// Ids of messages `user_id` has not read, excluding their own.
    pub fn unread_ids(&self, user_id: &str) -> Vec<String> {
        self.messages
            .iter()
            .filter(|m| m.sender_id != user_id && !m.is_read_by(user_id))
            .map(|m| m.id.clone())
            .collect()
    }
}

/// Result of [`ConversationStore::append_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// A message with the same id is already held.
    Duplicate,
    /// The conversation is not held locally; it must be fetched out-of-band.
    UnknownConversation,
}

/// Immutable view of the store at one point in time.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    conversations: BTreeMap<String, Arc<ConversationEntry>>,
    version: u64,
}

impl StoreSnapshot {
    /// Incremented by every mutation of the live store.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.conversations.contains_key(conversation_id)
    }

    pub fn entry(&self, conversation_id: &str) -> Option<&ConversationEntry> {
        self.conversations.get(conversation_id).map(Arc::as_ref)
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<&Conversation> {
        self.entry(conversation_id).map(|e| &e.conversation)
    }

    /// Messages of a conversation, oldest first. Empty if unknown.
    pub fn messages(&self, conversation_id: &str) -> &[Message] {
        self.entry(conversation_id)
            .map(|e| e.messages.as_slice())
            .unwrap_or(&[])
    }

    pub fn message(&self, conversation_id: &str, message_id: &str) -> Option<&Message> {
        self.messages(conversation_id)
            .iter()
            .find(|m| m.id == message_id)
    }

    pub fn conversation_ids(&self) -> impl Iterator<Item = &str> {
        self.conversations.keys().map(String::as_str)
    }

    /// Conversations, most recently active first.
    pub fn conversations_by_activity(&self) -> Vec<&Conversation> {
        let mut list: Vec<&Conversation> = self
            .conversations
            .values()
            .map(|e| &e.conversation)
            .collect();
        list.sort_by(|a, b| {
            b.last_activity_millis()
                .cmp(&a.last_activity_millis())
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    pub fn unread_count(&self, conversation_id: &str, user_id: &str) -> usize {
        self.entry(conversation_id)
            .map_or(0, |e| e.unread_count(user_id))
    }

    pub fn total_unread(&self, user_id: &str) -> usize {
        self.conversations
            .values()
            .map(|e| e.unread_count(user_id))
            .sum()
    }
}

/// The live store.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: BTreeMap<String, Arc<ConversationEntry>>,
    version: u64,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            conversations: self.conversations.clone(),
            version: self.version,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.conversations.contains_key(conversation_id)
    }

    pub fn entry(&self, conversation_id: &str) -> Option<&ConversationEntry> {
        self.conversations.get(conversation_id).map(Arc::as_ref)
    }

    /// Insert or update conversation metadata. Held messages are kept and
    /// `last_message` is recomputed from them.
    pub(crate) fn upsert_conversation(&mut self, conversation: Conversation) {
        let id = conversation.id.clone();
        match self.conversations.get_mut(&id) {
            Some(existing) => {
                let entry = Arc::make_mut(existing);
                let messages = std::mem::take(&mut entry.messages);
                *entry = ConversationEntry::from_snapshot(ConversationSnapshot {
                    conversation,
                    messages,
                });
            }
            None => {
                let entry = ConversationEntry::from_snapshot(ConversationSnapshot {
                    conversation,
                    messages: Vec::new(),
                });
                self.conversations.insert(id, Arc::new(entry));
            }
        }
        self.version += 1;
    }

    /// Add a message to its conversation and update `last_message`.
    pub(crate) fn append_message(&mut self, message: Message) -> AppendOutcome {
        let Some(existing) = self.conversations.get_mut(&message.conversation_id) else {
            return AppendOutcome::UnknownConversation;
        };
        if existing.position_of(&message.id).is_some() {
            return AppendOutcome::Duplicate;
        }

        let entry = Arc::make_mut(existing);
        entry.insert(message);
        entry.refresh_last_message();
        self.version += 1;
        AppendOutcome::Appended
    }

    /// Add `reader` to `read_by` of each listed message.
    ///
    /// Returns how many messages changed; repeated receipts change nothing.
    pub(crate) fn mark_read(
        &mut self,
        conversation_id: &str,
        message_ids: &[String],
        reader: &str,
    ) -> usize {
        let Some(existing) = self.conversations.get_mut(conversation_id) else {
            return 0;
        };
        let pending: Vec<usize> = message_ids
            .iter()
            .filter_map(|id| existing.position_of(id))
            .filter(|&i| !existing.messages[i].is_read_by(reader))
            .collect();
        if pending.is_empty() {
            return 0;
        }

        let entry = Arc::make_mut(existing);
        let mut changed = 0;
        for index in pending {
            if entry.messages[index].mark_read_by(reader) {
                changed += 1;
            }
        }
        entry.refresh_last_message();
        self.version += 1;
        changed
    }

    /// Replace every conversation and message with `snapshots`.
    pub(crate) fn replace_all(&mut self, snapshots: Vec<ConversationSnapshot>) {
        self.conversations = snapshots
            .into_iter()
            .map(|snapshot| {
                let entry = ConversationEntry::from_snapshot(snapshot);
                (entry.conversation.id.clone(), Arc::new(entry))
            })
            .collect();
        self.version += 1;
    }

    /// Drop all state (logout / provider teardown).
    pub(crate) fn clear(&mut self) {
        if !self.conversations.is_empty() {
            self.conversations.clear();
            self.version += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatMessagePayload, MessageKind};

    fn message(id: &str, conversation: &str, sender: &str, created_at: i64) -> Message {
        Message::from_payload(
            MessageKind::Text,
            conversation,
            sender,
            &ChatMessagePayload {
                id: id.into(),
                content: Some(format!("body of {id}")),
                file: None,
                order_id: None,
                created_at,
            },
        )
    }

    fn conversation(id: &str) -> Conversation {
        Conversation::new(id, ["u-customer", "u-stylist"], 1_000)
    }

    fn store_with(id: &str) -> ConversationStore {
        let mut store = ConversationStore::new();
        store.upsert_conversation(conversation(id));
        store
    }

    #[test]
    fn test_append_updates_last_message() {
        let mut store = store_with("c");
        store.append_message(message("m1", "c", "u-stylist", 1_100));
        assert_eq!(
            store.snapshot().conversation("c").unwrap().last_message.as_ref().unwrap().id,
            "m1"
        );

        assert_eq!(
            store.append_message(message("m2", "c", "u-customer", 1_200)),
            AppendOutcome::Appended
        );
        let snapshot = store.snapshot();
        let conv = snapshot.conversation("c").unwrap();
        assert_eq!(conv.last_message.as_ref().unwrap().id, "m2");
        assert_eq!(conv.updated_at, 1_200);
    }

    #[test]
    fn test_older_message_keeps_last_message() {
        let mut store = store_with("c");
        store.append_message(message("late", "c", "u-stylist", 2_000));
        store.append_message(message("early", "c", "u-stylist", 1_500));

        let snapshot = store.snapshot();
        let ids: Vec<&str> = snapshot.messages("c").iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
        assert_eq!(
            snapshot.conversation("c").unwrap().last_message.as_ref().unwrap().id,
            "late"
        );
    }

    #[test]
    fn test_mixed_timestamp_units_order_correctly() {
        let mut store = store_with("c");
        store.append_message(message("ms", "c", "u", 1_700_000_000_500));
        store.append_message(message("secs", "c", "u", 1_700_000_001));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.messages("c")[1].id, "secs");
    }

    #[test]
    fn test_duplicate_append_is_noop() {
        let mut store = store_with("c");
        store.append_message(message("m1", "c", "u", 1_100));
        let version = store.version();
        assert_eq!(
            store.append_message(message("m1", "c", "u", 1_100)),
            AppendOutcome::Duplicate
        );
        assert_eq!(store.version(), version);
        assert_eq!(store.snapshot().messages("c").len(), 1);
    }

    #[test]
    fn test_append_to_unknown_conversation_is_noop() {
        let mut store = ConversationStore::new();
        assert_eq!(
            store.append_message(message("m1", "ghost", "u", 1)),
            AppendOutcome::UnknownConversation
        );
        assert!(store.is_empty());
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_mark_read_is_idempotent() {
        let mut store = store_with("c");
        store.append_message(message("m1", "c", "u-stylist", 1_100));
        let ids = vec!["m1".to_string()];

        assert_eq!(store.mark_read("c", &ids, "u-customer"), 1);
        let after_first = store.snapshot();
        assert_eq!(store.mark_read("c", &ids, "u-customer"), 0);
        let after_second = store.snapshot();

        assert_eq!(after_first.version(), after_second.version());
        let read_by = &after_second.message("c", "m1").unwrap().read_by;
        assert_eq!(read_by.len(), 1);
        assert!(read_by.contains("u-customer"));
        // Denormalized copy follows.
        let last = after_second.conversation("c").unwrap().last_message.as_ref().unwrap();
        assert!(last.is_read_by("u-customer"));
    }

    #[test]
    fn test_mark_read_ignores_unknown_ids() {
        let mut store = store_with("c");
        store.append_message(message("m1", "c", "u", 1_100));
        assert_eq!(store.mark_read("c", &["nope".to_string()], "u-2"), 0);
        assert_eq!(store.mark_read("ghost", &["m1".to_string()], "u-2"), 0);
    }

    #[test]
    fn test_replace_all_drops_missing_conversations() {
        let mut store = store_with("A");
        for (i, id) in ["a1", "a2", "a3"].into_iter().enumerate() {
            store.append_message(message(id, "A", "u", 1_100 + i as i64));
        }

        store.replace_all(vec![ConversationSnapshot {
            conversation: conversation("B"),
            messages: vec![message("b1", "B", "u", 1_500), message("b2", "B", "u", 1_600)],
        }]);

        let snapshot = store.snapshot();
        assert!(!snapshot.contains("A"));
        assert!(snapshot.contains("B"));
        assert_eq!(snapshot.messages("B").len(), 2);
        assert_eq!(
            snapshot.conversation("B").unwrap().last_message.as_ref().unwrap().id,
            "b2"
        );
    }

    #[test]
    fn test_snapshot_reconciles_last_message() {
        // The server's denormalized pointer disagrees with the history.
        let mut conv = conversation("c");
        conv.last_message = Some(message("stale", "c", "u", 1_050));
        let mut store = ConversationStore::new();
        store.replace_all(vec![ConversationSnapshot {
            conversation: conv,
            messages: vec![message("newest", "c", "u", 1_900)],
        }]);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.messages("c").len(), 2);
        assert_eq!(
            snapshot.conversation("c").unwrap().last_message.as_ref().unwrap().id,
            "newest"
        );
    }

    #[test]
    fn test_upsert_keeps_messages() {
        let mut store = store_with("c");
        store.append_message(message("m1", "c", "u", 1_100));

        let mut renamed = conversation("c");
        renamed.participant_ids.push("u-assistant".into());
        store.upsert_conversation(renamed);

        let snapshot = store.snapshot();
        let conv = snapshot.conversation("c").unwrap();
        assert_eq!(conv.participant_ids.len(), 3);
        assert_eq!(conv.last_message.as_ref().unwrap().id, "m1");
        assert_eq!(snapshot.messages("c").len(), 1);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_mutations() {
        let mut store = store_with("c");
        store.append_message(message("m1", "c", "u", 1_100));
        let before = store.snapshot();

        store.append_message(message("m2", "c", "u", 1_200));
        store.mark_read("c", &["m1".to_string()], "u-2");

        assert_eq!(before.messages("c").len(), 1);
        assert!(before.message("c", "m1").unwrap().read_by.is_empty());
        assert_eq!(store.snapshot().messages("c").len(), 2);
    }

    #[test]
    fn test_conversations_by_activity() {
        let mut store = ConversationStore::new();
        for id in ["quiet", "busy", "fresh"] {
            store.upsert_conversation(conversation(id));
        }
        store.append_message(message("m1", "busy", "u", 5_000));
        let mut fresh = conversation("fresh");
        fresh.updated_at = 3_000;
        store.upsert_conversation(fresh);

        let snapshot = store.snapshot();
        let order: Vec<&str> = snapshot
            .conversations_by_activity()
            .into_iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(order, vec!["busy", "fresh", "quiet"]);
    }

    #[test]
    fn test_unread_counts() {
        let mut store = store_with("c");
        store.append_message(message("m1", "c", "u-stylist", 1_100));
        store.append_message(message("m2", "c", "u-stylist", 1_200));
        store.append_message(message("m3", "c", "u-customer", 1_300));

        assert_eq!(store.snapshot().unread_count("c", "u-customer"), 2);
        store.mark_read("c", &["m1".to_string()], "u-customer");

        let snapshot = store.snapshot();
        assert_eq!(snapshot.unread_count("c", "u-customer"), 1);
        assert_eq!(snapshot.total_unread("u-customer"), 1);
        assert_eq!(snapshot.entry("c").unwrap().unread_ids("u-customer"), vec!["m2"]);
        assert_eq!(snapshot.unread_count("ghost", "u-customer"), 0);
    }

    #[test]
    fn test_clear() {
        let mut store = store_with("c");
        store.clear();
        assert!(store.is_empty());
        assert!(store.snapshot().is_empty());
    }
}
