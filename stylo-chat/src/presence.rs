//! Presence and typing tracker.
//!
//! Tracks who is online and who is typing in which conversation.
//!
//! ```text
//! typing envelope ──► start_typing()   (expires_at = now + timeout)
//!                          │
//!        refresh ◄─────────┤
//!                          ▼
//! stop_typing envelope ──► removed ◄── expire(now) once expires_at passes
//! ```
//!
//! Expiry is deadline-based: the tracker never spawns timers of its own.
//! The session sleeps until [`PresenceTracker::next_expiry`] and then calls
//! [`PresenceTracker::expire`]. Clearing a conversation removes its
//! deadlines, so nothing survives teardown.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

// ───────────────────────────────────────────────────────────────────
// Typing indicator
// ───────────────────────────────────────────────────────────────────

/// Ephemeral "user is composing" signal for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingIndicator {
    pub user_id: String,
    pub user_name: Option<String>,
    pub is_typing: bool,
    expires_at: Instant,
}

impl TypingIndicator {
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Online set and per-conversation typing indicators.
#[derive(Debug)]
pub struct PresenceTracker {
    /// The local user's own typing echoes are ignored.
    local_user_id: String,
    online: HashMap<String, bool>,
    /// conversation_id → user_id → indicator
    typing: HashMap<String, HashMap<String, TypingIndicator>>,
    typing_timeout: Duration,
}

impl PresenceTracker {
    pub fn new(local_user_id: impl Into<String>, typing_timeout: Duration) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            online: HashMap::new(),
            typing: HashMap::new(),
            typing_timeout,
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn typing_timeout(&self) -> Duration {
        self.typing_timeout
    }

    // ── Online status ───────────────────────────────────────────

    /// Record a user's status. Returns `true` if it changed.
    pub fn set_online(&mut self, user_id: &str, online: bool) -> bool {
        self.online.insert(user_id.to_string(), online) != Some(online)
    }

    /// Unknown users are reported offline.
    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.get(user_id).copied().unwrap_or(false)
    }

    /// Online users, sorted.
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .online
            .iter()
            .filter(|(_, online)| **online)
            .map(|(id, _)| id.clone())
            .collect();
        users.sort();
        users
    }

    // ── Typing ──────────────────────────────────────────────────

    /// Create or refresh a typing indicator.
    ///
    /// Returns `true` if the indicator is new or its name changed; a plain
    /// refresh only pushes the deadline back.
    pub fn start_typing(
        &mut self,
        conversation_id: &str,
        user_id: &str,
        user_name: Option<String>,
        now: Instant,
    ) -> bool {
        if user_id == self.local_user_id {
            return false;
        }
        let expires_at = now + self.typing_timeout;
        let users = self.typing.entry(conversation_id.to_string()).or_default();

        match users.get_mut(user_id) {
            Some(indicator) => {
                indicator.expires_at = expires_at;
                if user_name.is_some() && indicator.user_name != user_name {
                    indicator.user_name = user_name;
                    return true;
                }
                false
            }
            None => {
                users.insert(
                    user_id.to_string(),
                    TypingIndicator {
                        user_id: user_id.to_string(),
                        user_name,
                        is_typing: true,
                        expires_at,
                    },
                );
                true
            }
        }
    }

    /// Remove a typing indicator. Returns `true` if one was present.
    pub fn stop_typing(&mut self, conversation_id: &str, user_id: &str) -> bool {
        let Some(users) = self.typing.get_mut(conversation_id) else {
            return false;
        };
        let removed = users.remove(user_id).is_some();
        if users.is_empty() {
            self.typing.remove(conversation_id);
        }
        removed
    }

    pub fn is_typing(&self, conversation_id: &str, user_id: &str) -> bool {
        self.typing
            .get(conversation_id)
            .is_some_and(|users| users.contains_key(user_id))
    }

    /// Indicators for a conversation, sorted by user id.
    pub fn typing_in(&self, conversation_id: &str) -> Vec<TypingIndicator> {
        let mut list: Vec<TypingIndicator> = self
            .typing
            .get(conversation_id)
            .map(|users| users.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        list
    }

    /// Earliest pending expiry, if any indicator is live.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.typing
            .values()
            .flat_map(|users| users.values())
            .map(|indicator| indicator.expires_at)
            .min()
    }

    /// Remove every indicator whose deadline has passed.
    ///
    /// Returns the removed (conversation_id, user_id) pairs.
    pub fn expire(&mut self, now: Instant) -> Vec<(String, String)> {
        let mut removed = Vec::new();
        self.typing.retain(|conversation_id, users| {
            users.retain(|user_id, indicator| {
                if indicator.is_expired(now) {
                    removed.push((conversation_id.clone(), user_id.clone()));
                    false
                } else {
                    true
                }
            });
            !users.is_empty()
        });
        if !removed.is_empty() {
            log::trace!("Expired {} typing indicator(s)", removed.len());
        }
        removed
    }

    /// Drop all typing state for one conversation (screen teardown).
    pub fn clear_conversation(&mut self, conversation_id: &str) -> bool {
        self.typing.remove(conversation_id).is_some()
    }

    /// Drop everything (session teardown).
    pub fn clear(&mut self) {
        self.online.clear();
        self.typing.clear();
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        PresenceSnapshot {
            online: self
                .online
                .iter()
                .map(|(id, &online)| (id.clone(), online))
                .collect(),
            typing: self
                .typing
                .keys()
                .map(|conversation_id| (conversation_id.clone(), self.typing_in(conversation_id)))
                .collect(),
        }
    }
}

/// Immutable view of the tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub online: BTreeMap<String, bool>,
    pub typing: BTreeMap<String, Vec<TypingIndicator>>,
}

impl PresenceSnapshot {
    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.get(user_id).copied().unwrap_or(false)
    }

    pub fn typing_in(&self, conversation_id: &str) -> &[TypingIndicator] {
        self.typing
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_typing(&self, conversation_id: &str, user_id: &str) -> bool {
        self.typing_in(conversation_id)
            .iter()
            .any(|t| t.user_id == user_id)
    }
}
