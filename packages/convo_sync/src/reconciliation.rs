//! Reconciliation of provisional messages against their server echo.
//!
//! `send` records a provisional entry for every locally created message. When
//! a confirmed message arrives on the push channel it is matched against the
//! table by sender, content and a creation-time window. The server assigns the
//! real id and timestamp and no request id comes back through the push
//! channel, so this is a best-effort match: two identical messages from the
//! same sender inside the window can be paired with the wrong slot.

use chrono::{DateTime, Duration, Utc};

use crate::types::{Message, SendState};

/// Default tolerance between a provisional message's timestamp and its echo's.
pub const DEFAULT_MATCH_WINDOW_SECS: i64 = 10;

/// The `(sender, content, created_at)` triple used for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A message shown optimistically before the server confirmed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionalEntry {
    pub temp_id: String,
    pub fingerprint: Fingerprint,
    pub receiver_id: Option<String>,
    pub send_state: SendState,
}

impl ProvisionalEntry {
    pub fn pending(
        temp_id: String,
        sender_id: String,
        content: String,
        receiver_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            temp_id,
            fingerprint: Fingerprint {
                sender_id,
                content,
                created_at,
            },
            receiver_id,
            send_state: SendState::Pending,
        }
    }

    /// The message listeners see for this entry.
    pub fn to_message(&self, conversation_id: &crate::types::ConversationId) -> Message {
        Message {
            id: self.temp_id.clone(),
            conversation_id: conversation_id.clone(),
            sender_id: self.fingerprint.sender_id.clone(),
            receiver_id: self.receiver_id.clone(),
            content: self.fingerprint.content.clone(),
            created_at: self.fingerprint.created_at,
            status: self.send_state,
            temp_id: Some(self.temp_id.clone()),
        }
    }

    fn matches(&self, incoming: &Message, window: Duration) -> bool {
        let fp = &self.fingerprint;
        fp.sender_id == incoming.sender_id
            && fp.content == incoming.content
            && (incoming.created_at - fp.created_at).abs() <= window
    }
}

/// Provisional entries of one conversation, in registration order.
#[derive(Debug, Clone)]
pub struct ReconciliationTable {
    entries: Vec<ProvisionalEntry>,
    window: Duration,
}

impl Default for ReconciliationTable {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_MATCH_WINDOW_SECS))
    }
}

impl ReconciliationTable {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: Vec::new(),
            window,
        }
    }

    pub fn register_provisional(&mut self, entry: ProvisionalEntry) {
        self.entries.push(entry);
    }

    /// Consume the first entry matching `incoming`, returning its temp id.
    ///
    /// `None` means the message originated elsewhere and should be appended.
    pub fn match_and_consume(&mut self, incoming: &Message) -> Option<String> {
        let idx = self
            .entries
            .iter()
            .position(|entry| entry.matches(incoming, self.window))?;
        Some(self.entries.remove(idx).temp_id)
    }

    /// Mark an entry as failed. Returns the updated entry.
    pub fn mark_failed(&mut self, temp_id: &str) -> Option<&ProvisionalEntry> {
        let entry = self.entries.iter_mut().find(|e| e.temp_id == temp_id)?;
        entry.send_state = SendState::Failed;
        Some(entry)
    }

    /// Flip a failed entry back to pending for an explicit resend.
    ///
    /// The fingerprint timestamp moves to `created_at` so the new echo falls
    /// inside the window.
    pub fn mark_pending(
        &mut self,
        temp_id: &str,
        created_at: DateTime<Utc>,
    ) -> Option<&ProvisionalEntry> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.temp_id == temp_id && e.send_state == SendState::Failed)?;
        entry.send_state = SendState::Pending;
        entry.fingerprint.created_at = created_at;
        Some(entry)
    }

    pub fn remove(&mut self, temp_id: &str) -> Option<ProvisionalEntry> {
        let idx = self.entries.iter().position(|e| e.temp_id == temp_id)?;
        Some(self.entries.remove(idx))
    }

    pub fn get(&self, temp_id: &str) -> Option<&ProvisionalEntry> {
        self.entries.iter().find(|e| e.temp_id == temp_id)
    }

    /// Drop pending entries whose echo never arrived within `ttl`.
    /// Failed entries stay until resent or discarded. A `ttl` reaching past
    /// the representable date range never prunes.
    pub fn prune_stale(&mut self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let Some(cutoff) = now.checked_sub_signed(ttl) else {
            return 0;
        };
        let before = self.entries.len();
        self.entries.retain(|e| {
            e.send_state != SendState::Pending || e.fingerprint.created_at > cutoff
        });
        before - self.entries.len()
    }

    pub fn entries(&self) -> &[ProvisionalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
