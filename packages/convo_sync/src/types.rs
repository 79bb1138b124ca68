use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::error::SyncError;

/// Opaque identifier of one conversation thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Delivery status of a message as seen by this client.
///
/// Server records are always `Confirmed`; `Pending` and `Failed` only ever
/// appear on provisional messages fabricated by `send`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendState {
    Pending,
    #[default]
    Confirmed,
    Failed,
}

/// A chat message, either server-confirmed or provisional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,

    /// Missing on frames that only make sense in the context of their
    /// channel; the connection fills it in.
    #[serde(default, alias = "conversationId")]
    pub conversation_id: ConversationId,

    #[serde(alias = "senderId")]
    pub sender_id: String,

    #[serde(default, alias = "receiverId", skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,

    pub content: String,

    #[serde(alias = "createdAt")]
    pub created_at: DateTime<Utc>,

    /// Client-side send state. Servers report their own delivery statuses
    /// (`sent`, `read`, …); anything arriving over the wire is `Confirmed`.
    #[serde(default, skip_deserializing)]
    pub status: SendState,

    /// Provisional slot this message occupies or replaces. Client-side only.
    #[serde(skip)]
    pub temp_id: Option<String>,
}

impl Message {
    pub fn is_provisional(&self) -> bool {
        self.temp_id.as_deref() == Some(self.id.as_str())
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Str(String),
        Num(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Str(s) => s,
        Id::Num(n) => n.to_string(),
    })
}

/// Lifecycle state of one conversation's push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Closed => "closed",
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Out-of-band channel events for status bars and toasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotice {
    StateChanged {
        conversation_id: ConversationId,
        state: ChannelState,
    },
    /// A connection attempt failed; the channel keeps retrying.
    Warning {
        conversation_id: ConversationId,
        attempt: u32,
        message: String,
    },
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Result of a `send` or `resend` call.
///
/// Describes only the durable write. Reconciliation of the provisional
/// message with its echo happens later on the push channel.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub success: bool,
    pub data: Option<Message>,
    pub error: Option<SyncError>,
    pub temp_id: Option<String>,
}

impl SendOutcome {
    pub(crate) fn sent(data: Message, temp_id: String) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            temp_id: Some(temp_id),
        }
    }

    pub(crate) fn failed(error: SyncError, temp_id: Option<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            temp_id,
        }
    }
}
