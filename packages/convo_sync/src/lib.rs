//! # convo_sync
//!
//! Real-time conversation synchronization for chat clients.
//!
//! One push channel per open conversation is kept alive (reconnecting with a
//! fixed delay for as long as the conversation stays open), its frames are
//! fanned out to any number of subscribers, and messages sent locally are
//! shown immediately as provisional messages that get replaced in place when
//! the server's echo arrives.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use convo_sync::{ConversationChannelManager, HttpTransport, SyncConfig};
//!
//! # async fn run() -> convo_sync::Result<()> {
//! let config = SyncConfig::load(None)?;
//! let http = HttpTransport::new(&config.server, config.channel.max_frame_bytes)?;
//! let manager = ConversationChannelManager::with_http(http, config.channel);
//!
//! let conv = "conv-1".into();
//! manager
//!     .subscribe(&conv, |msg, replaced| {
//!         println!("{} {}: {}", if replaced { "~" } else { "+" }, msg.sender_id, msg.content);
//!     })
//!     .await;
//! manager.open(&conv, "u1").await;
//!
//! let outcome = manager.send(&conv, "hello", "u1", Some("u2")).await;
//! assert!(outcome.temp_id.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## Components
//!
//! - [`classifier`]: drops protocol frames, parses content frames
//! - [`framing`]: NDJSON line decoding of the push stream
//! - [`reconciliation`]: matches provisional messages to their echo
//! - [`listeners`]: per-conversation subscriber registry
//! - [`transport`]: push/write collaborators and their HTTP implementation
//! - [`manager`]: the public [`ConversationChannelManager`]

pub mod classifier;
pub mod config;
mod connection;
pub mod error;
pub mod framing;
pub mod listeners;
pub mod manager;
pub mod reconciliation;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_helpers;

pub use config::{ChannelConfig, ServerConfig, SyncConfig};
pub use error::{Result, SyncError};
pub use listeners::Listener;
pub use manager::ConversationChannelManager;
pub use reconciliation::{Fingerprint, ProvisionalEntry, ReconciliationTable};
pub use transport::{FrameStream, HttpTransport, MessageApi, PushTransport};
pub use types::{
    ChannelNotice, ChannelState, ConversationId, ListenerId, Message, SendOutcome, SendState,
};
