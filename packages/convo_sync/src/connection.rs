//! Channel Connection: one task per open conversation that keeps the push
//! stream alive and feeds its frames through the classifier.
//!
//! State machine:
//!
//! ```text
//! Closed ──open──▶ Connecting ──handshake──▶ Open
//!                      ▲                       │ transport error / stream end
//!                      │ after reconnect_delay ▼
//!                      └──────────────── Reconnecting
//! ```
//!
//! Only `close` leaves the loop. Retries are unbounded with a fixed delay.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::classify;
use crate::manager::Shared;
use crate::transport::{FrameStream, PushTransport};
use crate::types::{ChannelState, ConversationId, Message};

/// Why a pump loop stopped.
enum PumpExit {
    /// `close` was called or the slot now belongs to a newer connection.
    Superseded,
    /// The transport dropped; reconnect.
    Dropped(String),
}

pub(crate) struct ChannelConnection {
    pub(crate) shared: Arc<Shared>,
    pub(crate) transport: Arc<dyn PushTransport>,
    pub(crate) conversation_id: ConversationId,
    pub(crate) user_id: String,
    /// Identifies this connection's slot; a reopened conversation gets a new one.
    pub(crate) generation: u64,
    pub(crate) cancel: CancellationToken,
    pub(crate) reconnect_delay: Duration,
}

impl ChannelConnection {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let conv = self.conversation_id.clone();
        let mut attempt = 0u32;

        loop {
            if !self.set_state(ChannelState::Connecting).await {
                break;
            }

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.transport.connect(&conv, &self.user_id) => result,
            };

            let reason = match connected {
                Ok(frames) => {
                    if !self.set_state(ChannelState::Open).await {
                        break;
                    }
                    attempt = 0;
                    info!(conversation = %conv, user = %self.user_id, "push channel open");

                    match self.pump(frames).await {
                        PumpExit::Superseded => break,
                        PumpExit::Dropped(reason) => reason,
                    }
                }
                Err(e) => e.to_string(),
            };

            attempt += 1;
            if !self.set_state(ChannelState::Reconnecting).await {
                break;
            }
            warn!(
                conversation = %conv,
                attempt = attempt,
                error = %reason,
                "push channel lost, reconnecting in {:?}", self.reconnect_delay
            );
            self.shared.warn(&conv, attempt, reason);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        debug!(conversation = %conv, generation = self.generation, "connection task stopped");
    }

    async fn set_state(&self, state: ChannelState) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.shared
            .set_state(&self.conversation_id, self.generation, state)
            .await
    }

    /// Drain frames in arrival order until the stream drops or the
    /// connection is superseded.
    async fn pump(&self, mut frames: FrameStream) -> PumpExit {
        let conv = &self.conversation_id;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return PumpExit::Superseded,
                next = frames.next() => next,
            };

            let frame = match next {
                None => return PumpExit::Dropped("push stream ended".to_string()),
                Some(Err(e)) if e.is_connection_error() => {
                    return PumpExit::Dropped(e.to_string());
                }
                Some(Err(e)) => {
                    warn!(conversation = %conv, error = %e, "dropping undecodable frame");
                    continue;
                }
                Some(Ok(frame)) => frame,
            };

            match classify(&frame) {
                Ok(None) => debug!(conversation = %conv, "protocol frame dropped"),
                Ok(Some(message)) => {
                    if !self.deliver(message).await {
                        return PumpExit::Superseded;
                    }
                }
                Err(e) => {
                    warn!(conversation = %conv, error = %e, "malformed frame dropped");
                }
            }
        }
    }

    /// Returns false once this connection no longer owns the slot.
    async fn deliver(&self, mut message: Message) -> bool {
        let conv = &self.conversation_id;
        if message.conversation_id.is_empty() {
            message.conversation_id = conv.clone();
        } else if message.conversation_id != *conv {
            warn!(
                conversation = %conv,
                frame_conversation = %message.conversation_id,
                message_id = %message.id,
                "frame for another conversation dropped"
            );
            return true;
        }

        self.shared
            .deliver_incoming(conv, self.generation, message)
            .await
    }
}
