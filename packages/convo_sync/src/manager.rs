//! ConversationChannelManager: the public surface of the sync layer.
//!
//! Owns every per-conversation channel slot (connection state plus the
//! reconciliation table) and the listener registry. Clones share the same
//! state, so a manager can be handed to every UI component that needs it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ChannelConfig;
use crate::connection::ChannelConnection;
use crate::error::{Result, SyncError};
use crate::listeners::{Listener, ListenerRegistry, dispatch};
use crate::reconciliation::{ProvisionalEntry, ReconciliationTable};
use crate::transport::{HttpTransport, MessageApi, PushTransport};
use crate::types::{
    ChannelNotice, ChannelState, ConversationId, ListenerId, Message, SendOutcome,
};

/// Per-conversation state, created by `open` and dropped by `close`.
pub(crate) struct ChannelSlot {
    generation: u64,
    user_id: String,
    state: ChannelState,
    cancel: CancellationToken,
    table: ReconciliationTable,
}

/// State shared between the manager handle and its connection tasks.
///
/// Lock order: `channels` before `listeners`. Neither is held across a
/// network call or while listeners run.
pub(crate) struct Shared {
    channels: Mutex<HashMap<ConversationId, ChannelSlot>>,
    listeners: RwLock<ListenerRegistry>,
    notice_tx: broadcast::Sender<ChannelNotice>,
    config: ChannelConfig,
}

impl Shared {
    fn notify(&self, notice: ChannelNotice) {
        // No receivers is fine.
        let _ = self.notice_tx.send(notice);
    }

    pub(crate) fn warn(&self, conversation_id: &ConversationId, attempt: u32, message: String) {
        self.notify(ChannelNotice::Warning {
            conversation_id: conversation_id.clone(),
            attempt,
            message,
        });
    }

    /// Update the state of the slot owned by `generation`. Returns false if
    /// the slot is gone or belongs to a newer connection.
    pub(crate) async fn set_state(
        &self,
        conversation_id: &ConversationId,
        generation: u64,
        state: ChannelState,
    ) -> bool {
        let mut channels = self.channels.lock().await;
        let Some(slot) = channels
            .get_mut(conversation_id)
            .filter(|slot| slot.generation == generation)
        else {
            return false;
        };
        if slot.state != state {
            debug!(conversation = %conversation_id, from = %slot.state, to = %state, "channel state");
            slot.state = state;
            self.notify(ChannelNotice::StateChanged {
                conversation_id: conversation_id.clone(),
                state,
            });
        }
        true
    }

    /// Reconcile a confirmed message and fan it out.
    ///
    /// A message matching a provisional entry is delivered as a replacement
    /// of that slot; anything else is appended.
    pub(crate) async fn deliver_incoming(
        &self,
        conversation_id: &ConversationId,
        generation: u64,
        mut message: Message,
    ) -> bool {
        let listeners = {
            let mut channels = self.channels.lock().await;
            let Some(slot) = channels
                .get_mut(conversation_id)
                .filter(|slot| slot.generation == generation)
            else {
                return false;
            };

            message.temp_id = slot.table.match_and_consume(&message);
            if message.temp_id.is_none() {
                let pruned = slot
                    .table
                    .prune_stale(Utc::now(), self.config.provisional_ttl);
                if pruned > 0 {
                    debug!(conversation = %conversation_id, pruned, "abandoned stale provisional messages");
                }
            }
            self.listeners.read().await.snapshot(conversation_id)
        };

        let is_replacement = message.temp_id.is_some();
        debug!(
            conversation = %conversation_id,
            message_id = %message.id,
            replaces = ?message.temp_id,
            "delivering message"
        );
        dispatch(conversation_id, &listeners, &message, is_replacement);
        true
    }
}

/// Keeps per-conversation push channels alive, fans their messages out to
/// subscribers, and reconciles optimistic sends with their server echo.
///
/// Must be used from within a tokio runtime: `open` spawns the connection task.
#[derive(Clone)]
pub struct ConversationChannelManager {
    shared: Arc<Shared>,
    transport: Arc<dyn PushTransport>,
    api: Arc<dyn MessageApi>,
    next_generation: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl ConversationChannelManager {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        api: Arc<dyn MessageApi>,
        config: ChannelConfig,
    ) -> Self {
        let (notice_tx, _) = broadcast::channel(config.notice_capacity);
        Self {
            shared: Arc::new(Shared {
                channels: Mutex::new(HashMap::new()),
                listeners: RwLock::new(ListenerRegistry::new()),
                notice_tx,
                config,
            }),
            transport,
            api,
            next_generation: Arc::new(AtomicU64::new(1)),
            cancel: CancellationToken::new(),
        }
    }

    /// Manager backed by one HTTP client for both the push stream and writes.
    pub fn with_http(http: HttpTransport, config: ChannelConfig) -> Self {
        let http = Arc::new(http);
        Self::new(http.clone(), http, config)
    }

    /// Subscribe to connection state changes and reconnect warnings.
    pub fn notices(&self) -> broadcast::Receiver<ChannelNotice> {
        self.shared.notice_tx.subscribe()
    }

    /// Open the push channel for a conversation.
    ///
    /// Idempotent: returns false and leaves the existing connection alone if
    /// the conversation is already open. Also returns false after `shutdown`.
    pub async fn open(&self, conversation_id: &ConversationId, user_id: &str) -> bool {
        if self.cancel.is_cancelled() {
            warn!(conversation = %conversation_id, "open after shutdown ignored");
            return false;
        }
        let mut channels = self.shared.channels.lock().await;
        if let Some(slot) = channels.get(conversation_id) {
            debug!(
                conversation = %conversation_id,
                state = %slot.state,
                "conversation already open"
            );
            return false;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = self.cancel.child_token();
        channels.insert(
            conversation_id.clone(),
            ChannelSlot {
                generation,
                user_id: user_id.to_string(),
                state: ChannelState::Connecting,
                cancel: cancel.clone(),
                table: ReconciliationTable::new(self.shared.config.match_window),
            },
        );
        drop(channels);

        self.shared.notify(ChannelNotice::StateChanged {
            conversation_id: conversation_id.clone(),
            state: ChannelState::Connecting,
        });
        info!(conversation = %conversation_id, user = %user_id, "opening conversation");

        ChannelConnection {
            shared: self.shared.clone(),
            transport: self.transport.clone(),
            conversation_id: conversation_id.clone(),
            user_id: user_id.to_string(),
            generation,
            cancel,
            reconnect_delay: self.shared.config.reconnect_delay,
        }
        .spawn();

        true
    }

    /// Tear down a conversation: stop its connection (including any pending
    /// reconnect), drop its listeners and its provisional messages.
    ///
    /// Returns false if the conversation was not open. Listeners registered
    /// without an open channel are dropped either way.
    pub async fn close(&self, conversation_id: &ConversationId) -> bool {
        let removed = self.shared.channels.lock().await.remove(conversation_id);
        let listeners = self.shared.listeners.write().await.clear(conversation_id);

        let Some(slot) = removed else {
            return false;
        };
        slot.cancel.cancel();
        self.shared.notify(ChannelNotice::StateChanged {
            conversation_id: conversation_id.clone(),
            state: ChannelState::Closed,
        });
        info!(
            conversation = %conversation_id,
            user = %slot.user_id,
            listeners,
            discarded_provisional = slot.table.len(),
            "conversation closed"
        );
        true
    }

    /// Close every open conversation. The manager cannot open new ones
    /// afterwards.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let drained: Vec<ConversationId> = {
            let mut channels = self.shared.channels.lock().await;
            channels.drain().map(|(id, _)| id).collect()
        };
        let mut listeners = self.shared.listeners.write().await;
        for id in &drained {
            listeners.clear(id);
            self.shared.notify(ChannelNotice::StateChanged {
                conversation_id: id.clone(),
                state: ChannelState::Closed,
            });
        }
        info!(count = drained.len(), "channel manager shut down");
    }

    pub async fn subscribe<F>(&self, conversation_id: &ConversationId, listener: F) -> ListenerId
    where
        F: Fn(&Message, bool) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.shared
            .listeners
            .write()
            .await
            .subscribe(conversation_id, listener)
    }

    pub async fn unsubscribe(&self, conversation_id: &ConversationId, id: ListenerId) -> bool {
        self.shared
            .listeners
            .write()
            .await
            .unsubscribe(conversation_id, id)
    }

    /// Send a message with an optimistic local echo.
    ///
    /// When the conversation is open, a provisional message is registered
    /// and delivered to listeners before the durable write starts. A failed
    /// write marks it `Failed` (delivered again as a replacement) and is not
    /// retried; see [`resend`](Self::resend). A successful write leaves the
    /// provisional message pending until its echo arrives on the push channel.
    ///
    /// When the conversation is not open the write is still issued, without
    /// an optimistic echo, and `temp_id` is `None`.
    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        sender_id: &str,
        receiver_id: Option<&str>,
    ) -> SendOutcome {
        if content.trim().is_empty() {
            return SendOutcome::failed(SyncError::EmptyMessage, None);
        }

        let temp_id = format!("temp-{}", Uuid::new_v4());
        let registered = {
            let mut channels = self.shared.channels.lock().await;
            match channels.get_mut(conversation_id) {
                Some(slot) => {
                    let entry = ProvisionalEntry::pending(
                        temp_id.clone(),
                        sender_id.to_string(),
                        content.to_string(),
                        receiver_id.map(str::to_string),
                        Utc::now(),
                    );
                    let provisional = entry.to_message(conversation_id);
                    slot.table.register_provisional(entry);
                    let listeners = self.shared.listeners.read().await.snapshot(conversation_id);
                    Some((slot.generation, provisional, listeners))
                }
                None => None,
            }
        };

        let Some((generation, provisional, listeners)) = registered else {
            debug!(conversation = %conversation_id, "conversation not open, sending without local echo");
            return match self
                .api
                .send_message(conversation_id, content, receiver_id)
                .await
            {
                Ok(record) => SendOutcome {
                    success: true,
                    data: Some(record),
                    error: None,
                    temp_id: None,
                },
                Err(e) => {
                    warn!(conversation = %conversation_id, error = %e, "send failed");
                    SendOutcome::failed(e, None)
                }
            };
        };

        dispatch(conversation_id, &listeners, &provisional, false);
        self.write_provisional(conversation_id, generation, temp_id, content, receiver_id)
            .await
    }

    /// Explicitly resend a failed provisional message in its existing slot.
    pub async fn resend(&self, conversation_id: &ConversationId, temp_id: &str) -> SendOutcome {
        let flipped = {
            let mut channels = self.shared.channels.lock().await;
            channels.get_mut(conversation_id).and_then(|slot| {
                let entry = slot.table.mark_pending(temp_id, Utc::now())?.clone();
                Some((slot.generation, entry))
            })
        };

        let Some((generation, entry)) = flipped else {
            return SendOutcome::failed(
                SyncError::UnknownProvisional(temp_id.to_string()),
                Some(temp_id.to_string()),
            );
        };

        info!(conversation = %conversation_id, temp_id, "resending failed message");
        let listeners = self.shared.listeners.read().await.snapshot(conversation_id);
        dispatch(
            conversation_id,
            &listeners,
            &entry.to_message(conversation_id),
            true,
        );
        self.write_provisional(
            conversation_id,
            generation,
            entry.temp_id,
            &entry.fingerprint.content,
            entry.receiver_id.as_deref(),
        )
        .await
    }

    /// Abandon a provisional message. Returns false if it is unknown.
    pub async fn discard(&self, conversation_id: &ConversationId, temp_id: &str) -> bool {
        let mut channels = self.shared.channels.lock().await;
        channels
            .get_mut(conversation_id)
            .and_then(|slot| slot.table.remove(temp_id))
            .is_some()
    }

    /// Fetch the conversation's persisted history.
    pub async fn history(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        self.api.fetch_history(conversation_id).await
    }

    /// Current channel state; `Closed` for conversations that are not open.
    pub async fn state(&self, conversation_id: &ConversationId) -> ChannelState {
        self.shared
            .channels
            .lock()
            .await
            .get(conversation_id)
            .map_or(ChannelState::Closed, |slot| slot.state)
    }

    /// Snapshot of the conversation's provisional messages.
    pub async fn pending(&self, conversation_id: &ConversationId) -> Vec<ProvisionalEntry> {
        self.shared
            .channels
            .lock()
            .await
            .get(conversation_id)
            .map(|slot| slot.table.entries().to_vec())
            .unwrap_or_default()
    }

    pub async fn listener_count(&self, conversation_id: &ConversationId) -> usize {
        self.shared.listeners.read().await.count(conversation_id)
    }

    /// Durable write for a registered provisional message.
    async fn write_provisional(
        &self,
        conversation_id: &ConversationId,
        generation: u64,
        temp_id: String,
        content: &str,
        receiver_id: Option<&str>,
    ) -> SendOutcome {
        match self
            .api
            .send_message(conversation_id, content, receiver_id)
            .await
        {
            Ok(record) => {
                debug!(
                    conversation = %conversation_id,
                    temp_id = %temp_id,
                    message_id = %record.id,
                    "message persisted, awaiting echo"
                );
                SendOutcome::sent(record, temp_id)
            }
            Err(e) => {
                warn!(
                    conversation = %conversation_id,
                    temp_id = %temp_id,
                    error = %e,
                    "send failed"
                );
                self.mark_failed(conversation_id, generation, &temp_id).await;
                SendOutcome::failed(e, Some(temp_id))
            }
        }
    }

    /// Flag a provisional message as failed and redeliver it in place.
    /// Silently does nothing if the conversation was closed (or reopened)
    /// while the write was in flight, or its echo already reconciled it.
    async fn mark_failed(&self, conversation_id: &ConversationId, generation: u64, temp_id: &str) {
        let failed = {
            let mut channels = self.shared.channels.lock().await;
            let Some(slot) = channels
                .get_mut(conversation_id)
                .filter(|slot| slot.generation == generation)
            else {
                debug!(conversation = %conversation_id, temp_id, "send finished after close, discarded");
                return;
            };
            let Some(entry) = slot.table.mark_failed(temp_id) else {
                return;
            };
            let message = entry.to_message(conversation_id);
            let listeners = self.shared.listeners.read().await.snapshot(conversation_id);
            (message, listeners)
        };

        let (message, listeners) = failed;
        dispatch(conversation_id, &listeners, &message, true);
    }
}
