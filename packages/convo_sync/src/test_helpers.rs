//! Scripted collaborators for manager tests.
//!
//! `MockPush` hands every accepted connection to the test as a
//! `MockConnection` so frames and transport errors can be injected.
//! `MockApi` parks every write until the test answers it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::channel::mpsc as fmpsc;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::ChannelConfig;
use crate::error::{Result, SyncError};
use crate::manager::ConversationChannelManager;
use crate::transport::{FrameStream, MessageApi, PushTransport};
use crate::types::{ChannelNotice, ConversationId, Message, SendState};

pub(crate) const WAIT: Duration = Duration::from_secs(2);

/// Await a channel receive with a timeout so a broken test fails instead of hanging.
pub(crate) async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

/// Assert nothing arrives within a short grace period.
pub(crate) async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    if let Ok(item) = rx.try_recv() {
        panic!("unexpected event: {item:?}");
    }
}

pub(crate) fn test_config() -> ChannelConfig {
    ChannelConfig {
        reconnect_delay: Duration::from_millis(20),
        ..ChannelConfig::default()
    }
}

pub(crate) enum ConnectScript {
    Accept,
    Fail(String),
}

#[derive(Debug)]
pub(crate) struct MockConnection {
    pub conversation_id: ConversationId,
    pub user_id: String,
    frames: fmpsc::UnboundedSender<Result<String>>,
}

impl MockConnection {
    pub fn push_raw(&self, frame: &str) {
        let _ = self.frames.unbounded_send(Ok(frame.to_string()));
    }

    pub fn push_json(&self, frame: serde_json::Value) {
        self.push_raw(&frame.to_string());
    }

    pub fn push_message(&self, id: &str, sender: &str, content: &str, at: DateTime<Utc>) {
        self.push_json(serde_json::json!({
            "id": id,
            "senderId": sender,
            "content": content,
            "createdAt": at.to_rfc3339(),
        }));
    }

    /// Simulate the transport dropping mid-stream.
    pub fn fail(&self, reason: &str) {
        let _ = self
            .frames
            .unbounded_send(Err(SyncError::Transport(reason.to_string())));
    }
}

pub(crate) struct MockPush {
    script: Mutex<VecDeque<ConnectScript>>,
    connected_tx: mpsc::UnboundedSender<MockConnection>,
    connects: AtomicUsize,
}

impl MockPush {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockConnection>) {
        let (connected_tx, connected_rx) = mpsc::unbounded_channel();
        let push = Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            connected_tx,
            connects: AtomicUsize::new(0),
        });
        (push, connected_rx)
    }

    /// Queue outcomes for upcoming connect attempts. Unscripted attempts succeed.
    pub fn script(&self, outcome: ConnectScript) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushTransport for MockPush {
    async fn connect(
        &self,
        conversation_id: &ConversationId,
        user_id: &str,
    ) -> Result<FrameStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ConnectScript::Accept);

        match outcome {
            ConnectScript::Fail(reason) => Err(SyncError::Transport(reason)),
            ConnectScript::Accept => {
                let (frames, rx) = fmpsc::unbounded();
                let _ = self.connected_tx.send(MockConnection {
                    conversation_id: conversation_id.clone(),
                    user_id: user_id.to_string(),
                    frames,
                });
                Ok(rx.boxed())
            }
        }
    }
}

/// A durable write waiting for the test to answer it.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    pub conversation_id: ConversationId,
    pub content: String,
    pub receiver_id: Option<String>,
    respond: oneshot::Sender<Result<Message>>,
}

impl PendingWrite {
    /// Answer with a server record carrying `id`.
    pub fn succeed(self, id: &str, sender: &str) -> Message {
        let record = Message {
            id: id.to_string(),
            conversation_id: self.conversation_id.clone(),
            sender_id: sender.to_string(),
            receiver_id: self.receiver_id.clone(),
            content: self.content.clone(),
            created_at: Utc::now(),
            status: SendState::Confirmed,
            temp_id: None,
        };
        let _ = self.respond.send(Ok(record.clone()));
        record
    }

    pub fn fail(self, error: SyncError) {
        let _ = self.respond.send(Err(error));
    }
}

pub(crate) struct MockApi {
    writes_tx: mpsc::UnboundedSender<PendingWrite>,
    history: Mutex<Vec<Message>>,
}

impl MockApi {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PendingWrite>) {
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let api = Arc::new(Self {
            writes_tx,
            history: Mutex::new(Vec::new()),
        });
        (api, writes_rx)
    }

    pub fn set_history(&self, messages: Vec<Message>) {
        *self.history.lock().unwrap() = messages;
    }
}

#[async_trait]
impl MessageApi for MockApi {
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        receiver_id: Option<&str>,
    ) -> Result<Message> {
        let (respond, rx) = oneshot::channel();
        let _ = self.writes_tx.send(PendingWrite {
            conversation_id: conversation_id.clone(),
            content: content.to_string(),
            receiver_id: receiver_id.map(str::to_string),
            respond,
        });
        rx.await
            .unwrap_or_else(|_| Err(SyncError::Send("test dropped the write".into())))
    }

    async fn fetch_history(&self, _conversation_id: &ConversationId) -> Result<Vec<Message>> {
        Ok(self.history.lock().unwrap().clone())
    }
}

/// A manager wired to mocks, plus the test-side ends of every channel.
pub(crate) struct Harness {
    pub manager: ConversationChannelManager,
    pub push: Arc<MockPush>,
    pub api: Arc<MockApi>,
    pub connections: mpsc::UnboundedReceiver<MockConnection>,
    pub writes: mpsc::UnboundedReceiver<PendingWrite>,
    pub notices: broadcast::Receiver<ChannelNotice>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ChannelConfig) -> Self {
        let (push, connections) = MockPush::new();
        let (api, writes) = MockApi::new();
        let manager = ConversationChannelManager::new(push.clone(), api.clone(), config);
        let notices = manager.notices();
        Self {
            manager,
            push,
            api,
            connections,
            writes,
            notices,
        }
    }

    pub async fn next_connection(&mut self) -> MockConnection {
        recv(&mut self.connections).await
    }

    pub async fn next_write(&mut self) -> PendingWrite {
        recv(&mut self.writes).await
    }

    pub async fn next_notice(&mut self) -> ChannelNotice {
        tokio::time::timeout(WAIT, self.notices.recv())
            .await
            .expect("timed out waiting for notice")
            .expect("notice channel closed")
    }

    /// Open a conversation and wait for its connection to be accepted.
    pub async fn open(&mut self, conv: &ConversationId, user: &str) -> MockConnection {
        assert!(self.manager.open(conv, user).await);
        let conn = self.next_connection().await;
        assert_eq!(&conn.conversation_id, conv);
        conn
    }

    /// Register a listener forwarding every delivery to a channel.
    pub async fn collect(
        &self,
        conv: &ConversationId,
    ) -> (crate::types::ListenerId, mpsc::UnboundedReceiver<(Message, bool)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .manager
            .subscribe(conv, move |msg: &Message, replaced: bool| {
                let _ = tx.send((msg.clone(), replaced));
            })
            .await;
        (id, rx)
    }
}
