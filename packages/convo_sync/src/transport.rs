//! Network collaborators: the push stream and the durable write/history API.
//!
//! The manager only sees the two traits; `HttpTransport` implements both
//! over reqwest for a server exposing
//!
//! - `GET  {base}/conversations/{id}/stream?user_id={u}`: NDJSON push stream
//! - `POST {base}/conversations/{id}/messages`: `{ message, receiver_id }`
//! - `GET  {base}/conversations/{id}/messages`: history

use std::collections::VecDeque;
use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::{Result, SyncError};
use crate::framing::LineDecoder;
use crate::types::{ConversationId, Message};

/// Raw frames of one push connection, in arrival order.
///
/// `Err(SyncError::Transport)` or the end of the stream means the connection
/// dropped. Other errors are per-frame and the stream continues.
pub type FrameStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    /// Open a push subscription. Resolves once the server accepted it.
    async fn connect(&self, conversation_id: &ConversationId, user_id: &str)
    -> Result<FrameStream>;
}

#[async_trait]
pub trait MessageApi: Send + Sync + 'static {
    /// Persist an outbound message and return the server's record.
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        receiver_id: Option<&str>,
    ) -> Result<Message>;

    async fn fetch_history(&self, conversation_id: &ConversationId) -> Result<Vec<Message>>;
}

#[derive(Serialize)]
struct SendBody<'a> {
    message: &'a str,
    receiver_id: Option<&'a str>,
}

/// reqwest-backed implementation of both collaborators.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    auth_token: Option<String>,
    request_timeout: Duration,
    max_frame_bytes: usize,
}

impl HttpTransport {
    pub fn new(server: &ServerConfig, max_frame_bytes: usize) -> Result<Self> {
        let base_url = Url::parse(&server.base_url)
            .map_err(|e| SyncError::Config(format!("invalid base_url {}: {e}", server.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::Config(format!(
                "base_url {} cannot carry a path",
                server.base_url
            )));
        }

        // No overall timeout on the client: push streams are long-lived.
        // Request-response calls get `request_timeout` individually.
        let client = Client::builder()
            .connect_timeout(server.request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            auth_token: server.auth_token.clone(),
            request_timeout: server.request_timeout,
            max_frame_bytes,
        })
    }

    fn endpoint(&self, conversation_id: &ConversationId, leaf: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Config("base_url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(["conversations", conversation_id.as_str(), leaf]);
        Ok(url)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => req.header(AUTHORIZATION, format!("Bearer {token}")),
            None => req,
        }
    }
}

#[async_trait]
impl PushTransport for HttpTransport {
    async fn connect(
        &self,
        conversation_id: &ConversationId,
        user_id: &str,
    ) -> Result<FrameStream> {
        let url = self.endpoint(conversation_id, "stream")?;
        debug!(conversation = %conversation_id, url = %url, "opening push stream");

        let resp = self
            .authorize(self.client.get(url))
            .query(&[("user_id", user_id)])
            .header(ACCEPT, "application/x-ndjson")
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Transport(format!(
                "handshake rejected with {status}: {}",
                error_message(status, &body)
            )));
        }

        Ok(ndjson_lines(resp.bytes_stream(), self.max_frame_bytes))
    }
}

#[async_trait]
impl MessageApi for HttpTransport {
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        receiver_id: Option<&str>,
    ) -> Result<Message> {
        let url = self.endpoint(conversation_id, "messages")?;
        let resp = self
            .authorize(self.client.post(url))
            .timeout(self.request_timeout)
            .json(&SendBody {
                message: content,
                receiver_id,
            })
            .send()
            .await
            .map_err(|e| SyncError::Send(e.to_string()))?;

        let body = read_json(resp).await?;
        let record = unwrap_data(body);
        serde_json::from_value(record)
            .map_err(|e| SyncError::Send(format!("unexpected response body: {e}")))
    }

    async fn fetch_history(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let url = self.endpoint(conversation_id, "messages")?;
        let resp = self
            .authorize(self.client.get(url))
            .timeout(self.request_timeout)
            .send()
            .await?;

        let body = read_json(resp).await?;
        let records = unwrap_data(body);
        serde_json::from_value(records)
            .map_err(|e| SyncError::Frame(format!("unexpected history body: {e}")))
    }
}

/// Read a JSON body, turning non-2xx responses into `SyncError::Http`.
async fn read_json(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let text = resp.text().await.map_err(|e| SyncError::Send(e.to_string()))?;
    if !status.is_success() {
        return Err(SyncError::Http {
            status: status.as_u16(),
            message: error_message(status, &text),
        });
    }
    serde_json::from_str(&text).map_err(|e| SyncError::Send(format!("invalid JSON response: {e}")))
}

/// Servers may wrap payloads as `{ "data": … }`.
fn unwrap_data(body: Value) -> Value {
    match body {
        Value::Object(mut obj) if obj.contains_key("data") && !obj.contains_key("id") => {
            obj.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Best-effort human-readable error from a failed response body.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(body) {
        for key in ["error", "message", "detail"] {
            if let Some(Value::String(s)) = obj.get(key) {
                return s.clone();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}

/// Split a chunked byte stream into NDJSON lines.
///
/// A body error ends the stream with one `SyncError::Transport`; the final
/// unterminated line, if any, is flushed when the body ends cleanly.
pub fn ndjson_lines<S, B, E>(body: S, max_frame_bytes: usize) -> FrameStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    struct State<S> {
        body: std::pin::Pin<Box<S>>,
        decoder: LineDecoder,
        ready: VecDeque<Result<String>>,
        ended: bool,
    }

    let state = State {
        body: Box::pin(body),
        decoder: LineDecoder::new(max_frame_bytes),
        ready: VecDeque::new(),
        ended: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.ready.pop_front() {
                return Some((item, st));
            }
            if st.ended {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => st.ready.extend(st.decoder.push(chunk.as_ref())),
                Some(Err(e)) => {
                    st.ended = true;
                    st.ready.push_back(Err(SyncError::Transport(e.to_string())));
                }
                None => {
                    st.ended = true;
                    st.ready.extend(st.decoder.finish());
                }
            }
        }
    })
    .boxed()
}
