//! Message classifier: turns raw push frames into content messages.
//!
//! Frames are JSON objects. Protocol notices (connection acknowledgements,
//! keepalives) carry a reserved `type` and never reach listeners. Content
//! frames are either a flat message object or a `{"type":"message","data":{…}}`
//! envelope.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::types::Message;

/// `type` values that mark a frame as a protocol notice.
pub const SYSTEM_FRAME_TYPES: &[&str] = &["connection", "heartbeat", "ping", "pong"];

/// Classify one frame.
///
/// Returns `Ok(None)` for frames that carry no content (blank keepalive
/// lines, system notices) and `Err(SyncError::Frame)` for frames that
/// cannot be parsed. The caller drops both; neither affects later frames.
pub fn classify(frame: &str) -> Result<Option<Message>> {
    let frame = frame.trim();
    if frame.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(frame)?;
    let Value::Object(ref obj) = value else {
        return Err(SyncError::Frame(format!(
            "expected a JSON object, got {}",
            json_kind(&value)
        )));
    };

    let frame_type = obj.get("type").and_then(Value::as_str);
    if frame_type.is_some_and(is_system_type) {
        return Ok(None);
    }

    let message: Message = match (frame_type, obj.get("data")) {
        (Some(_), Some(data)) => Message::deserialize(data)?,
        _ => Message::deserialize(&value)?,
    };
    Ok(Some(message))
}

pub fn is_system_type(frame_type: &str) -> bool {
    SYSTEM_FRAME_TYPES.contains(&frame_type)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
